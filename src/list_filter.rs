//! Bucket-listing filter: prefix, delimiter, marker, limit and skip.
//!
//! Backends iterate their keys in byte order and feed each key to
//! [`ListFilter::check`].  The filter decides whether the key is
//! emitted as an object, rolled up into a common prefix, or skipped,
//! and signals when the page is full.

/// Stateful filter applied to one listing request.
pub struct ListFilter {
    prefix: String,
    delimiter: String,
    marker: String,
    limit: usize,
    skip: usize,
    skipped: usize,
    emitted: usize,
    common_prefixes: Vec<String>,
    truncated: bool,
}

impl ListFilter {
    pub fn new(prefix: &str, delimiter: &str, marker: &str, limit: usize, skip: usize) -> Self {
        Self {
            prefix: prefix.to_string(),
            delimiter: delimiter.to_string(),
            marker: marker.to_string(),
            limit,
            skip,
            skipped: 0,
            emitted: 0,
            common_prefixes: Vec::new(),
            truncated: false,
        }
    }

    /// Decide the fate of `key`.
    ///
    /// Returns `Some(true)` when the caller should emit the object,
    /// `Some(false)` when the key is filtered out (below the marker,
    /// outside the prefix, consumed by `skip`, or rolled up into a
    /// common prefix), and `None` once the page is full -- the caller
    /// must stop iterating, and the result is marked truncated because
    /// at least this key remained.
    pub fn check(&mut self, key: &str) -> Option<bool> {
        if self.emitted + self.common_prefixes.len() >= self.limit {
            self.truncated = true;
            return None;
        }

        // Keys at or below the marker were returned on earlier pages.
        if !self.marker.is_empty() && key < self.marker.as_str() {
            return Some(false);
        }
        if !key.starts_with(&self.prefix) {
            return Some(false);
        }
        if self.skipped < self.skip {
            self.skipped += 1;
            return Some(false);
        }

        if !self.delimiter.is_empty() {
            let tail = &key[self.prefix.len()..];
            if let Some(i) = tail.find(&self.delimiter) {
                let common = &tail[..i + self.delimiter.len()];
                if !self.common_prefixes.iter().any(|p| p == common) {
                    self.common_prefixes.push(common.to_string());
                }
                return Some(false);
            }
        }

        self.emitted += 1;
        Some(true)
    }

    /// Consume the filter, returning the rolled-up common prefixes (in
    /// insertion order) and whether the listing was truncated.
    pub fn result(self) -> (Vec<String>, bool) {
        (self.common_prefixes, self.truncated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Run `keys` through a filter, returning (emitted, prefixes, truncated).
    fn run(
        keys: &[&str],
        prefix: &str,
        delimiter: &str,
        marker: &str,
        limit: usize,
    ) -> (Vec<String>, Vec<String>, bool) {
        let mut filter = ListFilter::new(prefix, delimiter, marker, limit, 0);
        let mut emitted = Vec::new();
        for key in keys {
            match filter.check(key) {
                None => break,
                Some(true) => emitted.push(key.to_string()),
                Some(false) => {}
            }
        }
        let (prefixes, truncated) = filter.result();
        (emitted, prefixes, truncated)
    }

    #[test]
    fn test_delimiter_rolls_up_everything() {
        let (objects, prefixes, truncated) =
            run(&["a/1", "a/2", "a/sub/3", "b/1"], "", "/", "", 100);
        assert!(objects.is_empty());
        assert_eq!(prefixes, vec!["a/", "b/"]);
        assert!(!truncated);
    }

    #[test]
    fn test_no_delimiter_emits_all() {
        let (objects, prefixes, truncated) = run(&["a/1", "a/2", "b"], "", "", "", 100);
        assert_eq!(objects, vec!["a/1", "a/2", "b"]);
        assert!(prefixes.is_empty());
        assert!(!truncated);
    }

    #[test]
    fn test_prefix_with_delimiter() {
        let (objects, prefixes, _) =
            run(&["a/1", "a/2", "a/sub/3", "b/1"], "a/", "/", "", 100);
        assert_eq!(objects, vec!["a/1", "a/2"]);
        assert_eq!(prefixes, vec!["sub/"]);
    }

    #[test]
    fn test_marker_skips_earlier_keys() {
        let (objects, _, truncated) = run(&["a", "b", "c", "d"], "", "", "c", 100);
        assert_eq!(objects, vec!["c", "d"]);
        assert!(!truncated);
    }

    #[test]
    fn test_limit_truncates() {
        let (objects, _, truncated) = run(&["a", "b", "c", "d"], "", "", "", 2);
        assert_eq!(objects, vec!["a", "b"]);
        assert!(truncated);
    }

    #[test]
    fn test_limit_exact_fit_not_truncated() {
        let (objects, _, truncated) = run(&["a", "b"], "", "", "", 2);
        assert_eq!(objects, vec!["a", "b"]);
        assert!(!truncated);
    }

    #[test]
    fn test_common_prefixes_count_toward_limit() {
        let (objects, prefixes, truncated) =
            run(&["a/1", "b/1", "c/1", "d"], "", "/", "", 2);
        assert!(objects.is_empty());
        assert_eq!(prefixes, vec!["a/", "b/"]);
        assert!(truncated);
    }

    #[test]
    fn test_skip_consumes_matches() {
        let mut filter = ListFilter::new("", "", "", 100, 2);
        assert_eq!(filter.check("a"), Some(false));
        assert_eq!(filter.check("b"), Some(false));
        assert_eq!(filter.check("c"), Some(true));
    }

    #[test]
    fn test_emitted_keys_respect_all_bounds() {
        // Every emitted key begins with the prefix, is >= marker, and
        // has no delimiter after the prefix.
        let keys = ["p/a", "p/b", "p/q/x", "p/z", "zz"];
        let (objects, prefixes, _) = run(&keys, "p/", "/", "p/b", 100);
        for key in &objects {
            assert!(key.starts_with("p/"));
            assert!(key.as_str() >= "p/b");
            assert!(!key["p/".len()..].contains('/'));
        }
        assert_eq!(objects, vec!["p/b", "p/z"]);
        assert_eq!(prefixes, vec!["q/"]);
    }
}
