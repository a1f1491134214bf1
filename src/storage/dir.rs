//! Directory-hierarchy storage backend.
//!
//! Everything lives under a common root: the first level of
//! subdirectories are owners, the second are buckets, and each object
//! is a single file whose name encodes the object key, the original
//! filename and the media type as `b64url(key)#b64url(fn)#b64url(media)`.
//!
//! Every access key is implicitly an owner with an empty secret; this
//! makes the backend a convenient test double for the full service.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::SystemTime;

use base64::engine::general_purpose::URL_SAFE as B64URL;
use base64::Engine;
use bytes::Bytes;
use futures::StreamExt;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;

use crate::auth::hmac_sha1;
use crate::list_filter::ListFilter;
use crate::storage::{
    BucketInfo, ListParams, Listing, ObjectBody, ObjectInfo, Owner, Storage, StorageError,
};

/// An implicit owner; the id doubles as access key and display name.
pub struct DirOwner {
    id: String,
}

impl Owner for DirOwner {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.id
    }

    fn sign(&self, data: &[u8]) -> Vec<u8> {
        hmac_sha1(b"", data)
    }
}

/// Stores objects as files under `<root>/<owner>/<bucket>/`.
pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    /// Create a new store rooted at `root` (created if absent).
    pub fn new(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn bucket_dir(&self, owner_id: &str, bucket: &str) -> PathBuf {
        self.root.join(owner_id).join(bucket)
    }

    /// Locate the file holding `key`, if any.
    fn find_file(
        &self,
        owner_id: &str,
        bucket: &str,
        key: &str,
    ) -> Result<Option<PathBuf>, StorageError> {
        let dir = self.bucket_dir(owner_id, bucket);
        let entries = std::fs::read_dir(&dir).map_err(not_found_or_other)?;
        let prefix = format!("{}#", B64URL.encode(key));
        for entry in entries {
            let entry = entry.map_err(other)?;
            if entry.file_name().to_string_lossy().starts_with(&prefix) {
                return Ok(Some(entry.path()));
            }
        }
        Ok(None)
    }
}

fn encode_name(key: &str, filename: &str, media: &str) -> String {
    format!(
        "{}#{}#{}",
        B64URL.encode(key),
        B64URL.encode(filename),
        B64URL.encode(media)
    )
}

fn decode_name(name: &str) -> Option<(String, String, String)> {
    let mut parts = name.splitn(3, '#');
    let mut next = || {
        let part = parts.next()?;
        let bytes = B64URL.decode(part).ok()?;
        String::from_utf8(bytes).ok()
    };
    Some((next()?, next()?, next()?))
}

fn other(e: impl Into<anyhow::Error>) -> StorageError {
    StorageError::Other(e.into())
}

fn not_found_or_other(e: std::io::Error) -> StorageError {
    if e.kind() == std::io::ErrorKind::NotFound {
        StorageError::NotFound
    } else {
        StorageError::Other(e.into())
    }
}

impl Storage for DirStore {
    fn get_owner(
        &self,
        access_key: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Box<dyn Owner>, StorageError>> + Send + '_>> {
        let id = access_key.to_string();
        Box::pin(async move { Ok(Box::new(DirOwner { id }) as Box<dyn Owner>) })
    }

    fn list_buckets(
        &self,
        owner: &dyn Owner,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<BucketInfo>, StorageError>> + Send + '_>> {
        let dir = self.root.join(owner.id());
        Box::pin(async move {
            let entries = match std::fs::read_dir(&dir) {
                Ok(entries) => entries,
                // An owner that never created a bucket owns none.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Ok(Vec::new());
                }
                Err(e) => return Err(other(e)),
            };
            let mut buckets = Vec::new();
            for entry in entries {
                let entry = entry.map_err(other)?;
                if !entry.file_type().map_err(other)?.is_dir() {
                    continue;
                }
                let created = entry
                    .metadata()
                    .and_then(|m| m.modified())
                    .unwrap_or(SystemTime::UNIX_EPOCH);
                buckets.push(BucketInfo {
                    name: entry.file_name().to_string_lossy().into_owned(),
                    created,
                });
            }
            Ok(buckets)
        })
    }

    fn create_bucket(
        &self,
        owner: &dyn Owner,
        bucket: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), StorageError>> + Send + '_>> {
        let dir = self.bucket_dir(owner.id(), bucket);
        Box::pin(async move {
            std::fs::create_dir_all(&dir).map_err(other)?;
            Ok(())
        })
    }

    fn check_bucket(
        &self,
        owner: &dyn Owner,
        bucket: &str,
    ) -> Pin<Box<dyn Future<Output = Result<bool, StorageError>> + Send + '_>> {
        let dir = self.bucket_dir(owner.id(), bucket);
        Box::pin(async move { Ok(dir.is_dir()) })
    }

    fn del_bucket(
        &self,
        owner: &dyn Owner,
        bucket: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), StorageError>> + Send + '_>> {
        let dir = self.bucket_dir(owner.id(), bucket);
        Box::pin(async move {
            let mut entries = std::fs::read_dir(&dir).map_err(not_found_or_other)?;
            if entries.next().is_some() {
                return Err(StorageError::Conflict(
                    "cannot delete non-empty bucket".to_string(),
                ));
            }
            std::fs::remove_dir(&dir).map_err(other)?;
            Ok(())
        })
    }

    fn list(
        &self,
        owner: &dyn Owner,
        bucket: &str,
        params: &ListParams,
    ) -> Pin<Box<dyn Future<Output = Result<Listing, StorageError>> + Send + '_>> {
        let dir = self.bucket_dir(owner.id(), bucket);
        let params = params.clone();
        Box::pin(async move {
            let entries = std::fs::read_dir(&dir).map_err(not_found_or_other)?;

            // Decode and key-sort the whole bucket, then run the shared
            // listing filter over it.
            let mut records: Vec<(String, u64, SystemTime)> = Vec::new();
            for entry in entries {
                let entry = entry.map_err(other)?;
                let name = entry.file_name().to_string_lossy().into_owned();
                let Some((key, _, _)) = decode_name(&name) else {
                    continue;
                };
                let meta = entry.metadata().map_err(other)?;
                let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                records.push((key, meta.len(), modified));
            }
            records.sort_by(|a, b| a.0.cmp(&b.0));

            let mut filter = ListFilter::new(
                &params.prefix,
                &params.delimiter,
                &params.marker,
                params.limit,
                params.skip,
            );
            let mut objects = Vec::new();
            for (key, size, last_modified) in records {
                match filter.check(&key) {
                    None => break,
                    Some(false) => {}
                    Some(true) => objects.push(ObjectInfo {
                        key,
                        size,
                        last_modified,
                    }),
                }
            }
            let (common_prefixes, truncated) = filter.result();
            Ok(Listing {
                objects,
                common_prefixes,
                truncated,
            })
        })
    }

    fn put(
        &self,
        _ctx: CancellationToken,
        owner: &dyn Owner,
        bucket: &str,
        key: &str,
        filename: &str,
        media: &str,
        body: Bytes,
    ) -> Pin<Box<dyn Future<Output = Result<(), StorageError>> + Send + '_>> {
        let owner_id = owner.id().to_string();
        let bucket = bucket.to_string();
        let key = key.to_string();
        let name = encode_name(key.as_str(), filename, media);
        Box::pin(async move {
            let dir = self.bucket_dir(&owner_id, &bucket);
            if !dir.is_dir() {
                return Err(StorageError::NotFound);
            }
            // Full replacement: an earlier file for the same key may
            // carry a different filename or media type.
            if let Some(existing) = self.find_file(&owner_id, &bucket, &key)? {
                std::fs::remove_file(existing).map_err(other)?;
            }
            std::fs::write(dir.join(name), &body).map_err(other)?;
            Ok(())
        })
    }

    fn get(
        &self,
        _ctx: CancellationToken,
        owner: &dyn Owner,
        bucket: &str,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = Result<ObjectBody, StorageError>> + Send + '_>> {
        let owner_id = owner.id().to_string();
        let bucket = bucket.to_string();
        let key = key.to_string();
        Box::pin(async move {
            let Some(path) = self.find_file(&owner_id, &bucket, &key)? else {
                return Err(StorageError::NotFound);
            };
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let (_, filename, media) =
                decode_name(&name).ok_or_else(|| StorageError::Other(anyhow::anyhow!(
                    "undecodable object file name {name}"
                )))?;
            let file = tokio::fs::File::open(&path).await.map_err(other)?;
            Ok(ObjectBody {
                filename,
                media,
                stream: ReaderStream::new(file).boxed(),
            })
        })
    }

    fn del(
        &self,
        _ctx: CancellationToken,
        owner: &dyn Owner,
        bucket: &str,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), StorageError>> + Send + '_>> {
        let owner_id = owner.id().to_string();
        let bucket = bucket.to_string();
        let key = key.to_string();
        Box::pin(async move {
            let Some(path) = self.find_file(&owner_id, &bucket, &key)? else {
                return Err(StorageError::NotFound);
            };
            std::fs::remove_file(path).map_err(other)?;
            Ok(())
        })
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    fn owner(id: &str) -> DirOwner {
        DirOwner { id: id.to_string() }
    }

    async fn read_body(body: ObjectBody) -> Vec<u8> {
        let chunks: Vec<Bytes> = body.stream.try_collect().await.unwrap();
        chunks.concat()
    }

    #[test]
    fn test_name_encoding_roundtrip() {
        let name = encode_name("photos/cat 1.jpg", "cat 1.jpg", "image/jpeg");
        assert!(!name.contains('/'));
        let (key, filename, media) = decode_name(&name).unwrap();
        assert_eq!(key, "photos/cat 1.jpg");
        assert_eq!(filename, "cat 1.jpg");
        assert_eq!(media, "image/jpeg");
    }

    #[tokio::test]
    async fn test_put_get_del_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirStore::new(dir.path()).unwrap();
        let o = owner("test");
        let ctx = CancellationToken::new();

        store.create_bucket(&o, "docs").await.unwrap();
        store
            .put(
                ctx.clone(),
                &o,
                "docs",
                "report",
                "report.txt",
                "text/plain",
                Bytes::from_static(b"hello"),
            )
            .await
            .unwrap();

        let body = store.get(ctx.clone(), &o, "docs", "report").await.unwrap();
        assert_eq!(body.filename, "report.txt");
        assert_eq!(body.media, "text/plain");
        assert_eq!(read_body(body).await, b"hello");

        store.del(ctx.clone(), &o, "docs", "report").await.unwrap();
        let err = store.get(ctx, &o, "docs", "report").await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound));
    }

    #[tokio::test]
    async fn test_put_replaces_previous_object() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirStore::new(dir.path()).unwrap();
        let o = owner("test");
        let ctx = CancellationToken::new();

        store.create_bucket(&o, "docs").await.unwrap();
        for (filename, contents) in [("a.txt", "one"), ("b.txt", "two")] {
            store
                .put(
                    ctx.clone(),
                    &o,
                    "docs",
                    "k",
                    filename,
                    "text/plain",
                    Bytes::from(contents),
                )
                .await
                .unwrap();
        }

        let body = store.get(ctx.clone(), &o, "docs", "k").await.unwrap();
        assert_eq!(body.filename, "b.txt");
        assert_eq!(read_body(body).await, b"two");

        // Exactly one file remains in the bucket.
        let listing = store
            .list(&o, "docs", &ListParams { limit: 100, ..Default::default() })
            .await
            .unwrap();
        assert_eq!(listing.objects.len(), 1);
    }

    #[tokio::test]
    async fn test_bucket_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirStore::new(dir.path()).unwrap();
        let o = owner("test");

        assert!(store.list_buckets(&o).await.unwrap().is_empty());
        store.create_bucket(&o, "a").await.unwrap();
        store.create_bucket(&o, "b").await.unwrap();
        assert!(store.check_bucket(&o, "a").await.unwrap());

        let mut names: Vec<String> = store
            .list_buckets(&o)
            .await
            .unwrap()
            .into_iter()
            .map(|b| b.name)
            .collect();
        names.sort();
        assert_eq!(names, vec!["a", "b"]);

        store.del_bucket(&o, "a").await.unwrap();
        assert!(!store.check_bucket(&o, "a").await.unwrap());
        assert!(matches!(
            store.del_bucket(&o, "a").await.unwrap_err(),
            StorageError::NotFound
        ));
    }

    #[tokio::test]
    async fn test_del_bucket_non_empty_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirStore::new(dir.path()).unwrap();
        let o = owner("test");
        let ctx = CancellationToken::new();

        store.create_bucket(&o, "docs").await.unwrap();
        store
            .put(ctx, &o, "docs", "k", "f", "text/plain", Bytes::from_static(b"x"))
            .await
            .unwrap();
        assert!(matches!(
            store.del_bucket(&o, "docs").await.unwrap_err(),
            StorageError::Conflict(_)
        ));
    }

    #[tokio::test]
    async fn test_list_with_delimiter() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirStore::new(dir.path()).unwrap();
        let o = owner("test");
        let ctx = CancellationToken::new();

        store.create_bucket(&o, "docs").await.unwrap();
        for key in ["a/1", "a/2", "a/sub/3", "b/1"] {
            store
                .put(
                    ctx.clone(),
                    &o,
                    "docs",
                    key,
                    "f",
                    "text/plain",
                    Bytes::from_static(b"x"),
                )
                .await
                .unwrap();
        }

        let listing = store
            .list(
                &o,
                "docs",
                &ListParams {
                    delimiter: "/".to_string(),
                    limit: 100,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(listing.objects.is_empty());
        assert_eq!(listing.common_prefixes, vec!["a/", "b/"]);
        assert!(!listing.truncated);
    }

    #[tokio::test]
    async fn test_put_into_missing_bucket_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirStore::new(dir.path()).unwrap();
        let err = store
            .put(
                CancellationToken::new(),
                &owner("test"),
                "nope",
                "k",
                "f",
                "text/plain",
                Bytes::from_static(b"x"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::NotFound));
    }
}
