//! S3 XML response rendering.
//!
//! The two listing responses are XML-encoded; this module produces the
//! correct payloads using `quick-xml`.

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use std::io::Cursor;
use std::time::SystemTime;

const XMLNS: &str = "http://s3.amazonaws.com/doc/2006-03-01/";

// ── ListAllMyBucketsResult ──────────────────────────────────────────

/// Render the `<ListAllMyBucketsResult>` response for `GET /`.
///
/// `buckets` is a list of `(name, creation_time)` pairs.
pub fn render_list_buckets_result(
    owner_id: &str,
    owner_display: &str,
    buckets: &[(String, SystemTime)],
) -> String {
    let mut writer = Writer::new(Cursor::new(Vec::new()));

    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .expect("xml decl");

    let root =
        BytesStart::new("ListAllMyBucketsResult").with_attributes([("xmlns", XMLNS)]);
    writer.write_event(Event::Start(root)).expect("start root");

    write_simple_element_group(
        &mut writer,
        "Owner",
        &[("ID", owner_id), ("DisplayName", owner_display)],
    );

    writer
        .write_event(Event::Start(BytesStart::new("Buckets")))
        .expect("start Buckets");
    for (name, created) in buckets {
        write_simple_element_group(
            &mut writer,
            "Bucket",
            &[("Name", name), ("CreationDate", &iso8601(*created))],
        );
    }
    writer
        .write_event(Event::End(BytesEnd::new("Buckets")))
        .expect("end Buckets");

    writer
        .write_event(Event::End(BytesEnd::new("ListAllMyBucketsResult")))
        .expect("end root");

    String::from_utf8(writer.into_inner().into_inner()).expect("valid utf-8")
}

// ── ListBucketResult ────────────────────────────────────────────────

/// A single object entry inside a list-objects response.
pub struct ObjectEntry<'a> {
    pub key: &'a str,
    pub size: u64,
    pub owner_id: &'a str,
    pub owner_display: &'a str,
}

/// Render `<ListBucketResult>` for a bucket GET.
pub fn render_list_objects_result(
    bucket: &str,
    prefix: &str,
    marker: &str,
    max_keys: usize,
    is_truncated: bool,
    entries: &[ObjectEntry<'_>],
    common_prefixes: &[String],
) -> String {
    let mut writer = Writer::new(Cursor::new(Vec::new()));

    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .expect("xml decl");

    let root = BytesStart::new("ListBucketResult").with_attributes([("xmlns", XMLNS)]);
    writer.write_event(Event::Start(root)).expect("start root");

    write_text_element(&mut writer, "Name", bucket);
    write_text_element(&mut writer, "Prefix", prefix);
    write_text_element(&mut writer, "Marker", marker);
    write_text_element(&mut writer, "MaxKeys", &max_keys.to_string());
    write_text_element(
        &mut writer,
        "IsTruncated",
        if is_truncated { "true" } else { "false" },
    );

    for entry in entries {
        writer
            .write_event(Event::Start(BytesStart::new("Contents")))
            .expect("start Contents");
        write_text_element(&mut writer, "Key", entry.key);
        write_text_element(&mut writer, "Size", &entry.size.to_string());
        write_simple_element_group(
            &mut writer,
            "Owner",
            &[("ID", entry.owner_id), ("DisplayName", entry.owner_display)],
        );
        writer
            .write_event(Event::End(BytesEnd::new("Contents")))
            .expect("end Contents");
    }

    for cp in common_prefixes {
        writer
            .write_event(Event::Start(BytesStart::new("CommonPrefixes")))
            .expect("start CommonPrefixes");
        write_text_element(&mut writer, "Prefix", cp);
        writer
            .write_event(Event::End(BytesEnd::new("CommonPrefixes")))
            .expect("end CommonPrefixes");
    }

    writer
        .write_event(Event::End(BytesEnd::new("ListBucketResult")))
        .expect("end root");

    String::from_utf8(writer.into_inner().into_inner()).expect("valid utf-8")
}

// ── Timestamps ──────────────────────────────────────────────────────

/// Format a timestamp as ISO-8601 with millisecond precision.
pub fn iso8601(t: SystemTime) -> String {
    let since_epoch = t
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default();
    let secs = since_epoch.as_secs();
    let millis = since_epoch.subsec_millis();

    let days = secs / 86400;
    let day_secs = secs % 86400;
    let hours = day_secs / 3600;
    let minutes = (day_secs % 3600) / 60;
    let seconds = day_secs % 60;

    let (year, month, day) = days_to_ymd(days);

    format!(
        "{year:04}-{month:02}-{day:02}T{hours:02}:{minutes:02}:{seconds:02}.{millis:03}Z"
    )
}

/// Convert days since the Unix epoch to (year, month, day).
fn days_to_ymd(days: u64) -> (i64, u32, u32) {
    // Algorithm from http://howardhinnant.github.io/date_algorithms.html
    let z = days as i64 + 719468;
    let era = if z >= 0 { z } else { z - 146096 } / 146097;
    let doe = z - era * 146097;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = if m <= 2 { y + 1 } else { y };
    (y, m as u32, d as u32)
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Write a `<tag>text</tag>` element.
fn write_text_element(writer: &mut Writer<Cursor<Vec<u8>>>, tag: &str, text: &str) {
    writer
        .write_event(Event::Start(BytesStart::new(tag)))
        .expect("start tag");
    writer
        .write_event(Event::Text(BytesText::new(text)))
        .expect("text");
    writer
        .write_event(Event::End(BytesEnd::new(tag)))
        .expect("end tag");
}

/// Write a parent element containing a flat list of child text elements.
fn write_simple_element_group(
    writer: &mut Writer<Cursor<Vec<u8>>>,
    parent: &str,
    children: &[(&str, &str)],
) {
    writer
        .write_event(Event::Start(BytesStart::new(parent)))
        .expect("start parent");
    for (tag, value) in children {
        write_text_element(writer, tag, value);
    }
    writer
        .write_event(Event::End(BytesEnd::new(parent)))
        .expect("end parent");
}
