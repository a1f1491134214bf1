//! Service- and bucket-level handlers.

use std::collections::HashMap;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::errors::ApiError;
use crate::storage::{ListParams, Owner};
use crate::xml::{self, ObjectEntry};
use crate::S3Service;

/// Default page size for bucket listings.
const DEFAULT_MAX_KEYS: usize = 1000;

// -- Bucket name validation ---------------------------------------------------

/// Whether `name` is an acceptable bucket name.
///
/// Rules: 3-255 characters, starting with a lowercase letter or digit,
/// containing only lowercase letters, digits, `.`, `_` and `-`.  The
/// AWS rule against IP-address-shaped names is deliberately not
/// enforced; the real service does not check it either.
pub fn valid_bucket_name(name: &str) -> bool {
    if name.len() < 3 || name.len() > 255 {
        return false;
    }
    let first = name.as_bytes()[0];
    if !(first.is_ascii_lowercase() || first.is_ascii_digit()) {
        return false;
    }
    name.bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'.' || b == b'_' || b == b'-')
}

// -- Handlers -----------------------------------------------------------------

/// `GET /` -- list all buckets owned by the authenticated sender.
pub async fn list_buckets(svc: &S3Service, owner: &dyn Owner) -> Result<Response, ApiError> {
    let buckets = svc.storage.list_buckets(owner).await?;

    let entries: Vec<(String, std::time::SystemTime)> =
        buckets.into_iter().map(|b| (b.name, b.created)).collect();
    let body = xml::render_list_buckets_result(owner.id(), owner.name(), &entries);

    Ok((StatusCode::OK, [("content-type", "text/xml")], body).into_response())
}

/// `PUT /{bucket}` -- create a bucket.  Idempotent for the owner.
pub async fn create_bucket(
    svc: &S3Service,
    owner: &dyn Owner,
    bucket: &str,
) -> Result<Response, ApiError> {
    if !valid_bucket_name(bucket) {
        return Err(ApiError::BadRequest(format!(
            "invalid bucket name {bucket:?}"
        )));
    }
    svc.storage.create_bucket(owner, bucket).await?;
    Ok(StatusCode::OK.into_response())
}

/// `DELETE /{bucket}` -- delete an empty bucket.
pub async fn delete_bucket(
    svc: &S3Service,
    owner: &dyn Owner,
    bucket: &str,
) -> Result<Response, ApiError> {
    svc.storage.del_bucket(owner, bucket).await?;
    Ok(StatusCode::OK.into_response())
}

/// `HEAD /{bucket}` -- 200 when the bucket exists, 404 otherwise.
pub async fn check_bucket(
    svc: &S3Service,
    owner: &dyn Owner,
    bucket: &str,
) -> Result<Response, ApiError> {
    if svc.storage.check_bucket(owner, bucket).await? {
        Ok(StatusCode::OK.into_response())
    } else {
        Ok(StatusCode::NOT_FOUND.into_response())
    }
}

/// `GET /{bucket}` -- list objects with prefix/delimiter/marker paging.
pub async fn list_objects(
    svc: &S3Service,
    owner: &dyn Owner,
    bucket: &str,
    query: &HashMap<String, String>,
) -> Result<Response, ApiError> {
    let prefix = query.get("prefix").cloned().unwrap_or_default();
    let delimiter = query.get("delimiter").cloned().unwrap_or_default();
    let marker = query.get("marker").cloned().unwrap_or_default();
    // An absent or empty max-keys falls back to the default; only a
    // non-empty value that fails to parse is an error.
    let limit = match query.get("max-keys").map(String::as_str) {
        None | Some("") => DEFAULT_MAX_KEYS,
        Some(raw) => raw.parse().map_err(|e| {
            ApiError::BadRequest(format!("cannot parse max-keys value: {e}"))
        })?,
    };

    let params = ListParams {
        prefix: prefix.clone(),
        delimiter,
        marker: marker.clone(),
        limit,
        skip: 0,
    };
    let listing = svc.storage.list(owner, bucket, &params).await?;

    let entries: Vec<ObjectEntry<'_>> = listing
        .objects
        .iter()
        .map(|o| ObjectEntry {
            key: &o.key,
            size: o.size,
            owner_id: owner.id(),
            owner_display: owner.name(),
        })
        .collect();
    let body = xml::render_list_objects_result(
        bucket,
        &prefix,
        &marker,
        limit,
        listing.truncated,
        &entries,
        &listing.common_prefixes,
    );

    Ok((StatusCode::OK, [("content-type", "text/xml")], body).into_response())
}
