//! Object-level handlers.

use std::collections::HashMap;

use axum::body::Body;
use axum::extract::{FromRequest, Multipart, Request};
use axum::http::{header::HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;

use crate::errors::ApiError;
use crate::storage::Owner;
use crate::S3Service;

/// Query parameters a GET may use to override response headers.
const RESPONSE_OVERRIDES: &[(&str, &str)] = &[
    ("response-content-type", "content-type"),
    ("response-content-language", "content-language"),
    ("response-expires", "expires"),
    ("response-cache-control", "cache-control"),
    ("response-content-disposition", "content-disposition"),
    ("response-content-encoding", "content-encoding"),
];

/// `GET /{bucket}/{key}` -- stream an object back to the client.
pub async fn get_object(
    svc: &S3Service,
    owner: &dyn Owner,
    bucket: &str,
    key: &str,
    query: &HashMap<String, String>,
) -> Result<Response, ApiError> {
    let ctx = svc.shutdown.child_token();
    let object = svc.storage.get(ctx, owner, bucket, key).await?;

    let mut response = Response::new(Body::from_stream(object.stream));
    let headers = response.headers_mut();
    if let Ok(v) = HeaderValue::from_str(&object.media) {
        headers.insert("content-type", v);
    }
    if let Ok(v) =
        HeaderValue::from_str(&format!("inline; filename=\"{}\"", object.filename))
    {
        headers.insert("content-disposition", v);
    }

    for (param, header) in RESPONSE_OVERRIDES {
        if let Some(value) = query.get(*param) {
            if let Ok(v) = HeaderValue::from_str(value) {
                headers.insert(HeaderName::from_static(header), v);
            }
        }
    }

    Ok(response)
}

/// `PUT`/`POST /{bucket}/{key}` -- store an object.
///
/// A PUT takes the media type from `Content-Type` and the filename
/// from the `filename=` parameter of `Content-Disposition`; a POST is
/// a browser form upload whose `file` part supplies both.
pub async fn put_object(
    svc: &S3Service,
    owner: &dyn Owner,
    bucket: &str,
    key: &str,
    req: Request,
) -> Result<Response, ApiError> {
    let (filename, media, body) = if req.method() == Method::POST {
        read_form_file(req).await?
    } else {
        let media = header_string(&req, "content-type");
        let filename = req
            .headers()
            .get("content-disposition")
            .and_then(|v| v.to_str().ok())
            .and_then(disposition_filename)
            .unwrap_or_default();
        let body = axum::body::to_bytes(req.into_body(), usize::MAX)
            .await
            .map_err(|e| ApiError::BadRequest(format!("cannot read body: {e}")))?;
        (filename, media, body)
    };

    let ctx = svc.shutdown.child_token();
    svc.storage
        .put(ctx, owner, bucket, key, &filename, &media, body)
        .await
        .map_err(|e| match e {
            crate::storage::StorageError::NotFound => ApiError::NotFound,
            e => ApiError::Internal(anyhow::anyhow!(
                "error while storing {filename} in {bucket}/{key}: {e}"
            )),
        })?;
    Ok(StatusCode::OK.into_response())
}

/// `DELETE /{bucket}/{key}` -- remove an object.
pub async fn delete_object(
    svc: &S3Service,
    owner: &dyn Owner,
    bucket: &str,
    key: &str,
) -> Result<Response, ApiError> {
    let ctx = svc.shutdown.child_token();
    svc.storage
        .del(ctx, owner, bucket, key)
        .await
        .map_err(|e| {
            ApiError::Internal(anyhow::anyhow!("error deleting {bucket}/{key}: {e}"))
        })?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

// -- Request body helpers -----------------------------------------------------

/// Pull the `file` part out of a multipart form upload.
async fn read_form_file(req: Request) -> Result<(String, String, Bytes), ApiError> {
    let mut multipart = Multipart::from_request(req, &())
        .await
        .map_err(|e| ApiError::BadRequest(format!("cannot parse form values: {e}")))?;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("cannot parse form values: {e}")))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field.file_name().unwrap_or_default().to_string();
        let media = field.content_type().unwrap_or_default().to_string();
        let body = field
            .bytes()
            .await
            .map_err(|e| ApiError::BadRequest(format!("cannot read form file: {e}")))?;
        return Ok((filename, media, body));
    }
    Err(ApiError::BadRequest("no file form field".to_string()))
}

/// Extract the `filename=` parameter from a Content-Disposition value.
fn disposition_filename(disposition: &str) -> Option<String> {
    for param in disposition.split(';').skip(1) {
        let param = param.trim();
        if let Some(value) = param.strip_prefix("filename=") {
            return Some(value.trim_matches('"').to_string());
        }
    }
    None
}

fn header_string(req: &Request, name: &str) -> String {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}
