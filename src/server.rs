//! Axum router construction and request dispatch.
//!
//! S3 routes cannot be expressed as axum path routes: in virtual-host
//! style the bucket arrives in the Host header, not the path.  The
//! router is therefore a single fallback handler that classifies every
//! request as service / bucket / object level, authenticates the
//! sender, and dispatches to the matching operation handler.
//!
//! Addressing modes:
//! - **Virtual-host style**: Host is `<bucket>.<service_host>`; the URI
//!   path (leading `/` stripped) is the object key.
//! - **Path style**: Host equals `service_host`; the first path segment
//!   is the bucket, the rest the key.  `/<bucket>` and `/<bucket>/`
//!   are both bucket level.
//!
//! A bucket-level POST is routed to the object handler with an empty
//! key; browser form uploads use it.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{header, HeaderValue, Method};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::Router;
use tracing::debug;

use crate::auth;
use crate::errors::{generate_request_id, ApiError};
use crate::handlers;
use crate::storage::Owner;
use crate::S3Service;

/// Build the axum [`Router`].  The returned router is ready to be
/// passed to `axum::serve`.
pub fn app(svc: Arc<S3Service>) -> Router {
    Router::new()
        .fallback(dispatch)
        .with_state(svc)
        .layer(middleware::from_fn(common_headers_middleware))
}

// -- Common headers middleware -----------------------------------------------

/// Adds standard response headers to every response:
/// - `x-amz-request-id`: 16-character uppercase hex string
/// - `Date`: RFC 7231 formatted timestamp
/// - `Server`: `s3cask`
async fn common_headers_middleware(req: Request, next: Next) -> Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();

    if !headers.contains_key("x-amz-request-id") {
        let request_id = generate_request_id();
        headers.insert(
            "x-amz-request-id",
            HeaderValue::from_str(&request_id).expect("hex request id"),
        );
    }

    let date = httpdate::fmt_http_date(std::time::SystemTime::now());
    headers.insert("date", HeaderValue::from_str(&date).expect("http date"));
    headers.insert("server", HeaderValue::from_static("s3cask"));

    response
}

// -- Request classification ---------------------------------------------------

/// The resource a request addresses.
#[derive(Debug, PartialEq)]
enum Resource {
    Service,
    Bucket(String),
    Object { bucket: String, key: String },
}

fn strip_port(host: &str) -> &str {
    match host.find(':') {
        Some(i) => &host[..i],
        None => host,
    }
}

/// Classify by Host header and URI path.
fn classify(host: &str, path: &str, service_host: &str) -> Result<Resource, ApiError> {
    let host = strip_port(host);
    let fqdn = strip_port(service_host);

    if host == fqdn {
        // Path style.
        if path == "/" {
            return Ok(Resource::Service);
        }
        let rest = &path[1..];
        return Ok(match rest.split_once('/') {
            None => Resource::Bucket(rest.to_string()),
            Some((bucket, "")) => Resource::Bucket(bucket.to_string()),
            Some((bucket, key)) => Resource::Object {
                bucket: bucket.to_string(),
                key: key.to_string(),
            },
        });
    }

    // Virtual-host style: the bucket is the leading subdomain label.
    let Some(bucket) = host.strip_suffix(fqdn).and_then(|p| p.strip_suffix('.')) else {
        return Err(ApiError::BadRequest(format!("bad host {host}")));
    };
    let key = &path[1..];
    if key.is_empty() {
        Ok(Resource::Bucket(bucket.to_string()))
    } else {
        Ok(Resource::Object {
            bucket: bucket.to_string(),
            key: key.to_string(),
        })
    }
}

/// Parse a raw query string into a map of percent-decoded pairs.
fn parse_query(raw: Option<&str>) -> HashMap<String, String> {
    let mut map = HashMap::new();
    if let Some(qs) = raw {
        for part in qs.split('&') {
            if part.is_empty() {
                continue;
            }
            let (k, v) = part.split_once('=').unwrap_or((part, ""));
            map.insert(decode(k), decode(v));
        }
    }
    map
}

fn decode(s: &str) -> String {
    percent_encoding::percent_decode_str(s)
        .decode_utf8_lossy()
        .into_owned()
}

// -- Dispatch ------------------------------------------------------------------

async fn dispatch(State(svc): State<Arc<S3Service>>, req: Request) -> Response {
    match route(svc, req).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn route(svc: Arc<S3Service>, req: Request) -> Result<Response, ApiError> {
    let uri = req.uri().clone();
    let method = req.method().clone();

    let host = req
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| uri.authority().map(|a| a.to_string()))
        .unwrap_or_default();

    // Pre-validation.
    if uri.path().is_empty() || uri.path() == "*" || host.is_empty() {
        return Err(ApiError::BadRequest("bad URI".to_string()));
    }

    let resource = classify(&host, uri.path(), &svc.service_host)?;
    debug!(%method, %host, path = uri.path(), ?resource, "dispatch");

    let query = parse_query(uri.query());

    // Method-at-level validation happens before authentication so the
    // error message names the level rather than the missing signature.
    let allowed = match &resource {
        Resource::Service => method == Method::GET,
        Resource::Bucket(_) => {
            matches!(method.as_str(), "DELETE" | "GET" | "HEAD" | "PUT" | "POST")
        }
        Resource::Object { .. } => {
            matches!(method.as_str(), "DELETE" | "GET" | "PUT" | "POST")
        }
    };
    if !allowed {
        let message = match &resource {
            Resource::Service => "only GET allowed at service level",
            Resource::Bucket(_) => "only DELETE, GET, HEAD and PUT allowed at bucket level",
            Resource::Object { .. } => "only DELETE, GET, PUT and POST allowed at object level",
        };
        return Err(ApiError::BadRequest(message.to_string()));
    }

    let (parts, body) = req.into_parts();
    let owner: Box<dyn Owner> = auth::authenticate(
        svc.storage.as_ref(),
        &svc.service_host,
        &parts.method,
        &host,
        &parts.uri,
        &parts.headers,
    )
    .await
    .map_err(|e| ApiError::BadRequest(format!("error getting owner: {e}")))?;

    match resource {
        Resource::Service => handlers::bucket::list_buckets(&svc, owner.as_ref()).await,
        Resource::Bucket(bucket) => {
            if method == Method::POST {
                // Browser form upload; the form's file part names the key
                // implicitly, the object key itself is empty.
                let req = Request::from_parts(parts, body);
                return handlers::object::put_object(&svc, owner.as_ref(), &bucket, "", req)
                    .await;
            }
            match method.as_str() {
                "GET" => {
                    handlers::bucket::list_objects(&svc, owner.as_ref(), &bucket, &query).await
                }
                "PUT" => handlers::bucket::create_bucket(&svc, owner.as_ref(), &bucket).await,
                "DELETE" => handlers::bucket::delete_bucket(&svc, owner.as_ref(), &bucket).await,
                _ => handlers::bucket::check_bucket(&svc, owner.as_ref(), &bucket).await,
            }
        }
        Resource::Object { bucket, key } => match method.as_str() {
            "GET" => {
                handlers::object::get_object(&svc, owner.as_ref(), &bucket, &key, &query).await
            }
            "PUT" | "POST" => {
                let req = Request::from_parts(parts, body);
                handlers::object::put_object(&svc, owner.as_ref(), &bucket, &key, req).await
            }
            _ => handlers::object::delete_object(&svc, owner.as_ref(), &bucket, &key).await,
        },
    }
}

// -- Tests ---------------------------------------------------------------------
