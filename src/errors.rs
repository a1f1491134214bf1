//! Request-level error types.
//!
//! Every failure a handler can produce maps onto one of the variants
//! here.  The enum implements [`axum::response::IntoResponse`] so
//! handlers simply return `Err(ApiError::NotFound)` and the dispatcher
//! renders the right status code.
//!
//! Unlike a conforming S3 service, error bodies are plain text and
//! failed requests carry `Connection: close`.  Auth failures are
//! reported as 400 rather than 403, matching the behavior clients of
//! this server already depend on.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::storage::StorageError;

/// Generate a 16-character uppercase hex request ID.
pub fn generate_request_id() -> String {
    let bytes: [u8; 8] = rand::random();
    hex::encode(bytes).to_uppercase()
}

/// Errors surfaced to HTTP clients.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Malformed URI, unsupported method at a level, bad form data,
    /// invalid bucket name, missing body, or a failed authentication.
    #[error("{0}")]
    BadRequest(String),

    /// Bucket or object absent.
    #[error("Not Found")]
    NotFound,

    /// The operation conflicts with current state (non-empty bucket).
    #[error("{0}")]
    Conflict(String),

    /// The blob cluster could not be reached after retries.
    #[error("{0}")]
    Unavailable(String),

    /// Unexpected backend error.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            // The conflict message ("cannot delete non-empty bucket")
            // surfaces with the backend's wording under a 500.
            ApiError::Conflict(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Unavailable(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound => ApiError::NotFound,
            StorageError::Conflict(msg) => ApiError::Conflict(msg),
            StorageError::Unavailable(msg) => ApiError::Unavailable(msg),
            StorageError::Other(e) => ApiError::Internal(e),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // 404s carry no body; everything else reports the reason as
        // plain text so curl users see what went wrong.
        let mut response = if status == StatusCode::NOT_FOUND {
            status.into_response()
        } else {
            (status, self.to_string()).into_response()
        };

        if status != StatusCode::NOT_FOUND {
            response
                .headers_mut()
                .insert(header::CONNECTION, HeaderValue::from_static("close"));
        }
        response
    }
}
