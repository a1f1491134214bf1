//! s3cask library -- S3-compatible object storage front-end.
//!
//! This crate provides the pieces for running an S3-compatible server:
//! signature-v2 request authentication, the virtual-host/path-style
//! router, the resource operation handlers, and two pluggable storage
//! backends (a directory hierarchy and the volume-cluster "cask"
//! backend).

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

pub mod auth;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod list_filter;
pub mod server;
pub mod storage;
pub mod xml;

use crate::storage::Storage;

/// One S3 service instance: the configured FQDN, its backend, and the
/// shutdown token request-scoped cancellation tokens derive from.
///
/// The storage is passed in explicitly (rather than through a global
/// binding) so several services can coexist in one process and tests
/// can substitute doubles.
pub struct S3Service {
    /// FQDN used to tell virtual-host from path-style addressing.
    pub service_host: String,
    /// The storage backend.
    pub storage: Arc<dyn Storage>,
    /// Cancelled when the server shuts down; in-flight blob-cluster
    /// retries observe it and give up.
    pub shutdown: CancellationToken,
}

impl S3Service {
    pub fn new(service_host: impl Into<String>, storage: Arc<dyn Storage>) -> Self {
        Self {
            service_host: service_host.into(),
            storage,
            shutdown: CancellationToken::new(),
        }
    }
}
