//! Abstract storage contract.
//!
//! The operation handlers speak to a backend only through [`Storage`]
//! and [`Owner`]; the two implementations ([`dir`] and [`cask`]) are
//! drop-in replacements for one another.  The trait methods are
//! manually desugared to pinned boxed futures so the trait stays
//! object-safe and backends can be selected at runtime.

use std::future::Future;
use std::pin::Pin;
use std::time::SystemTime;

use bytes::Bytes;
use futures::stream::BoxStream;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub mod cask;
pub mod dir;

/// Streamed object payload.
pub type ObjectStream = BoxStream<'static, std::io::Result<Bytes>>;

/// A principal: access key id, display name, and the ability to sign.
pub trait Owner: Send + Sync {
    /// Stable identifier; doubles as the access key.
    fn id(&self) -> &str;

    /// Display name shown in listings.
    fn name(&self) -> &str;

    /// HMAC-SHA1 of `data` under this owner's secret.
    fn sign(&self, data: &[u8]) -> Vec<u8>;
}

impl std::fmt::Debug for dyn Owner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Owner").field("id", &self.id()).finish()
    }
}

/// Backend failures, classified for HTTP translation.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Bucket or object absent; rendered as 404.
    #[error("Not Found")]
    NotFound,

    /// State conflict, e.g. deleting a non-empty bucket.
    #[error("{0}")]
    Conflict(String),

    /// The blob cluster stayed unreachable through the retry budget.
    #[error("{0}")]
    Unavailable(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// A bucket as reported by `list_buckets`.
#[derive(Debug, Clone)]
pub struct BucketInfo {
    pub name: String,
    pub created: SystemTime,
}

/// An object as reported by `list`.
#[derive(Debug, Clone)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    pub last_modified: SystemTime,
}

/// Listing query: prefix/delimiter/marker/limit plus a paging skip.
#[derive(Debug, Clone, Default)]
pub struct ListParams {
    pub prefix: String,
    pub delimiter: String,
    pub marker: String,
    pub limit: usize,
    pub skip: usize,
}

/// Result of a `list` call.
#[derive(Debug, Default)]
pub struct Listing {
    pub objects: Vec<ObjectInfo>,
    pub common_prefixes: Vec<String>,
    pub truncated: bool,
}

/// A retrieved object: stored filename, media type and the payload.
pub struct ObjectBody {
    pub filename: String,
    pub media: String,
    pub stream: ObjectStream,
}

impl std::fmt::Debug for ObjectBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectBody")
            .field("filename", &self.filename)
            .field("media", &self.media)
            .field("stream", &"<stream>")
            .finish()
    }
}

/// Backend contract used by the operation handlers.
///
/// The `ctx` token on the I/O-heavy operations is cancelled when the
/// server shuts down; retry loops consult it so handlers cannot wedge
/// behind an unreachable blob cluster.
pub trait Storage: Send + Sync + 'static {
    /// Resolve an access key to its [`Owner`].
    fn get_owner(
        &self,
        access_key: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Box<dyn Owner>, StorageError>> + Send + '_>>;

    /// List all buckets owned by `owner`.
    fn list_buckets(
        &self,
        owner: &dyn Owner,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<BucketInfo>, StorageError>> + Send + '_>>;

    /// Create a bucket; succeeds when the owner already has it.
    fn create_bucket(
        &self,
        owner: &dyn Owner,
        bucket: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), StorageError>> + Send + '_>>;

    /// Whether `owner` has a bucket with this name.
    fn check_bucket(
        &self,
        owner: &dyn Owner,
        bucket: &str,
    ) -> Pin<Box<dyn Future<Output = Result<bool, StorageError>> + Send + '_>>;

    /// Delete an empty bucket.
    fn del_bucket(
        &self,
        owner: &dyn Owner,
        bucket: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), StorageError>> + Send + '_>>;

    /// List a bucket's objects in key order with common-prefix roll-up.
    fn list(
        &self,
        owner: &dyn Owner,
        bucket: &str,
        params: &ListParams,
    ) -> Pin<Box<dyn Future<Output = Result<Listing, StorageError>> + Send + '_>>;

    /// Store an object, replacing any previous value for the key.
    #[allow(clippy::too_many_arguments)]
    fn put(
        &self,
        ctx: CancellationToken,
        owner: &dyn Owner,
        bucket: &str,
        key: &str,
        filename: &str,
        media: &str,
        body: Bytes,
    ) -> Pin<Box<dyn Future<Output = Result<(), StorageError>> + Send + '_>>;

    /// Retrieve an object.
    fn get(
        &self,
        ctx: CancellationToken,
        owner: &dyn Owner,
        bucket: &str,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = Result<ObjectBody, StorageError>> + Send + '_>>;

    /// Delete an object.
    fn del(
        &self,
        ctx: CancellationToken,
        owner: &dyn Owner,
        bucket: &str,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), StorageError>> + Send + '_>>;
}
