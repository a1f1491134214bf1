//! Volume-cluster HTTP client.
//!
//! The cluster exposes a master node for placement decisions and
//! volume nodes for payload I/O:
//!
//! - `GET <master>/dir/assign` allocates a `fid` and names the volume
//!   node to upload to.
//! - `GET <master>/dir/lookup?volumeId=<vid>` resolves the volume node
//!   currently serving a fid (the `vid` is the fid up to the first `,`).
//! - `POST/GET/DELETE http://<publicUrl>/<fid>` move the payload.
//!
//! Every call retries on transport errors and non-2xx statuses with a
//! fixed one-second backoff; the upload nests its budgets, giving each
//! upload attempt a full transport-retry allowance of its own.  The
//! backoff sleeps race the cancellation token so a cluster outage
//! cannot wedge a request handler forever.

use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::storage::{ObjectStream, StorageError};

/// Attempts for master lookups and blob GET/DELETE.
const GET_ATTEMPTS: u32 = 10;

/// Transport attempts for a single upload POST.
const POST_ATTEMPTS: u32 = 10;

/// Outer attempts for the payload upload; each wraps its own
/// [`POST_ATTEMPTS`] transport retries.
const UPLOAD_ATTEMPTS: u32 = 3;

const BACKOFF: Duration = Duration::from_secs(1);

/// `{"count":1,"fid":"3,01637037d6","url":"127.0.0.1:8080","publicUrl":"localhost:8080"}`
#[derive(Debug, Clone, Deserialize)]
pub struct AssignResponse {
    #[serde(default)]
    pub count: u32,
    #[serde(default)]
    pub fid: String,
    #[serde(default)]
    pub url: String,
    #[serde(default, rename = "publicUrl")]
    pub public_url: String,
}

#[derive(Debug, Deserialize)]
struct LookupResponse {
    #[serde(default)]
    locations: Vec<Location>,
}

#[derive(Debug, Deserialize)]
struct Location {
    #[serde(default, rename = "publicUrl")]
    public_url: String,
    #[serde(default)]
    #[allow(dead_code)]
    url: String,
}

/// Client for one cluster master and its volume nodes.
pub struct MasterClient {
    master_url: String,
    client: reqwest::Client,
}

impl MasterClient {
    pub fn new(master_url: &str) -> Self {
        Self {
            master_url: ensure_http(master_url),
            client: reqwest::Client::new(),
        }
    }

    /// Ask the master for a fresh fid and upload target.
    pub async fn assign(&self, ctx: &CancellationToken) -> Result<AssignResponse, StorageError> {
        let url = format!("{}/dir/assign", self.master_url);
        let resp = self.get_with_retry(ctx, &url).await?;
        let assign: AssignResponse = resp
            .json()
            .await
            .map_err(|e| StorageError::Unavailable(format!("error decoding response: {e}")))?;
        if assign.fid.is_empty() {
            return Err(StorageError::Unavailable("no file id!".to_string()));
        }
        Ok(assign)
    }

    /// Resolve the URL a fid can currently be fetched from.
    pub async fn locate(&self, ctx: &CancellationToken, fid: &str) -> Result<String, StorageError> {
        let vid = match fid.find(',') {
            Some(i) if i > 0 => &fid[..i],
            _ => fid,
        };
        let url = format!("{}/dir/lookup?volumeId={}", self.master_url, vid);
        let resp = self.get_with_retry(ctx, &url).await?;
        let lookup: LookupResponse = resp
            .json()
            .await
            .map_err(|e| StorageError::Unavailable(format!("error decoding response: {e}")))?;
        match lookup.locations.first() {
            Some(loc) if !loc.public_url.is_empty() => {
                Ok(format!("{}/{}", ensure_http(&loc.public_url), fid))
            }
            _ => Err(StorageError::Unavailable(format!(
                "no public url for {vid}"
            ))),
        }
    }

    /// Upload a payload to the volume node chosen by [`assign`].
    ///
    /// The body goes up as `multipart/form-data` under the field name
    /// `file`, carrying the original filename and media type.  The
    /// volume node acknowledges with a JSON body starting `{"size":`.
    ///
    /// Retries are nested: each outer attempt POSTs with its own
    /// transport-retry budget, so a dropped connection does not count
    /// against the outer budget; only a non-2xx status or a malformed
    /// response body does.
    pub async fn upload(
        &self,
        ctx: &CancellationToken,
        assign: &AssignResponse,
        filename: &str,
        media: &str,
        body: Bytes,
    ) -> Result<(), StorageError> {
        let url = format!("{}/{}", ensure_http(&assign.public_url), assign.fid);
        let media = if media.is_empty() {
            "application/octet-stream"
        } else {
            media
        };

        let mut last = String::new();
        for attempt in 0..UPLOAD_ATTEMPTS {
            if attempt > 0 {
                self.backoff(ctx).await?;
            }

            let resp = self.post_with_retry(ctx, &url, filename, media, &body).await?;
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            if !status.is_success() {
                last = format!("errorcode={} message={}", status.as_u16(), text);
            } else if !text.starts_with(r#"{"size":"#) {
                last = format!("no size in response {text}");
            } else {
                return Ok(());
            }
            warn!(%url, attempt, "upload failed: {last}");
        }
        Err(StorageError::Unavailable(last))
    }

    /// POST the multipart payload, retrying transport failures.  Any
    /// response that arrives, whatever its status, is handed back for
    /// the caller to judge.
    async fn post_with_retry(
        &self,
        ctx: &CancellationToken,
        url: &str,
        filename: &str,
        media: &str,
        body: &Bytes,
    ) -> Result<reqwest::Response, StorageError> {
        let mut last = String::new();
        for attempt in 0..POST_ATTEMPTS {
            if attempt > 0 {
                self.backoff(ctx).await?;
            }

            let part = reqwest::multipart::Part::bytes(body.to_vec())
                .file_name(filename.to_string())
                .mime_str(media)
                .map_err(|e| StorageError::Other(e.into()))?;
            let form = reqwest::multipart::Form::new().part("file", part);

            match self.client.post(url).multipart(form).send().await {
                Ok(resp) => return Ok(resp),
                Err(e) => last = format!("error POSTing to {url}: {e}"),
            }
            warn!(%url, attempt, "request failed: {last}");
        }
        Err(StorageError::Unavailable(last))
    }

    /// Stream a blob's bytes.
    pub async fn download(
        &self,
        ctx: &CancellationToken,
        fid: &str,
    ) -> Result<ObjectStream, StorageError> {
        let url = self.locate(ctx, fid).await?;
        let resp = self.get_with_retry(ctx, &url).await?;
        Ok(resp
            .bytes_stream()
            .map(|chunk| chunk.map_err(std::io::Error::other))
            .boxed())
    }

    /// Remove a blob from the cluster.
    pub async fn delete(&self, ctx: &CancellationToken, fid: &str) -> Result<(), StorageError> {
        let url = self.locate(ctx, fid).await?;
        let mut last = String::new();
        for attempt in 0..GET_ATTEMPTS {
            if attempt > 0 {
                self.backoff(ctx).await?;
            }
            match self.client.delete(&url).send().await {
                Err(e) => last = format!("error with DELETE {url}: {e}"),
                Ok(resp) if resp.status().is_success() => return Ok(()),
                Ok(resp) => last = format!("STATUS={} ({url})", resp.status()),
            }
            warn!(%url, attempt, "delete failed: {last}");
        }
        Err(StorageError::Unavailable(last))
    }

    async fn get_with_retry(
        &self,
        ctx: &CancellationToken,
        url: &str,
    ) -> Result<reqwest::Response, StorageError> {
        let mut last = String::new();
        for attempt in 0..GET_ATTEMPTS {
            if attempt > 0 {
                self.backoff(ctx).await?;
            }
            match self.client.get(url).send().await {
                Err(e) => last = format!("error getting {url}: {e}"),
                Ok(resp) if resp.status().is_success() => return Ok(resp),
                Ok(resp) => last = format!("STATUS={} ({url})", resp.status()),
            }
            warn!(%url, attempt, "request failed: {last}");
        }
        Err(StorageError::Unavailable(last))
    }

    async fn backoff(&self, ctx: &CancellationToken) -> Result<(), StorageError> {
        tokio::select! {
            _ = tokio::time::sleep(BACKOFF) => Ok(()),
            _ = ctx.cancelled() => {
                Err(StorageError::Unavailable("request cancelled".to_string()))
            }
        }
    }
}

/// Accept bare `host:port`, `:port`, or full URLs.
fn ensure_http(url: &str) -> String {
    if url.starts_with("http://") || url.starts_with("https://") {
        url.trim_end_matches('/').to_string()
    } else if url.starts_with(':') {
        format!("http://localhost{url}")
    } else {
        format!("http://{url}")
    }
}
