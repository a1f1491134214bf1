//! Volume-cluster ("cask") storage backend.
//!
//! Object payloads live in an external content-addressed volume
//! cluster; per-bucket metadata lives in embedded ordered KV files laid
//! out as `<db_dir>/<ownerId>/<bucket>.kv`.  Owners pre-exist as
//! subdirectories of the metadata root, with an optional `.secret`
//! file holding their HMAC secret.
//!
//! A PUT is a distributed two-step: the metadata row is written inside
//! a KV transaction that only commits after the blob upload succeeded,
//! so a committed row always refers to a blob that existed at commit
//! time.  A crash between upload and commit orphans the blob, which is
//! tolerated; the reverse (a row without a blob) is not.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use anyhow::Context;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::auth::hmac_sha1;
use crate::list_filter::ListFilter;
use crate::storage::{
    BucketInfo, ListParams, Listing, ObjectBody, ObjectInfo, Owner, Storage, StorageError,
};

pub mod http;
pub mod kv;

use self::http::MasterClient;
use self::kv::KvDb;

/// Extension of the per-bucket database files.
const DB_SUFFIX: &str = ".kv";

/// Optional per-owner secret file name.
const SECRET_FILE: &str = ".secret";

// ── Metadata record ─────────────────────────────────────────────────

/// The value stored per object key.  bincode keeps the field order
/// stable, so the encoding is deterministic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct ObjectMeta {
    filename: String,
    media: String,
    fid: String,
    created_ms: u64,
    size: u64,
}

fn encode_meta(meta: &ObjectMeta) -> anyhow::Result<Vec<u8>> {
    bincode::serialize(meta).context("error encoding object metadata")
}

fn decode_meta(val: &[u8]) -> anyhow::Result<ObjectMeta> {
    bincode::deserialize(val).context("error decoding object metadata")
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ── Owner ───────────────────────────────────────────────────────────

/// An owner known to the cask backend.
pub struct CaskOwner {
    id: String,
    secret: Vec<u8>,
}

impl Owner for CaskOwner {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.id
    }

    fn sign(&self, data: &[u8]) -> Vec<u8> {
        hmac_sha1(&self.secret, data)
    }
}

// ── In-memory indexes ───────────────────────────────────────────────

struct BucketState {
    filename: PathBuf,
    created: SystemTime,
    db: KvDb,
}

struct OwnerState {
    dir: PathBuf,
    secret: Vec<u8>,
    // Guards bucket map membership; the per-bucket DB serializes its
    // own I/O.  Async because deletion probes the DB under this lock.
    buckets: tokio::sync::Mutex<HashMap<String, Arc<BucketState>>>,
}

/// Storage backend delegating payloads to a volume cluster.
pub struct CaskStore {
    master: MasterClient,
    base_dir: PathBuf,
    // Guards owner map membership only; held briefly, never across I/O
    // on the cluster.  Lock order is always owners -> buckets.
    owners: Mutex<HashMap<String, Arc<OwnerState>>>,
}

impl CaskStore {
    /// Open the metadata root, discovering owners and their buckets.
    ///
    /// Every subdirectory of `db_dir` is an owner id; every `*.kv`
    /// file inside is a bucket whose creation time is the file mtime.
    pub fn new(master_url: &str, db_dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let base_dir = db_dir.into();
        std::fs::create_dir_all(&base_dir)
            .with_context(|| format!("error creating db dir {}", base_dir.display()))?;

        let mut owners = HashMap::new();
        for entry in std::fs::read_dir(&base_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let id = entry.file_name().to_string_lossy().into_owned();
            let state = open_owner(&entry.path())?;
            owners.insert(id, Arc::new(state));
        }
        info!(
            owners = owners.len(),
            dir = %base_dir.display(),
            "cask metadata root opened"
        );

        Ok(Self {
            master: MasterClient::new(master_url),
            base_dir,
            owners: Mutex::new(owners),
        })
    }

    fn owner_state(&self, owner_id: &str) -> Result<Arc<OwnerState>, StorageError> {
        let owners = self.owners.lock().expect("owner map lock poisoned");
        owners.get(owner_id).cloned().ok_or(StorageError::NotFound)
    }

    async fn bucket_state(
        &self,
        owner_id: &str,
        bucket: &str,
    ) -> Result<Arc<BucketState>, StorageError> {
        let owner = self.owner_state(owner_id)?;
        let buckets = owner.buckets.lock().await;
        buckets.get(bucket).cloned().ok_or(StorageError::NotFound)
    }
}

fn open_owner(dir: &Path) -> anyhow::Result<OwnerState> {
    let secret = std::fs::read(dir.join(SECRET_FILE)).unwrap_or_default();

    let mut buckets = HashMap::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some(bucket) = name.strip_suffix(DB_SUFFIX) else {
            continue;
        };
        if bucket.is_empty() || !entry.file_type()?.is_file() {
            continue;
        }
        let filename = entry.path();
        let created = entry
            .metadata()?
            .modified()
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let db = KvDb::open(&filename)?;
        buckets.insert(
            bucket.to_string(),
            Arc::new(BucketState {
                filename,
                created,
                db,
            }),
        );
    }

    Ok(OwnerState {
        dir: dir.to_path_buf(),
        secret,
        buckets: tokio::sync::Mutex::new(buckets),
    })
}

// ── Storage impl ────────────────────────────────────────────────────

impl Storage for CaskStore {
    fn get_owner(
        &self,
        access_key: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Box<dyn Owner>, StorageError>> + Send + '_>> {
        let access_key = access_key.to_string();
        Box::pin(async move {
            let state = self.owner_state(&access_key)?;
            Ok(Box::new(CaskOwner {
                id: access_key,
                secret: state.secret.clone(),
            }) as Box<dyn Owner>)
        })
    }

    fn list_buckets(
        &self,
        owner: &dyn Owner,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<BucketInfo>, StorageError>> + Send + '_>> {
        let owner_id = owner.id().to_string();
        Box::pin(async move {
            let state = self.owner_state(&owner_id)?;
            let buckets = state.buckets.lock().await;
            Ok(buckets
                .iter()
                .map(|(name, b)| BucketInfo {
                    name: name.clone(),
                    created: b.created,
                })
                .collect())
        })
    }

    fn create_bucket(
        &self,
        owner: &dyn Owner,
        bucket: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), StorageError>> + Send + '_>> {
        let owner_id = owner.id().to_string();
        let bucket = bucket.to_string();
        Box::pin(async move {
            // Ensure the owner entry (and its directory) exists.
            let state = {
                let mut owners = self.owners.lock().expect("owner map lock poisoned");
                match owners.get(&owner_id) {
                    Some(state) => state.clone(),
                    None => {
                        let dir = self.base_dir.join(&owner_id);
                        std::fs::create_dir_all(&dir).map_err(|e| {
                            StorageError::Other(anyhow::anyhow!(
                                "error creating owner dir {}: {e}",
                                dir.display()
                            ))
                        })?;
                        let state = Arc::new(OwnerState {
                            dir,
                            secret: Vec::new(),
                            buckets: tokio::sync::Mutex::new(HashMap::new()),
                        });
                        owners.insert(owner_id.clone(), state.clone());
                        state
                    }
                }
            };

            let mut buckets = state.buckets.lock().await;
            if buckets.contains_key(&bucket) {
                // Re-creating an owned bucket succeeds.
                return Ok(());
            }
            let filename = state.dir.join(format!("{bucket}{DB_SUFFIX}"));
            let db = KvDb::create(&filename)?;
            info!(owner = %owner_id, %bucket, "bucket created");
            buckets.insert(
                bucket,
                Arc::new(BucketState {
                    filename,
                    created: SystemTime::now(),
                    db,
                }),
            );
            Ok(())
        })
    }

    fn check_bucket(
        &self,
        owner: &dyn Owner,
        bucket: &str,
    ) -> Pin<Box<dyn Future<Output = Result<bool, StorageError>> + Send + '_>> {
        let owner_id = owner.id().to_string();
        let bucket = bucket.to_string();
        Box::pin(async move {
            let Ok(state) = self.owner_state(&owner_id) else {
                return Ok(false);
            };
            let buckets = state.buckets.lock().await;
            Ok(buckets.contains_key(&bucket))
        })
    }

    fn del_bucket(
        &self,
        owner: &dyn Owner,
        bucket: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), StorageError>> + Send + '_>> {
        let owner_id = owner.id().to_string();
        let bucket = bucket.to_string();
        Box::pin(async move {
            let state = self.owner_state(&owner_id)?;
            let mut buckets = state.buckets.lock().await;
            let Some(b) = buckets.get(&bucket) else {
                return Err(StorageError::NotFound);
            };
            if b.db.first_key().await?.is_some() {
                return Err(StorageError::Conflict(
                    "cannot delete non-empty bucket".to_string(),
                ));
            }
            let b = buckets.remove(&bucket).expect("bucket vanished under lock");
            drop(buckets);

            // Dropping the last reference closes the connection; the
            // unlink is safe even if a straggling reader still holds it.
            let filename = b.filename.clone();
            drop(b);
            std::fs::remove_file(&filename).map_err(|e| {
                StorageError::Other(anyhow::anyhow!(
                    "error removing {}: {e}",
                    filename.display()
                ))
            })?;
            info!(owner = %owner_id, %bucket, "bucket deleted");
            Ok(())
        })
    }

    fn list(
        &self,
        owner: &dyn Owner,
        bucket: &str,
        params: &ListParams,
    ) -> Pin<Box<dyn Future<Output = Result<Listing, StorageError>> + Send + '_>> {
        let owner_id = owner.id().to_string();
        let bucket = bucket.to_string();
        let params = params.clone();
        Box::pin(async move {
            let state = self.bucket_state(&owner_id, &bucket).await?;

            let mut filter = ListFilter::new(
                &params.prefix,
                &params.delimiter,
                &params.marker,
                params.limit,
                params.skip,
            );
            let mut objects = Vec::new();
            let mut decode_err = None;
            state
                .db
                .for_each(|key, val| {
                    let key = String::from_utf8_lossy(key).into_owned();
                    match filter.check(&key) {
                        None => false,
                        Some(false) => true,
                        Some(true) => match decode_meta(val) {
                            // Only emitted rows are decoded.
                            Ok(meta) => {
                                objects.push(ObjectInfo {
                                    key,
                                    size: meta.size,
                                    last_modified: SystemTime::UNIX_EPOCH
                                        + std::time::Duration::from_millis(meta.created_ms),
                                });
                                true
                            }
                            Err(e) => {
                                decode_err = Some(e);
                                false
                            }
                        },
                    }
                })
                .await?;
            if let Some(e) = decode_err {
                return Err(StorageError::Other(e));
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
        ctx: CancellationToken,
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
        let filename = filename.to_string();
        let media = media.to_string();
        Box::pin(async move {
            let state = self.bucket_state(&owner_id, &bucket).await?;

            // The transaction stays open across the upload; commit only
            // once the blob is known to exist.
            let txn = state.db.begin().await?;
            let assign = self.master.assign(&ctx).await?;
            let meta = ObjectMeta {
                filename: filename.clone(),
                media: media.clone(),
                fid: assign.fid.clone(),
                created_ms: now_ms(),
                size: body.len() as u64,
            };
            txn.set(key.as_bytes(), &encode_meta(&meta)?)?;

            match self
                .master
                .upload(&ctx, &assign, &filename, &media, body)
                .await
            {
                Ok(()) => {
                    txn.commit()?;
                    Ok(())
                }
                Err(e) => {
                    txn.rollback()?;
                    Err(e)
                }
            }
        })
    }

    fn get(
        &self,
        ctx: CancellationToken,
        owner: &dyn Owner,
        bucket: &str,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = Result<ObjectBody, StorageError>> + Send + '_>> {
        let owner_id = owner.id().to_string();
        let bucket = bucket.to_string();
        let key = key.to_string();
        Box::pin(async move {
            let state = self.bucket_state(&owner_id, &bucket).await?;
            let Some(val) = state.db.get(key.as_bytes()).await? else {
                return Err(StorageError::NotFound);
            };
            let meta = decode_meta(&val)?;
            let stream = self.master.download(&ctx, &meta.fid).await?;
            Ok(ObjectBody {
                filename: meta.filename,
                media: meta.media,
                stream,
            })
        })
    }

    fn del(
        &self,
        ctx: CancellationToken,
        owner: &dyn Owner,
        bucket: &str,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), StorageError>> + Send + '_>> {
        let owner_id = owner.id().to_string();
        let bucket = bucket.to_string();
        let key = key.to_string();
        Box::pin(async move {
            let state = self.bucket_state(&owner_id, &bucket).await?;

            let txn = state.db.begin().await?;
            let Some(val) = txn.get(key.as_bytes())? else {
                txn.rollback()?;
                return Err(StorageError::NotFound);
            };
            let meta = decode_meta(&val)?;

            match self.master.delete(&ctx, &meta.fid).await {
                Ok(()) => {
                    txn.delete(key.as_bytes())?;
                    txn.commit()?;
                    Ok(())
                }
                Err(e) => {
                    txn.rollback()?;
                    Err(e)
                }
            }
        })
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn owner(id: &str) -> CaskOwner {
        CaskOwner {
            id: id.to_string(),
            secret: Vec::new(),
        }
    }

    #[test]
    fn test_meta_roundtrip_and_determinism() {
        let meta = ObjectMeta {
            filename: "report.pdf".to_string(),
            media: "application/pdf".to_string(),
            fid: "3,01637037d6".to_string(),
            created_ms: 1_700_000_000_000,
            size: 42,
        };
        let a = encode_meta(&meta).unwrap();
        let b = encode_meta(&meta).unwrap();
        assert_eq!(a, b);
        assert_eq!(decode_meta(&a).unwrap(), meta);
    }

    #[tokio::test]
    async fn test_bucket_lifecycle_without_cluster() {
        let dir = tempfile::tempdir().unwrap();
        let store = CaskStore::new("localhost:9333", dir.path()).unwrap();
        let o = owner("alice");

        assert!(!store.check_bucket(&o, "docs").await.unwrap());
        store.create_bucket(&o, "docs").await.unwrap();
        assert!(store.check_bucket(&o, "docs").await.unwrap());
        assert!(dir.path().join("alice/docs.kv").is_file());

        // Idempotent re-create.
        store.create_bucket(&o, "docs").await.unwrap();

        let buckets = store.list_buckets(&o).await.unwrap();
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].name, "docs");

        store.del_bucket(&o, "docs").await.unwrap();
        assert!(!store.check_bucket(&o, "docs").await.unwrap());
        assert!(!dir.path().join("alice/docs.kv").exists());
    }

    #[tokio::test]
    async fn test_del_bucket_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = CaskStore::new("localhost:9333", dir.path()).unwrap();
        store.create_bucket(&owner("alice"), "docs").await.unwrap();

        let err = store.del_bucket(&owner("alice"), "other").await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound));
    }

    #[tokio::test]
    async fn test_del_bucket_non_empty_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let store = CaskStore::new("localhost:9333", dir.path()).unwrap();
        let o = owner("alice");
        store.create_bucket(&o, "docs").await.unwrap();

        // Seed a row directly; Put would need the cluster.
        let state = store.bucket_state("alice", "docs").await.unwrap();
        let txn = state.db.begin().await.unwrap();
        txn.set(b"obj", b"x").unwrap();
        txn.commit().unwrap();
        drop(state);

        let err = store.del_bucket(&o, "docs").await.unwrap_err();
        assert!(matches!(err, StorageError::Conflict(_)));
        assert!(store.check_bucket(&o, "docs").await.unwrap());
    }

    #[tokio::test]
    async fn test_startup_walk_discovers_owners_and_buckets() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = CaskStore::new("localhost:9333", dir.path()).unwrap();
            store.create_bucket(&owner("alice"), "docs").await.unwrap();
            store.create_bucket(&owner("alice"), "media").await.unwrap();
            std::fs::write(dir.path().join("alice/.secret"), b"hunter2").unwrap();
        }

        let reopened = CaskStore::new("localhost:9333", dir.path()).unwrap();
        let o = reopened.get_owner("alice").await.unwrap();
        assert_eq!(o.id(), "alice");
        // The secret file participates in signing after reopen.
        assert_eq!(o.sign(b"x"), hmac_sha1(b"hunter2", b"x"));

        let mut names: Vec<String> = reopened
            .list_buckets(&owner("alice"))
            .await
            .unwrap()
            .into_iter()
            .map(|b| b.name)
            .collect();
        names.sort();
        assert_eq!(names, vec!["docs", "media"]);

        assert!(matches!(
            reopened.get_owner("bob").await.unwrap_err(),
            StorageError::NotFound
        ));
    }

    #[tokio::test]
    async fn test_get_missing_key_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = CaskStore::new("localhost:9333", dir.path()).unwrap();
        let o = owner("alice");
        store.create_bucket(&o, "docs").await.unwrap();

        let ctx = CancellationToken::new();
        let err = store.get(ctx, &o, "docs", "missing").await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound));
    }
}
