//! End-to-end tests for the cask backend against a mock volume cluster.
//!
//! The mock speaks just enough of the cluster protocol: `/dir/assign`
//! hands out fids, `/dir/lookup` points every volume at the mock
//! itself, and `POST`/`GET`/`DELETE /:fid` move payloads in and out of
//! an in-memory map.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use axum::body::Body;
use axum::extract::{Multipart, Path, State};
use axum::http::{HeaderMap, HeaderName, Method, Request, StatusCode, Uri};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use futures::TryStreamExt;
use tokio_util::sync::CancellationToken;
use tower::util::ServiceExt;

use s3cask::storage::cask::CaskStore;
use s3cask::storage::{Storage, StorageError};
use s3cask::S3Service;

// ── Mock cluster ────────────────────────────────────────────────────

#[derive(Clone, Debug)]
struct StoredBlob {
    filename: String,
    media: String,
    data: Bytes,
}

#[derive(Default)]
struct ClusterState {
    blobs: Mutex<HashMap<String, StoredBlob>>,
    next_fid: AtomicU64,
    fail_uploads: AtomicBool,
}

struct MockCluster {
    addr: String,
    state: Arc<ClusterState>,
}

impl MockCluster {
    async fn start() -> Self {
        let state = Arc::new(ClusterState::default());

        let app = Router::new()
            .route("/dir/assign", get(assign))
            .route("/dir/lookup", get(lookup))
            .route(
                "/:fid",
                get(download).post(upload).delete(delete_blob),
            )
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, state }
    }

    fn blob_count(&self) -> usize {
        self.state.blobs.lock().unwrap().len()
    }
}

async fn assign(State(state): State<Arc<ClusterState>>, headers: HeaderMap) -> impl IntoResponse {
    let n = state.next_fid.fetch_add(1, Ordering::SeqCst);
    let host = headers
        .get("host")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("127.0.0.1")
        .to_string();
    let body = format!(
        r#"{{"count":1,"fid":"7,{n:08x}","url":"{host}","publicUrl":"{host}"}}"#
    );
    ([("content-type", "application/json")], body)
}

async fn lookup(State(_): State<Arc<ClusterState>>, headers: HeaderMap) -> impl IntoResponse {
    let host = headers
        .get("host")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("127.0.0.1")
        .to_string();
    let body = format!(
        r#"{{"locations":[{{"publicUrl":"{host}","url":"{host}"}}]}}"#
    );
    ([("content-type", "application/json")], body)
}

async fn upload(
    State(state): State<Arc<ClusterState>>,
    Path(fid): Path<String>,
    mut multipart: Multipart,
) -> impl IntoResponse {
    if state.fail_uploads.load(Ordering::SeqCst) {
        return (StatusCode::INTERNAL_SERVER_ERROR, "volume full".to_string());
    }
    while let Some(field) = multipart.next_field().await.unwrap() {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field.file_name().unwrap_or_default().to_string();
        let media = field.content_type().unwrap_or_default().to_string();
        let data = field.bytes().await.unwrap();
        let size = data.len();
        state.blobs.lock().unwrap().insert(
            fid,
            StoredBlob {
                filename,
                media,
                data,
            },
        );
        return (StatusCode::CREATED, format!(r#"{{"size":{size}}}"#));
    }
    (StatusCode::BAD_REQUEST, "no file part".to_string())
}

async fn download(
    State(state): State<Arc<ClusterState>>,
    Path(fid): Path<String>,
) -> impl IntoResponse {
    match state.blobs.lock().unwrap().get(&fid) {
        Some(blob) => (StatusCode::OK, blob.data.clone()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn delete_blob(
    State(state): State<Arc<ClusterState>>,
    Path(fid): Path<String>,
) -> impl IntoResponse {
    state.blobs.lock().unwrap().remove(&fid);
    StatusCode::ACCEPTED
}

// ── Storage-level lifecycle ──────────────────────────────────────────

async fn collect(stream: s3cask::storage::ObjectStream) -> Vec<u8> {
    let chunks: Vec<Bytes> = stream.try_collect().await.unwrap();
    chunks.concat()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_put_list_get_delete_roundtrip() {
    let cluster = MockCluster::start().await;
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("alice")).unwrap();

    let store = CaskStore::new(&cluster.addr, dir.path()).unwrap();
    let owner = store.get_owner("alice").await.unwrap();
    let ctx = CancellationToken::new();

    store.create_bucket(owner.as_ref(), "test").await.unwrap();

    store
        .put(
            ctx.clone(),
            owner.as_ref(),
            "test",
            "obj",
            "hello.txt",
            "text/plain",
            Bytes::from_static(b"hello"),
        )
        .await
        .unwrap();
    assert_eq!(cluster.blob_count(), 1);

    // The blob reached the cluster with its filename and media type.
    {
        let blobs = cluster.state.blobs.lock().unwrap();
        let blob = blobs.values().next().unwrap();
        assert_eq!(blob.filename, "hello.txt");
        assert_eq!(blob.media, "text/plain");
        assert_eq!(&blob.data[..], b"hello");
    }

    let listing = store
        .list(
            owner.as_ref(),
            "test",
            &s3cask::storage::ListParams {
                limit: 1000,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(listing.objects.len(), 1);
    assert_eq!(listing.objects[0].key, "obj");
    assert_eq!(listing.objects[0].size, 5);
    assert!(!listing.truncated);

    let body = store
        .get(ctx.clone(), owner.as_ref(), "test", "obj")
        .await
        .unwrap();
    assert_eq!(body.filename, "hello.txt");
    assert_eq!(body.media, "text/plain");
    assert_eq!(collect(body.stream).await, b"hello");

    store
        .del(ctx.clone(), owner.as_ref(), "test", "obj")
        .await
        .unwrap();
    assert_eq!(cluster.blob_count(), 0);

    let err = store
        .get(ctx.clone(), owner.as_ref(), "test", "obj")
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::NotFound));

    // The bucket is empty again, so deletion succeeds.
    store.del_bucket(owner.as_ref(), "test").await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_upload_rolls_back_metadata() {
    let cluster = MockCluster::start().await;
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("alice")).unwrap();

    let store = CaskStore::new(&cluster.addr, dir.path()).unwrap();
    let owner = store.get_owner("alice").await.unwrap();
    let ctx = CancellationToken::new();

    store.create_bucket(owner.as_ref(), "test").await.unwrap();
    cluster.state.fail_uploads.store(true, Ordering::SeqCst);

    let err = store
        .put(
            ctx.clone(),
            owner.as_ref(),
            "test",
            "obj",
            "f.bin",
            "application/octet-stream",
            Bytes::from_static(b"payload"),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::Unavailable(_)));

    // No metadata row survived the rollback.
    let listing = store
        .list(
            owner.as_ref(),
            "test",
            &s3cask::storage::ListParams {
                limit: 1000,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(listing.objects.is_empty());
    assert!(matches!(
        store
            .get(ctx.clone(), owner.as_ref(), "test", "obj")
            .await
            .unwrap_err(),
        StorageError::NotFound
    ));

    // The cluster recovers and the same put succeeds.
    cluster.state.fail_uploads.store(false, Ordering::SeqCst);
    store
        .put(
            ctx,
            owner.as_ref(),
            "test",
            "obj",
            "f.bin",
            "application/octet-stream",
            Bytes::from_static(b"payload"),
        )
        .await
        .unwrap();
    assert_eq!(cluster.blob_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_bucket_with_objects_cannot_be_deleted() {
    let cluster = MockCluster::start().await;
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("alice")).unwrap();

    let store = CaskStore::new(&cluster.addr, dir.path()).unwrap();
    let owner = store.get_owner("alice").await.unwrap();
    let ctx = CancellationToken::new();

    store.create_bucket(owner.as_ref(), "test").await.unwrap();
    store
        .put(
            ctx.clone(),
            owner.as_ref(),
            "test",
            "obj",
            "f",
            "text/plain",
            Bytes::from_static(b"x"),
        )
        .await
        .unwrap();

    assert!(matches!(
        store.del_bucket(owner.as_ref(), "test").await.unwrap_err(),
        StorageError::Conflict(_)
    ));

    store.del(ctx, owner.as_ref(), "test", "obj").await.unwrap();
    store.del_bucket(owner.as_ref(), "test").await.unwrap();
}

// ── Full HTTP lifecycle through the router ───────────────────────────

const SERVICE_HOST: &str = "s3.test.org";
const DATE: &str = "Wed, 28 Mar 2007 01:29:59 +0000";

/// Sign a request with the empty secret of a fresh cask owner.
fn signed(method: &str, uri: &str, extra: &[(&str, &str)], body: Body) -> Request<Body> {
    let mut headers = HeaderMap::new();
    headers.insert("host", SERVICE_HOST.parse().unwrap());
    headers.insert("date", DATE.parse().unwrap());
    for (name, value) in extra {
        headers.append(
            HeaderName::try_from(*name).unwrap(),
            value.parse().unwrap(),
        );
    }

    let method: Method = method.parse().unwrap();
    let parsed: Uri = uri.parse().unwrap();
    let to_sign = s3cask::auth::bytes_to_sign(&method, SERVICE_HOST, &parsed, &headers, SERVICE_HOST);
    let signature = BASE64.encode(s3cask::auth::hmac_sha1(b"", &to_sign));

    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("authorization", format!("AWS alice:{signature}"));
    for (name, value) in headers.iter() {
        builder = builder.header(name, value);
    }
    builder.body(body).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_object_lifecycle_over_http() {
    let cluster = MockCluster::start().await;
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("alice")).unwrap();

    let store = CaskStore::new(&cluster.addr, dir.path()).unwrap();
    let svc = Arc::new(S3Service::new(SERVICE_HOST, Arc::new(store)));
    let app = s3cask::server::app(svc);

    // Create bucket `test`.
    let response = app
        .clone()
        .oneshot(signed("PUT", "/test", &[], Body::empty()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // PUT key `obj` with body "hello".
    let response = app
        .clone()
        .oneshot(signed(
            "PUT",
            "/test/obj",
            &[("content-type", "text/plain")],
            Body::from("hello"),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // LIST returns exactly one Contents entry with key obj, size 5.
    let response = app
        .clone()
        .oneshot(signed("GET", "/test/", &[], Body::empty()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = String::from_utf8_lossy(&body);
    assert_eq!(body.matches("<Contents>").count(), 1, "{body}");
    assert!(body.contains("<Key>obj</Key>"), "{body}");
    assert!(body.contains("<Size>5</Size>"), "{body}");

    // GET returns the payload.
    let response = app
        .clone()
        .oneshot(signed("GET", "/test/obj", &[], Body::empty()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(&body[..], b"hello");

    // DELETE returns 204; a subsequent GET is a 404.
    let response = app
        .clone()
        .oneshot(signed("DELETE", "/test/obj", &[], Body::empty()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = app
        .clone()
        .oneshot(signed("GET", "/test/obj", &[], Body::empty()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
