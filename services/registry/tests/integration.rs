//! Integration tests for the registry, run against a local staging directory
//! and an in-memory SFTP server.

use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, Response, StatusCode, header};
use bytes::Bytes;
use camino::Utf8PathBuf;
use registry::{Backoff, RegistryBuilder, ReplicationMode};
use serde_json::{Value, json};
use sftp_client::{MemoryRemote, PooledDriver, SessionPool};
use sha2::{Digest, Sha256};
use storage::{LocalDriver, Storage};
use tower::ServiceExt;

struct TestRegistry {
    app: axum::Router,
    remote: MemoryRemote,
    dir: tempfile::TempDir,
}

impl TestRegistry {
    async fn new(mode: ReplicationMode) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let remote = MemoryRemote::new();
        let pool = SessionPool::connect(remote.connector(), 4).await.unwrap();

        let app = RegistryBuilder::new()
            .local(Storage::new(LocalDriver::new(root)))
            .remote(Storage::new(PooledDriver::new(pool, "registry")))
            .mode(mode)
            .concurrency(4)
            .backoff(Backoff::new(2, Duration::from_millis(1), Duration::from_millis(2)))
            .build();

        Self { app, remote, dir }
    }

    async fn send(&self, request: Request<Body>) -> Response<Body> {
        self.app.clone().oneshot(request).await.unwrap()
    }

    async fn get(&self, uri: &str) -> Response<Body> {
        self.send(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
    }

    async fn push_blob(&self, name: &str, data: &'static [u8]) -> Response<Body> {
        self.send(
            Request::builder()
                .method("POST")
                .uri(format!("/v2/{name}/blobs/uploads/?digest={}", sha256(data)))
                .body(Body::from(Bytes::from_static(data)))
                .unwrap(),
        )
        .await
    }

    async fn put_manifest(&self, name: &str, reference: &str, manifest: &Value) -> Response<Body> {
        self.send(
            Request::builder()
                .method("PUT")
                .uri(format!("/v2/{name}/manifests/{reference}"))
                .header(
                    header::CONTENT_TYPE,
                    "application/vnd.docker.distribution.manifest.v2+json",
                )
                .body(Body::from(serde_json::to_vec(manifest).unwrap()))
                .unwrap(),
        )
        .await
    }
}

fn sha256(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

async fn body_bytes(response: Response<Body>) -> Bytes {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
}

async fn body_json(response: Response<Body>) -> Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

fn image_manifest(layer: &[u8]) -> Value {
    json!({
        "schemaVersion": 2,
        "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
        "config": {
            "mediaType": "application/vnd.docker.container.image.v1+json",
            "digest": sha256(b"{}"),
            "size": 2,
        },
        "layers": [{
            "mediaType": "application/vnd.docker.image.rootfs.diff.tar.gzip",
            "digest": sha256(layer),
            "size": layer.len(),
        }],
    })
}

#[tokio::test]
async fn test_api_version_check() {
    let registry = TestRegistry::new(ReplicationMode::Sync).await;

    let response = registry.get("/v2/").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["docker-distribution-api-version"],
        "registry/2.0"
    );
}

#[tokio::test]
async fn test_chunked_upload_and_download() {
    let registry = TestRegistry::new(ReplicationMode::Sync).await;
    let digest = sha256(b"hello world");

    let response = registry
        .send(
            Request::builder()
                .method("POST")
                .uri("/v2/library/app/blobs/uploads/")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(response.headers()[header::RANGE], "0-0");
    let location = response.headers()[header::LOCATION]
        .to_str()
        .unwrap()
        .to_string();
    assert!(location.starts_with("/v2/library/app/blobs/uploads/"));
    assert!(registry.remote.exists("registry/library/app"));

    for chunk in [&b"hello "[..], &b"world"[..]] {
        let response = registry
            .send(
                Request::builder()
                    .method("PATCH")
                    .uri(&location)
                    .body(Body::from(chunk))
                    .unwrap(),
            )
            .await;
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    let response = registry.get(&location).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::RANGE], "0-10");

    let response = registry
        .send(
            Request::builder()
                .method("PUT")
                .uri(format!("{location}?digest={digest}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(response.headers()["docker-content-digest"], digest.as_str());
    assert_eq!(
        response.headers()[header::LOCATION],
        format!("/v2/library/app/blobs/{digest}").as_str()
    );

    let blob = format!("registry/library/app/blobs/{digest}");
    assert_eq!(registry.remote.file(&blob).unwrap(), b"hello world");

    let response = registry
        .get(&format!("/v2/library/app/blobs/{digest}"))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_LENGTH], "11");
    assert_eq!(&body_bytes(response).await[..], b"hello world");

    let response = registry
        .send(
            Request::builder()
                .method("HEAD")
                .uri(format!("/v2/library/app/blobs/{digest}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_LENGTH], "11");
}

#[tokio::test]
async fn test_pushing_a_blob_twice_writes_it_once() {
    let registry = TestRegistry::new(ReplicationMode::Sync).await;
    let data = b"layer contents";
    let blob = format!("registry/app/blobs/{}", sha256(data));

    assert_eq!(registry.push_blob("app", data).await.status(), StatusCode::CREATED);
    assert_eq!(registry.push_blob("app", data).await.status(), StatusCode::CREATED);

    assert_eq!(registry.remote.write_opens(&blob), 1);
    assert_eq!(registry.remote.file(&blob).unwrap(), data);
}

#[tokio::test]
async fn test_concurrent_pushes_store_one_object() {
    let registry = TestRegistry::new(ReplicationMode::Sync).await;
    let data: &'static [u8] = b"a popular base layer";
    let blob = format!("registry/app/blobs/{}", sha256(data));

    let pushes: Vec<_> = (0..12)
        .map(|_| {
            let app = registry.app.clone();
            tokio::spawn(async move {
                app.oneshot(
                    Request::builder()
                        .method("POST")
                        .uri(format!("/v2/app/blobs/uploads/?digest={}", sha256(data)))
                        .body(Body::from(Bytes::from_static(data)))
                        .unwrap(),
                )
                .await
                .unwrap()
                .status()
            })
        })
        .collect();

    for push in pushes {
        assert_eq!(push.await.unwrap(), StatusCode::CREATED);
    }

    assert_eq!(registry.remote.write_opens(&blob), 1);
    assert_eq!(registry.remote.files("registry/app/blobs").len(), 1);
}

/// Push `data` as a single PATCH chunk followed by an empty PUT.
async fn push_chunked(app: axum::Router, name: &str, data: &'static [u8]) -> StatusCode {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/v2/{name}/blobs/uploads/"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let location = response.headers()[header::LOCATION]
        .to_str()
        .unwrap()
        .to_string();

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("PATCH")
                .uri(&location)
                .body(Body::from(Bytes::from_static(data)))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    app.oneshot(
        Request::builder()
            .method("PUT")
            .uri(format!("{location}?digest={}", sha256(data)))
            .body(Body::empty())
            .unwrap(),
    )
    .await
    .unwrap()
    .status()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_chunked_uploads_of_one_blob() {
    let data: &'static [u8] = b"a layer pushed in chunks";

    for _ in 0..5 {
        let registry = TestRegistry::new(ReplicationMode::Sync).await;
        let blob = format!("registry/app/blobs/{}", sha256(data));

        let pushes: Vec<_> = (0..12)
            .map(|_| tokio::spawn(push_chunked(registry.app.clone(), "app", data)))
            .collect();
        for push in pushes {
            assert_eq!(push.await.unwrap(), StatusCode::CREATED);
        }

        assert_eq!(registry.remote.write_opens(&blob), 1);
        assert_eq!(registry.remote.file(&blob).unwrap(), data);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_chunked_uploads_in_async_mode() {
    let data: &'static [u8] = b"a layer pushed in chunks";

    for _ in 0..5 {
        let registry = TestRegistry::new(ReplicationMode::Async).await;
        let blob = format!("registry/app/blobs/{}", sha256(data));

        let pushes: Vec<_> = (0..12)
            .map(|_| tokio::spawn(push_chunked(registry.app.clone(), "app", data)))
            .collect();
        for push in pushes {
            assert_eq!(push.await.unwrap(), StatusCode::CREATED);
        }

        let mut replicated = None;
        for _ in 0..200 {
            replicated = registry.remote.file(&blob);
            if replicated.as_deref() == Some(data) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(replicated.as_deref(), Some(data));
    }
}

#[tokio::test]
async fn test_corrupted_blob_is_rejected() {
    let registry = TestRegistry::new(ReplicationMode::Sync).await;
    let digest = sha256(b"original content");

    let response = registry
        .send(
            Request::builder()
                .method("POST")
                .uri(format!("/v2/app/blobs/uploads/?digest={digest}"))
                .body(Body::from("original contenu"))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["errors"][0]["code"], "DIGEST_INVALID");

    assert!(!registry.remote.exists(format!("registry/app/blobs/{digest}")));
    let response = registry.get(&format!("/v2/app/blobs/{digest}")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_invalid_digest_is_rejected() {
    let registry = TestRegistry::new(ReplicationMode::Sync).await;

    let response = registry
        .send(
            Request::builder()
                .method("POST")
                .uri("/v2/app/blobs/uploads/?digest=md5:abcdef")
                .body(Body::from("data"))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(registry.remote.files("registry").is_empty());
}

#[tokio::test]
async fn test_missing_blob_is_not_found() {
    let registry = TestRegistry::new(ReplicationMode::Sync).await;

    let response = registry
        .get(&format!("/v2/app/blobs/{}", sha256(b"nothing")))
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(response).await["errors"][0]["code"], "BLOB_UNKNOWN");
}

#[tokio::test]
async fn test_manifest_by_tag_and_digest() {
    let registry = TestRegistry::new(ReplicationMode::Sync).await;
    assert_eq!(registry.push_blob("app", b"layer").await.status(), StatusCode::CREATED);

    let manifest = image_manifest(b"layer");
    let response = registry.put_manifest("app", "v1", &manifest).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let digest = response.headers()["docker-content-digest"]
        .to_str()
        .unwrap()
        .to_string();
    assert_eq!(digest, sha256(&serde_json::to_vec(&manifest).unwrap()));

    let response = registry.get("/v2/app/manifests/v1").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "application/vnd.docker.distribution.manifest.v2+json"
    );
    assert_eq!(response.headers()["docker-content-digest"], digest.as_str());
    assert_eq!(body_json(response).await, manifest);

    let response = registry.get(&format!("/v2/app/manifests/{digest}")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, manifest);

    assert!(registry.remote.exists("registry/app/manifests/v1"));
    assert!(registry.remote.exists(format!("registry/app/manifests/{digest}")));
}

#[tokio::test]
async fn test_unknown_manifest_is_not_found() {
    let registry = TestRegistry::new(ReplicationMode::Sync).await;

    let response = registry.get("/v2/app/manifests/latest").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(response).await["errors"][0]["code"], "MANIFEST_UNKNOWN");
}

#[tokio::test]
async fn test_index_with_missing_platform_manifest_is_rejected() {
    let registry = TestRegistry::new(ReplicationMode::Sync).await;
    let missing = sha256(b"not pushed");

    let index = json!({
        "schemaVersion": 2,
        "mediaType": "application/vnd.oci.image.index.v1+json",
        "manifests": [{
            "mediaType": "application/vnd.oci.image.manifest.v1+json",
            "digest": missing,
            "size": 10,
            "platform": {"architecture": "amd64", "os": "linux"},
        }],
    });

    let response = registry.put_manifest("app", "latest", &index).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        body_json(response).await["errors"][0]["code"],
        "MANIFEST_BLOB_UNKNOWN"
    );
    assert!(registry.remote.files("registry/app/manifests").is_empty());
    assert!(!registry.dir.path().join("app/manifests/latest").exists());
}

#[tokio::test]
async fn test_index_after_platform_manifests() {
    let registry = TestRegistry::new(ReplicationMode::Sync).await;

    let platform = image_manifest(b"layer");
    let response = registry.put_manifest("app", "amd64", &platform).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let platform_digest = sha256(&serde_json::to_vec(&platform).unwrap());

    let index = json!({
        "schemaVersion": 2,
        "mediaType": "application/vnd.oci.image.index.v1+json",
        "manifests": [{
            "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
            "digest": platform_digest,
            "size": 10,
        }],
    });
    let response = registry.put_manifest("app", "latest", &index).await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = registry.get("/v2/app/manifests/latest").await;
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "application/vnd.oci.image.index.v1+json"
    );
}

#[tokio::test]
async fn test_tags_are_listed_without_digests() {
    let registry = TestRegistry::new(ReplicationMode::Sync).await;
    let response = registry
        .put_manifest("library/app", "v1", &image_manifest(b"layer"))
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = registry.get("/v2/library/app/tags/list").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        body_json(response).await,
        json!({"name": "library/app", "tags": ["v1"]})
    );

    let response = registry.get("/v2/unknown/tags/list").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_catalog() {
    let registry = TestRegistry::new(ReplicationMode::Sync).await;
    for name in ["app", "library/web"] {
        let response = registry.put_manifest(name, "v1", &image_manifest(b"layer")).await;
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    let response = registry.get("/v2/_catalog").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        body_json(response).await,
        json!({"repositories": ["app", "library/web"]})
    );
}

#[tokio::test]
async fn test_path_traversal_is_rejected() {
    let registry = TestRegistry::new(ReplicationMode::Sync).await;

    let response = registry
        .send(
            Request::builder()
                .method("POST")
                .uri("/v2/../etc/blobs/uploads/")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = registry.get("/v2/app/manifests/..%2F..%2Fpasswd").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    assert!(!registry.remote.exists("etc"));
    assert!(registry.remote.files("").is_empty());
}

#[tokio::test]
async fn test_async_mode_accepts_while_remote_is_down() {
    let registry = TestRegistry::new(ReplicationMode::Async).await;
    registry.remote.set_online(false);

    let data = b"staged while offline";
    let response = registry.push_blob("app", data).await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let staged = registry
        .dir
        .path()
        .join(format!("app/blobs/{}", sha256(data)));
    assert!(staged.exists());
}

#[tokio::test]
async fn test_sync_mode_fails_while_remote_is_down() {
    let registry = TestRegistry::new(ReplicationMode::Sync).await;
    registry.remote.set_online(false);

    let response = registry.push_blob("app", b"never stored").await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn test_cancelled_upload() {
    let registry = TestRegistry::new(ReplicationMode::Sync).await;

    let response = registry
        .send(
            Request::builder()
                .method("POST")
                .uri("/v2/app/blobs/uploads/")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    let location = response.headers()[header::LOCATION]
        .to_str()
        .unwrap()
        .to_string();

    let response = registry
        .send(
            Request::builder()
                .method("PATCH")
                .uri(&location)
                .body(Body::from("partial"))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = registry
        .send(
            Request::builder()
                .method("DELETE")
                .uri(&location)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = registry.get(&location).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn test_signatures_are_accepted() {
    let registry = TestRegistry::new(ReplicationMode::Sync).await;
    let digest = sha256(b"image");

    let response = registry.get(&format!("/v2/app/signatures/{digest}")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, json!({"signatures": []}));
}

#[tokio::test]
async fn test_unsupported_method() {
    let registry = TestRegistry::new(ReplicationMode::Sync).await;

    let response = registry
        .send(
            Request::builder()
                .method("DELETE")
                .uri("/v2/app/manifests/latest")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(response.headers()[header::ALLOW], "GET, HEAD, PUT");
}
