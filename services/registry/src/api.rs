//! API server builder and router

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, Method, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{any, get};
use serde::Deserialize;
use serde_json::json;

use storage::Storage;

use crate::error::{RegistryError, RegistryResult};
use crate::metadata::{MemoryMetadata, MetadataStore};
use crate::replication::{Backoff, ReplicationCoordinator, ReplicationMode};
use crate::route::RegistryPath;
use crate::storage::RegistryStorage;
use crate::validate::validate_repo_name;

/// Largest manifest body accepted.
const MANIFEST_LIMIT: usize = 4 * 1024 * 1024;

/// Registry builder for configuring and creating the OCI registry service
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    local: Option<Storage>,
    remote: Option<Storage>,
    metadata: Option<Arc<dyn MetadataStore>>,
    mode: ReplicationMode,
    backoff: Backoff,
    concurrency: Option<usize>,
}

impl RegistryBuilder {
    /// Create a new registry builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the local staging store
    pub fn local(mut self, storage: Storage) -> Self {
        self.local = Some(storage);
        self
    }

    /// Set the remote durable store
    pub fn remote(mut self, storage: Storage) -> Self {
        self.remote = Some(storage);
        self
    }

    /// Set the metadata collaborator. Defaults to an in-memory store.
    pub fn metadata(mut self, metadata: Arc<dyn MetadataStore>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Set the replication mode
    pub fn mode(mut self, mode: ReplicationMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the retry policy for replication
    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Limit concurrent transfers to the remote store, usually to its pool size
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    /// Build the storage pipeline without a router.
    ///
    /// Returns `None` unless both stores are configured.
    pub fn build_storage(self) -> Option<RegistryStorage> {
        let local = self.local?;
        let remote = self.remote?;
        let concurrency = self
            .concurrency
            .unwrap_or(sftp_client::DEFAULT_POOL_SIZE);

        let coordinator = ReplicationCoordinator::new(local, remote, concurrency, self.backoff);
        let metadata = self
            .metadata
            .unwrap_or_else(|| Arc::new(MemoryMetadata::new()));
        Some(RegistryStorage::new(Arc::new(coordinator), metadata, self.mode))
    }

    /// Build the registry service
    ///
    /// Returns a Router that can be served with any tower-compatible server
    ///
    /// # Panics
    ///
    /// Panics if the local or remote store has not been configured.
    pub fn build(self) -> Router {
        let storage = self
            .build_storage()
            .expect("local and remote storage must be configured");
        router(storage)
    }
}

/// The registry API over an assembled storage pipeline.
pub fn router(storage: RegistryStorage) -> Router {
    Router::new()
        .route("/v2", get(api_version_check))
        .route("/v2/", get(api_version_check))
        .route("/v2/{*path}", any(dispatch))
        .with_state(storage)
}

/// API version check endpoint
///
/// Returns 200 OK to indicate the registry is available
async fn api_version_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("docker-distribution-api-version", "registry/2.0")],
        Json(json!({})),
    )
}

#[derive(Debug, Default, Deserialize)]
struct RegistryQuery {
    digest: Option<String>,
}

async fn dispatch(
    State(storage): State<RegistryStorage>,
    method: Method,
    Path(path): Path<String>,
    Query(query): Query<RegistryQuery>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    match handle(&storage, &method, &path, query, &headers, body).await {
        Ok(response) => response,
        Err(error) => error.into_response(),
    }
}

#[tracing::instrument(skip(storage, method, query, headers, body), fields(%method))]
async fn handle(
    storage: &RegistryStorage,
    method: &Method,
    path: &str,
    query: RegistryQuery,
    headers: &HeaderMap,
    body: Body,
) -> RegistryResult<Response> {
    let Some(route) = RegistryPath::parse(path) else {
        return Ok(StatusCode::NOT_FOUND.into_response());
    };

    if let Some(name) = route.name() {
        validate_repo_name(name)?;
    }

    let digest = query.digest.as_deref();
    let method = method.as_str();
    match (method, &route) {
        ("GET", RegistryPath::Catalog) => crate::manifest::catalog(storage).await,
        ("GET", RegistryPath::Tags { name }) => crate::manifest::list_tags(storage, name).await,

        ("GET" | "HEAD", RegistryPath::Manifest { name, reference }) => {
            crate::manifest::get_manifest(storage, name, reference, method == "HEAD").await
        }
        ("PUT", RegistryPath::Manifest { name, reference }) => {
            let body = axum::body::to_bytes(body, MANIFEST_LIMIT)
                .await
                .map_err(|error| RegistryError::InvalidManifest(error.to_string()))?;
            crate::manifest::put_manifest(storage, name, reference, headers, body).await
        }

        ("GET" | "HEAD", RegistryPath::Blob { name, digest }) => {
            crate::blob::get_blob(storage, name, digest, method == "HEAD").await
        }

        ("POST", RegistryPath::Uploads { name }) => {
            crate::blob::start_blob_upload(storage, name, digest, body).await
        }
        ("PATCH", RegistryPath::Upload { name, session }) => {
            crate::blob::patch_blob_upload(storage, name, session, body).await
        }
        ("PUT", RegistryPath::Upload { name, session }) => {
            crate::blob::complete_blob_upload(storage, name, session, digest, body).await
        }
        ("GET" | "HEAD", RegistryPath::Upload { name, session }) => {
            crate::blob::blob_upload_status(storage, name, session, digest, method == "HEAD").await
        }
        ("DELETE", RegistryPath::Upload { name, session }) => {
            Ok(crate::blob::cancel_blob_upload(storage, name, session)
                .await?
                .into_response())
        }

        (_, RegistryPath::Signature { digest, .. }) => crate::signatures::signatures(method, digest),

        _ => Ok((StatusCode::METHOD_NOT_ALLOWED, [(header::ALLOW, allowed(&route))]).into_response()),
    }
}

fn allowed(route: &RegistryPath) -> &'static str {
    match route {
        RegistryPath::Catalog | RegistryPath::Tags { .. } => "GET",
        RegistryPath::Manifest { .. } => "GET, HEAD, PUT",
        RegistryPath::Blob { .. } => "GET, HEAD",
        RegistryPath::Uploads { .. } => "POST",
        RegistryPath::Upload { .. } => "GET, HEAD, PATCH, PUT, DELETE",
        RegistryPath::Signature { .. } => "GET, POST, DELETE",
    }
}
