//! Manifest operations for the registry

use axum::Json;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;

use crate::blob::DOCKER_CONTENT_DIGEST;
use crate::digest::{Algorithm, Digest};
use crate::document::ManifestDocument;
use crate::error::RegistryResult;
use crate::storage::RegistryStorage;
use crate::validate::validate_reference;

/// Get a manifest, or only its headers for a `HEAD` request
pub(crate) async fn get_manifest(
    storage: &RegistryStorage,
    name: &str,
    reference: &str,
    head: bool,
) -> RegistryResult<Response> {
    validate_reference(reference)?;

    let data = storage.get_manifest(name, reference).await?;

    // Content is served as stored; only the headers are inferred.
    let content_type = ManifestDocument::parse(&data)
        .map(|document| document.content_type())
        .unwrap_or(crate::document::DOCKER_MANIFEST);
    let algorithm = Digest::parse(reference)
        .map(|digest| digest.algorithm())
        .unwrap_or(Algorithm::Sha256);
    let digest = Digest::compute(algorithm, &data);

    let headers = [
        (header::CONTENT_TYPE, content_type.to_string()),
        (DOCKER_CONTENT_DIGEST, digest.to_string()),
        (header::CONTENT_LENGTH, data.len().to_string()),
    ];

    if head {
        Ok((StatusCode::OK, headers).into_response())
    } else {
        Ok((StatusCode::OK, headers, data).into_response())
    }
}

/// Put a manifest
pub(crate) async fn put_manifest(
    storage: &RegistryStorage,
    name: &str,
    reference: &str,
    headers: &HeaderMap,
    body: Bytes,
) -> RegistryResult<Response> {
    validate_reference(reference)?;

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());

    let digest = storage
        .put_manifest(name, reference, content_type, body)
        .await?;

    let location = format!("/v2/{}/manifests/{}", name, digest);

    Ok((
        StatusCode::CREATED,
        [
            (header::LOCATION, location),
            (DOCKER_CONTENT_DIGEST, digest.to_string()),
            (header::CONTENT_LENGTH, "0".to_string()),
        ],
    )
        .into_response())
}

/// Tag list response
#[derive(Debug, serde::Serialize)]
struct TagList {
    name: String,
    tags: Vec<String>,
}

/// List tags for a repository
pub(crate) async fn list_tags(storage: &RegistryStorage, name: &str) -> RegistryResult<Response> {
    let tags = storage.list_tags(name).await?;

    Ok(Json(TagList {
        name: name.to_string(),
        tags,
    })
    .into_response())
}

/// Catalog response
#[derive(Debug, serde::Serialize)]
struct Catalog {
    repositories: Vec<String>,
}

/// List every repository
pub(crate) async fn catalog(storage: &RegistryStorage) -> RegistryResult<Response> {
    let repositories = storage.catalog().await?;
    Ok(Json(Catalog { repositories }).into_response())
}
