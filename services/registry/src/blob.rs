//! Blob operations for the registry

use axum::body::Body;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use futures::TryStreamExt as _;
use tokio_util::io::{ReaderStream, StreamReader};

use crate::digest::Digest;
use crate::error::{RegistryError, RegistryResult};
use crate::storage::RegistryStorage;
use crate::validate::is_valid_reference;

/// `Docker-Content-Digest` response header.
pub(crate) const DOCKER_CONTENT_DIGEST: header::HeaderName =
    header::HeaderName::from_static("docker-content-digest");

/// `Docker-Upload-UUID` response header.
pub(crate) const DOCKER_UPLOAD_UUID: header::HeaderName = header::HeaderName::from_static("docker-upload-uuid");

/// Adapt a request body into a buffered reader.
pub(crate) fn body_reader(body: Body) -> impl tokio::io::AsyncBufRead + Unpin + Send {
    StreamReader::new(body.into_data_stream().map_err(std::io::Error::other))
}

fn upload_location(name: &str, session: &str) -> String {
    format!("/v2/{name}/blobs/uploads/{session}")
}

fn blob_location(name: &str, digest: &Digest) -> String {
    format!("/v2/{name}/blobs/{digest}")
}

/// The `Range` header value for `size` staged bytes.
fn upload_range(size: u64) -> String {
    format!("0-{}", size.saturating_sub(1))
}

fn parse_digest(digest: &str) -> RegistryResult<Digest> {
    if !is_valid_reference(digest) {
        return Err(RegistryError::InvalidDigest(digest.to_string()));
    }
    Digest::parse(digest)
}

fn check_session(session: &str) -> RegistryResult<()> {
    if is_valid_reference(session) {
        Ok(())
    } else {
        Err(RegistryError::BlobUploadInvalid(format!("invalid upload session {session:?}")))
    }
}

fn committed(name: &str, digest: &Digest) -> Response {
    (
        StatusCode::CREATED,
        [
            (header::LOCATION, blob_location(name, digest)),
            (DOCKER_CONTENT_DIGEST, digest.to_string()),
            (header::CONTENT_LENGTH, "0".to_string()),
        ],
    )
        .into_response()
}

/// Get a blob, or only its headers for a `HEAD` request
pub(crate) async fn get_blob(
    storage: &RegistryStorage,
    name: &str,
    digest: &str,
    head: bool,
) -> RegistryResult<Response> {
    let digest = parse_digest(digest)?;

    let headers = |size: u64| {
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::CONTENT_LENGTH, size.to_string()),
            (DOCKER_CONTENT_DIGEST, digest.to_string()),
        ]
    };

    if head {
        let size = storage.blob_size(name, &digest).await?;
        return Ok((StatusCode::OK, headers(size)).into_response());
    }

    let blob = storage.get_blob(name, &digest).await?;
    let body = Body::from_stream(ReaderStream::new(blob.reader));
    Ok((StatusCode::OK, headers(blob.size), body).into_response())
}

/// Start a blob upload session, or upload a whole blob when `digest` is given
pub(crate) async fn start_blob_upload(
    storage: &RegistryStorage,
    name: &str,
    digest: Option<&str>,
    body: Body,
) -> RegistryResult<Response> {
    if let Some(digest) = digest {
        let digest = storage
            .commit_upload(name, None, digest, body_reader(body))
            .await?;
        return Ok(committed(name, &digest));
    }

    let session = storage.start_upload(name).await?;

    Ok((
        StatusCode::ACCEPTED,
        [
            (header::LOCATION, upload_location(name, &session)),
            (header::RANGE, "0-0".to_string()),
            (header::CONTENT_LENGTH, "0".to_string()),
            (DOCKER_UPLOAD_UUID, session),
        ],
    )
        .into_response())
}

/// Append a chunk to an upload
pub(crate) async fn patch_blob_upload(
    storage: &RegistryStorage,
    name: &str,
    session: &str,
    body: Body,
) -> RegistryResult<Response> {
    check_session(session)?;

    let mut reader = body_reader(body);
    let size = storage.append_upload(name, session, &mut reader).await?;

    Ok((
        StatusCode::CREATED,
        [
            (header::LOCATION, upload_location(name, session)),
            (header::RANGE, upload_range(size)),
            (header::CONTENT_LENGTH, "0".to_string()),
            (DOCKER_UPLOAD_UUID, session.to_string()),
        ],
    )
        .into_response())
}

/// Complete a blob upload
pub(crate) async fn complete_blob_upload(
    storage: &RegistryStorage,
    name: &str,
    session: &str,
    digest: Option<&str>,
    body: Body,
) -> RegistryResult<Response> {
    check_session(session)?;
    let digest = digest.ok_or_else(|| RegistryError::InvalidDigest("missing digest parameter".into()))?;

    let digest = storage
        .commit_upload(name, Some(session), digest, body_reader(body))
        .await?;
    Ok(committed(name, &digest))
}

/// Report the progress of an upload. A `GET` carrying a digest commits it instead.
pub(crate) async fn blob_upload_status(
    storage: &RegistryStorage,
    name: &str,
    session: &str,
    digest: Option<&str>,
    head: bool,
) -> RegistryResult<Response> {
    check_session(session)?;

    if let (Some(digest), false) = (digest, head) {
        let digest = storage
            .commit_upload(name, Some(session), digest, tokio::io::empty())
            .await?;
        return Ok(committed(name, &digest));
    }

    let size = storage.upload_size(name, session).await?;
    let status = if size == 0 {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::OK
    };

    Ok((
        status,
        [
            (header::LOCATION, upload_location(name, session)),
            (header::RANGE, upload_range(size)),
            (DOCKER_UPLOAD_UUID, session.to_string()),
        ],
    )
        .into_response())
}

/// Cancel a blob upload
pub(crate) async fn cancel_blob_upload(
    storage: &RegistryStorage,
    name: &str,
    session: &str,
) -> RegistryResult<StatusCode> {
    check_session(session)?;
    storage.cancel_upload(name, session).await?;
    Ok(StatusCode::NO_CONTENT)
}
