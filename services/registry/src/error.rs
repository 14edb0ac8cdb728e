//! Error types for the registry

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use storage::{StorageError, StorageErrorKind};

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Error types for registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Blob not found
    #[error("blob not found: {0}")]
    BlobNotFound(String),

    /// Manifest not found
    #[error("manifest not found: {0}")]
    ManifestNotFound(String),

    /// Repository not known to the remote store
    #[error("repository not found: {0}")]
    RepositoryNotFound(String),

    /// Invalid digest format
    #[error("invalid digest: {0}")]
    InvalidDigest(String),

    /// Storage error
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Invalid manifest
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    /// An index references manifests that are not stored
    #[error("missing referenced manifests: {}", .0.join(", "))]
    MissingManifests(Vec<String>),

    /// Digest mismatch
    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch {
        /// Expected digest
        expected: String,
        /// Actual digest
        actual: String,
    },

    /// Invalid repository name
    #[error("invalid repository name: {0}")]
    InvalidRepository(String),

    /// Invalid tag or digest reference
    #[error("invalid reference: {0}")]
    InvalidReference(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Blob upload invalid
    #[error("blob upload invalid: {0}")]
    BlobUploadInvalid(String),

    /// Nothing was uploaded for this session
    #[error("blob upload unknown: {0}")]
    BlobUploadUnknown(String),
}

impl RegistryError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            RegistryError::BlobNotFound(_)
            | RegistryError::ManifestNotFound(_)
            | RegistryError::RepositoryNotFound(_)
            | RegistryError::BlobUploadUnknown(_) => StatusCode::NOT_FOUND,
            RegistryError::InvalidDigest(_)
            | RegistryError::InvalidManifest(_)
            | RegistryError::MissingManifests(_)
            | RegistryError::InvalidRepository(_)
            | RegistryError::InvalidReference(_)
            | RegistryError::DigestMismatch { .. }
            | RegistryError::BlobUploadInvalid(_) => StatusCode::BAD_REQUEST,
            RegistryError::Storage(error) => match error.kind() {
                // Staged files are only read after being written, so a miss is ours.
                StorageErrorKind::NotFound if error.engine() == storage::LOCAL_STORAGE_NAME => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
                StorageErrorKind::NotFound | StorageErrorKind::RepositoryNotFound => {
                    StatusCode::NOT_FOUND
                }
                StorageErrorKind::PathTraversal | StorageErrorKind::InvalidRequest => {
                    StatusCode::BAD_REQUEST
                }
                StorageErrorKind::InsufficientStorage => StatusCode::INSUFFICIENT_STORAGE,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            RegistryError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code for OCI error responses
    pub fn error_code(&self) -> &'static str {
        match self {
            RegistryError::BlobNotFound(_) => "BLOB_UNKNOWN",
            RegistryError::ManifestNotFound(_) => "MANIFEST_UNKNOWN",
            RegistryError::RepositoryNotFound(_) => "NAME_UNKNOWN",
            RegistryError::InvalidDigest(_) => "DIGEST_INVALID",
            RegistryError::InvalidManifest(_) => "MANIFEST_INVALID",
            RegistryError::MissingManifests(_) => "MANIFEST_BLOB_UNKNOWN",
            RegistryError::DigestMismatch { .. } => "DIGEST_INVALID",
            RegistryError::InvalidRepository(_) => "NAME_INVALID",
            RegistryError::InvalidReference(_) => "MANIFEST_INVALID",
            RegistryError::BlobUploadInvalid(_) => "BLOB_UPLOAD_INVALID",
            RegistryError::BlobUploadUnknown(_) => "BLOB_UPLOAD_UNKNOWN",
            RegistryError::Storage(error) => match error.kind() {
                StorageErrorKind::RepositoryNotFound => "NAME_UNKNOWN",
                StorageErrorKind::PathTraversal => "NAME_INVALID",
                _ => "UNKNOWN",
            },
            RegistryError::Io(_) => "UNKNOWN",
        }
    }

    /// Convert a storage miss into `not_found`, keeping every other error.
    pub(crate) fn or_not_found(error: StorageError, not_found: impl FnOnce() -> Self) -> Self {
        if error.is_not_found() {
            not_found()
        } else {
            error.into()
        }
    }
}

/// OCI error response format
#[derive(Debug, serde::Serialize)]
struct ErrorResponse {
    errors: Vec<ErrorDetail>,
}

#[derive(Debug, serde::Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
    detail: Option<serde_json::Value>,
}

impl IntoResponse for RegistryError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.error_code();
        let message = self.to_string();

        if status.is_server_error() {
            tracing::error!(%status, error = %self, "request failed");
        } else {
            tracing::debug!(%status, error = %self, "request rejected");
        }

        let body = ErrorResponse {
            errors: vec![ErrorDetail {
                code,
                message,
                detail: None,
            }],
        };

        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repository_not_found_is_name_unknown() {
        let error: RegistryError = StorageError::new(
            "sftp",
            StorageErrorKind::RepositoryNotFound,
            std::io::Error::other("missing"),
        )
        .into();
        assert_eq!(error.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(error.error_code(), "NAME_UNKNOWN");
    }

    #[test]
    fn transport_failures_are_server_errors() {
        let error: RegistryError = StorageError::new(
            "sftp",
            StorageErrorKind::ServiceUnavailable,
            std::io::Error::other("connection reset"),
        )
        .into();
        assert_eq!(error.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(error.error_code(), "UNKNOWN");
    }

    #[test]
    fn missing_staged_file_is_a_server_error() {
        let local: RegistryError = StorageError::new(
            storage::LOCAL_STORAGE_NAME,
            StorageErrorKind::NotFound,
            std::io::Error::from(std::io::ErrorKind::NotFound),
        )
        .into();
        assert_eq!(local.status_code(), StatusCode::INTERNAL_SERVER_ERROR);

        let remote: RegistryError = StorageError::new(
            "sftp",
            StorageErrorKind::NotFound,
            std::io::Error::from(std::io::ErrorKind::NotFound),
        )
        .into();
        assert_eq!(remote.status_code(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn error_body_lists_code_and_message() {
        let response = RegistryError::BlobUploadUnknown("abc".into()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["errors"][0]["code"], "BLOB_UPLOAD_UNKNOWN");
        assert!(json["errors"][0]["detail"].is_null());
    }
}
