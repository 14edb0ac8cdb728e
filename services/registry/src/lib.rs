//! # Container Registry
//!
//! A container registry server that keeps image content on a slow, remote,
//! connection-limited store (SFTP), using a local directory as a staging
//! buffer.
//!
//! ## Features
//!
//! - Push and pull of blobs and manifests, chunked and monolithic uploads
//! - Streaming uploads hashed on their way to the remote store
//! - Replication with a global transfer limit, per-path locking,
//!   existence-based deduplication and retries with backoff
//! - Synchronous or asynchronous replication
//! - Tag and catalog listing from the remote store
//! - Background removal of abandoned uploads
//!
//! ## Example
//!
//! ```no_run
//! use registry::RegistryBuilder;
//! use sftp_client::SftpConfig;
//! use storage::{LocalDriver, Storage};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let remote = SftpConfig::new("sftp.example.com", "registry", "hunter2")
//!     .driver()
//!     .await?;
//! let local = LocalDriver::new("/var/lib/registry");
//! local.ensure_root().await?;
//!
//! let registry = RegistryBuilder::new()
//!     .local(Storage::new(local))
//!     .remote(Storage::new(remote))
//!     .build();
//!
//! // Use the registry service with axum or any tower-compatible server
//! # Ok(())
//! # }
//! ```

mod api;
mod blob;
mod config;
mod digest;
mod document;
mod error;
mod manifest;
mod metadata;
mod replication;
mod route;
mod signatures;
mod storage;
mod sweep;
mod validate;

pub use api::{RegistryBuilder, router};
pub use config::{RegistryConfig, ReplicationConfig};
pub use digest::{Algorithm, Digest, Digester, HashingWriter};
pub use document::{Descriptor, ManifestDocument};
pub use error::{RegistryError, RegistryResult};
pub use metadata::{ImageRecord, LayerRecord, MemoryMetadata, MetadataError, MetadataStore, RepositoryRecord};
pub use replication::{Backoff, Replicated, ReplicationCoordinator, ReplicationGuard, ReplicationMode};
pub use route::RegistryPath;
pub use storage::{BlobReader, RegistryStorage, blob_path, manifest_path, upload_path};
pub use sweep::{SweepConfig, UploadSweeper};
pub use validate::{is_valid_reference, is_valid_repo_name, validate_reference, validate_repo_name};
