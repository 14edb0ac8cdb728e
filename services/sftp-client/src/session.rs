//! The operations a single remote session offers.

use std::fmt;

use camino::Utf8Path;
use tokio::io;

use storage_driver::{Metadata, Reader, StorageError};

/// A writer to a single remote file.
pub type RemoteWriter = dyn io::AsyncWrite + Unpin + Send;

/// One authenticated session with the remote server.
///
/// Operations map one-to-one onto SFTP requests. Paths are passed through
/// untouched; resolving them under a root is the caller's job.
#[async_trait::async_trait]
pub trait RemoteSession: fmt::Debug + Send + Sync {
    /// Attributes of a file or directory.
    async fn stat(&self, path: &Utf8Path) -> Result<Metadata, StorageError>;

    /// Names of the entries in a directory, excluding `.` and `..`.
    async fn read_dir(&self, path: &Utf8Path) -> Result<Vec<String>, StorageError>;

    /// Create one directory. Fails if it exists or its parent does not.
    async fn mkdir(&self, path: &Utf8Path) -> Result<(), StorageError>;

    /// Remove a file.
    async fn remove(&self, path: &Utf8Path) -> Result<(), StorageError>;

    /// Remove an empty directory.
    async fn remove_dir(&self, path: &Utf8Path) -> Result<(), StorageError>;

    /// Rename a file. Fails if the target exists.
    async fn rename(&self, from: &Utf8Path, to: &Utf8Path) -> Result<(), StorageError>;

    /// Open a file for reading from `offset`.
    async fn open_read(&self, path: &Utf8Path, offset: u64) -> Result<Box<Reader<'static>>, StorageError>;

    /// Open a file for writing, creating it and truncating it unless `append` is set.
    async fn open_write(&self, path: &Utf8Path, append: bool) -> Result<Box<RemoteWriter>, StorageError>;

    /// Bytes available to this user on the filesystem holding `path`, if the server reports it.
    async fn available_space(&self, path: &Utf8Path) -> Result<Option<u64>, StorageError>;

    /// Whether the underlying transport is still usable.
    async fn is_alive(&self) -> bool;
}

/// Establishes new sessions for a [`SessionPool`](crate::SessionPool).
#[async_trait::async_trait]
pub trait Connector: fmt::Debug + Send + Sync + 'static {
    /// The session type produced by this connector.
    type Session: RemoteSession + 'static;

    /// Connect and authenticate a new session.
    async fn connect(&self) -> Result<Self::Session, StorageError>;
}
