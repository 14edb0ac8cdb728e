use std::{fmt, ops::Deref, sync::Arc};

use camino::Utf8Path;
use chrono::{DateTime, Utc};
use tokio::io;

use crate::error::{StorageError, StorageErrorKind};

/// A reader stream for file contents.
pub type Reader<'r> = dyn io::AsyncRead + Unpin + Send + 'r;

/// Progress callback for buffered writes, called with `(written, total)` bytes.
pub type Progress = dyn Fn(u64, u64) + Send + Sync;

/// File object metadata, which will be generically provided by the driver.
///
/// This struct only provides common metadata fields, and drivers may provide more specific
/// metadata fields directly.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Metadata {
    /// The size of the file in bytes.
    pub size: u64,

    /// The last modification timestamp of the file.
    pub modified: DateTime<Utc>,

    /// Whether this entry is a directory.
    pub is_dir: bool,
}

/// A streaming writer to a single object.
///
/// Bytes written become the object's contents. A writer must be finished
/// with either [`FileWriter::commit`] or [`FileWriter::cancel`]; cancelling
/// removes whatever was written so far.
#[async_trait::async_trait]
pub trait FileWriter: io::AsyncWrite + Unpin + Send + fmt::Debug {
    /// Number of bytes written through this writer so far.
    fn written(&self) -> u64;

    /// Flush and close the object, returning the number of bytes written.
    async fn commit(self: Box<Self>) -> Result<u64, StorageError>;

    /// Close the object and delete it.
    async fn cancel(self: Box<Self>) -> Result<(), StorageError>;
}

/// A storage driver, which provides the ability to interact with a storage backend.
///
/// Paths are relative to the root the driver was configured with.
#[async_trait::async_trait]
pub trait Driver: fmt::Debug + Send + Sync {
    /// The name of the driver.
    fn name(&self) -> &'static str;

    /// Read the whole contents of a file.
    async fn get(&self, path: &Utf8Path) -> Result<Vec<u8>, StorageError>;

    /// Replace the contents of a file, creating parent directories as needed.
    async fn put(
        &self,
        path: &Utf8Path,
        content: &[u8],
        progress: Option<&Progress>,
    ) -> Result<(), StorageError>;

    /// Open a file for streaming reads, starting at `offset`.
    async fn reader(&self, path: &Utf8Path, offset: u64) -> Result<Box<Reader<'static>>, StorageError>;

    /// Open a file for streaming writes, truncating it unless `append` is set.
    async fn writer(&self, path: &Utf8Path, append: bool) -> Result<Box<dyn FileWriter>, StorageError>;

    /// Get the metadata for a file or directory.
    async fn stat(&self, path: &Utf8Path) -> Result<Metadata, StorageError>;

    /// List the names of the entries directly inside a directory.
    async fn list(&self, path: &Utf8Path) -> Result<Vec<String>, StorageError>;

    /// Move a file, creating the destination's parent directories.
    async fn rename(&self, from: &Utf8Path, to: &Utf8Path) -> Result<(), StorageError>;

    /// Delete a file.
    async fn delete(&self, path: &Utf8Path) -> Result<(), StorageError>;

    /// Create a directory and any missing parents. Existing directories are not an error.
    async fn create_dir(&self, path: &Utf8Path) -> Result<(), StorageError>;

    /// Check whether a file or directory exists.
    async fn exists(&self, path: &Utf8Path) -> Result<bool, StorageError> {
        match self.stat(path).await {
            Ok(_) => Ok(true),
            Err(error) if error.kind() == StorageErrorKind::NotFound => Ok(false),
            Err(error) => Err(error),
        }
    }
}

#[async_trait::async_trait]
impl<D> Driver for Arc<D>
where
    D: ?Sized + Driver + 'static,
{
    fn name(&self) -> &'static str {
        self.deref().name()
    }

    async fn get(&self, path: &Utf8Path) -> Result<Vec<u8>, StorageError> {
        self.deref().get(path).await
    }

    async fn put(
        &self,
        path: &Utf8Path,
        content: &[u8],
        progress: Option<&Progress>,
    ) -> Result<(), StorageError> {
        self.deref().put(path, content, progress).await
    }

    async fn reader(&self, path: &Utf8Path, offset: u64) -> Result<Box<Reader<'static>>, StorageError> {
        self.deref().reader(path, offset).await
    }

    async fn writer(&self, path: &Utf8Path, append: bool) -> Result<Box<dyn FileWriter>, StorageError> {
        self.deref().writer(path, append).await
    }

    async fn stat(&self, path: &Utf8Path) -> Result<Metadata, StorageError> {
        self.deref().stat(path).await
    }

    async fn list(&self, path: &Utf8Path) -> Result<Vec<String>, StorageError> {
        self.deref().list(path).await
    }

    async fn rename(&self, from: &Utf8Path, to: &Utf8Path) -> Result<(), StorageError> {
        self.deref().rename(from, to).await
    }

    async fn delete(&self, path: &Utf8Path) -> Result<(), StorageError> {
        self.deref().delete(path).await
    }

    async fn create_dir(&self, path: &Utf8Path) -> Result<(), StorageError> {
        self.deref().create_dir(path).await
    }

    async fn exists(&self, path: &Utf8Path) -> Result<bool, StorageError> {
        self.deref().exists(path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static_assertions::assert_obj_safe!(Driver);
    static_assertions::assert_obj_safe!(FileWriter);
}
