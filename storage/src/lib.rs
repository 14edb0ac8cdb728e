//! # Storage backends
//!
//! Configuration and unification for the storage backends: the local staging
//! directory, temporary directories for tests, and the pooled SFTP store.

use std::sync::Arc;

use camino::Utf8Path;
#[cfg(feature = "local")]
use camino::Utf8PathBuf;
use serde::Deserialize;

#[cfg(feature = "local")]
pub(crate) mod local;

#[cfg(feature = "tmp")]
pub(crate) mod temp;

#[cfg(feature = "local")]
#[doc(inline)]
pub use local::{LOCAL_STORAGE_NAME, LocalDriver, LocalWriter};

#[cfg(feature = "tmp")]
#[doc(inline)]
pub use temp::TempDriver;

#[doc(inline)]
pub use storage_driver::{
    Driver, FileWriter, Metadata, Progress, Reader, StorageError, StorageErrorKind,
};

/// Which backend a [`Storage`] should be built on.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageConfig {
    /// A directory on the local filesystem.
    #[cfg(feature = "local")]
    Local {
        /// Root directory. Created on build if missing.
        path: Utf8PathBuf,
    },

    /// A temporary directory removed when the storage is dropped.
    #[cfg(feature = "tmp")]
    Temp,

    /// A pool of SFTP sessions.
    #[cfg(feature = "sftp")]
    Sftp(sftp_client::SftpConfig),
}

impl StorageConfig {
    /// Construct the configured backend.
    ///
    /// Local roots are created and checked here; SFTP pools connect every
    /// session here. Either failing is reported immediately.
    #[tracing::instrument]
    pub async fn build(self) -> Result<Storage, StorageError> {
        let client: Storage = match self {
            #[cfg(feature = "local")]
            StorageConfig::Local { path } => {
                let driver = LocalDriver::new(path);
                driver.ensure_root().await?;
                driver.into()
            }
            #[cfg(feature = "tmp")]
            StorageConfig::Temp => TempDriver::new()
                .map_err(StorageError::with("temp", StorageErrorKind::Io))?
                .into(),
            #[cfg(feature = "sftp")]
            StorageConfig::Sftp(config) => config.driver().await?.into(),
        };
        Ok(client)
    }
}

pub(crate) type ArcDriver = Arc<dyn Driver + Send + Sync>;

/// A cheaply cloneable handle to a storage driver.
#[derive(Debug, Clone)]
pub struct Storage {
    driver: ArcDriver,
}

impl<D> From<D> for Storage
where
    D: Driver + Send + Sync + 'static,
{
    fn from(value: D) -> Self {
        Storage::new(value)
    }
}

impl Storage {
    /// Wrap a driver.
    pub fn new<D: Driver + Send + Sync + 'static>(driver: D) -> Self {
        Self {
            driver: Arc::new(driver),
        }
    }

    /// The name of the underlying driver.
    pub fn name(&self) -> &str {
        self.driver.name()
    }

    #[tracing::instrument(skip(self), fields(driver=self.driver.name()))]
    pub async fn get(&self, path: &Utf8Path) -> Result<Vec<u8>, StorageError> {
        tracing::trace!(%path, "reading");
        self.driver.get(path).await
    }

    #[tracing::instrument(skip(self, content, progress), fields(driver=self.driver.name(), size=content.len()))]
    pub async fn put(
        &self,
        path: &Utf8Path,
        content: &[u8],
        progress: Option<&Progress>,
    ) -> Result<(), StorageError> {
        tracing::trace!(%path, "writing");
        self.driver.put(path, content, progress).await
    }

    #[tracing::instrument(skip(self), fields(driver=self.driver.name()))]
    pub async fn reader(&self, path: &Utf8Path, offset: u64) -> Result<Box<Reader<'static>>, StorageError> {
        self.driver.reader(path, offset).await
    }

    #[tracing::instrument(skip(self), fields(driver=self.driver.name()))]
    pub async fn writer(&self, path: &Utf8Path, append: bool) -> Result<Box<dyn FileWriter>, StorageError> {
        self.driver.writer(path, append).await
    }

    #[tracing::instrument(skip(self), fields(driver=self.driver.name()))]
    pub async fn stat(&self, path: &Utf8Path) -> Result<Metadata, StorageError> {
        self.driver.stat(path).await
    }

    #[tracing::instrument(skip(self), fields(driver=self.driver.name()))]
    pub async fn exists(&self, path: &Utf8Path) -> Result<bool, StorageError> {
        self.driver.exists(path).await
    }

    #[tracing::instrument(skip(self), fields(driver=self.driver.name()))]
    pub async fn list(&self, path: &Utf8Path) -> Result<Vec<String>, StorageError> {
        self.driver.list(path).await
    }

    #[tracing::instrument(skip(self), fields(driver=self.driver.name()))]
    pub async fn rename(&self, from: &Utf8Path, to: &Utf8Path) -> Result<(), StorageError> {
        tracing::trace!(%from, %to, "moving");
        self.driver.rename(from, to).await
    }

    #[tracing::instrument(skip(self), fields(driver=self.driver.name()))]
    pub async fn delete(&self, path: &Utf8Path) -> Result<(), StorageError> {
        self.driver.delete(path).await
    }

    #[tracing::instrument(skip(self), fields(driver=self.driver.name()))]
    pub async fn create_dir(&self, path: &Utf8Path) -> Result<(), StorageError> {
        self.driver.create_dir(path).await
    }
}

#[cfg(all(test, feature = "local"))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_config_creates_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().join("staging")).unwrap();

        let config: StorageConfig =
            serde_json::from_value(serde_json::json!({ "local": { "path": root } })).unwrap();
        let storage = config.build().await.unwrap();

        assert_eq!(storage.name(), "local");
        assert!(root.is_dir());

        storage.put(Utf8Path::new("repo/file"), b"abc", None).await.unwrap();
        assert_eq!(storage.stat(Utf8Path::new("repo/file")).await.unwrap().size, 3);
    }
}
