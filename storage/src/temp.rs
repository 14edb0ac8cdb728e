use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::TempDir;

use crate::local::LocalDriver;
use storage_driver::{Driver, FileWriter, Metadata, Progress, Reader, StorageError};

/// A storage driver that stores files in a temporary directory.
///
/// The directory is removed when the driver is dropped.
#[derive(Debug)]
pub struct TempDriver {
    #[allow(unused)]
    dir: TempDir,
    driver: LocalDriver,
}

impl TempDriver {
    /// Create a new `TempDriver` instance, storing files in a temporary directory.
    pub fn new() -> io::Result<Self> {
        let tmp = TempDir::new()?;
        let root = Utf8PathBuf::from_path_buf(tmp.path().to_owned()).map_err(|path| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("temporary directory is not UTF-8: {}", path.display()),
            )
        })?;

        Ok(Self {
            dir: tmp,
            driver: LocalDriver::new(root),
        })
    }

    /// The temporary directory backing this driver.
    pub fn root(&self) -> &Utf8Path {
        self.driver.root()
    }
}

#[async_trait::async_trait]
impl Driver for TempDriver {
    fn name(&self) -> &'static str {
        "temp"
    }

    async fn get(&self, path: &Utf8Path) -> Result<Vec<u8>, StorageError> {
        self.driver.get(path).await
    }

    async fn put(
        &self,
        path: &Utf8Path,
        content: &[u8],
        progress: Option<&Progress>,
    ) -> Result<(), StorageError> {
        self.driver.put(path, content, progress).await
    }

    async fn reader(&self, path: &Utf8Path, offset: u64) -> Result<Box<Reader<'static>>, StorageError> {
        self.driver.reader(path, offset).await
    }

    async fn writer(&self, path: &Utf8Path, append: bool) -> Result<Box<dyn FileWriter>, StorageError> {
        self.driver.writer(path, append).await
    }

    async fn stat(&self, path: &Utf8Path) -> Result<Metadata, StorageError> {
        self.driver.stat(path).await
    }

    async fn list(&self, path: &Utf8Path) -> Result<Vec<String>, StorageError> {
        self.driver.list(path).await
    }

    async fn rename(&self, from: &Utf8Path, to: &Utf8Path) -> Result<(), StorageError> {
        self.driver.rename(from, to).await
    }

    async fn delete(&self, path: &Utf8Path) -> Result<(), StorageError> {
        self.driver.delete(path).await
    }

    async fn create_dir(&self, path: &Utf8Path) -> Result<(), StorageError> {
        self.driver.create_dir(path).await
    }
}
