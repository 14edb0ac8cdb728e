use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use tokio::io::{self, AsyncSeekExt, AsyncWrite, AsyncWriteExt};

use storage_driver::{
    Driver, FileWriter, Metadata, Progress, Reader, StorageError, StorageErrorKind,
};

/// Engine name reported by [`LocalDriver`] and its errors.
pub const LOCAL_STORAGE_NAME: &str = "local";

const ENGINE: &str = LOCAL_STORAGE_NAME;

static PARTIAL_COUNTER: AtomicU64 = AtomicU64::new(0);

fn io_error<'a>(op: &'static str, path: &'a Utf8Path) -> impl FnOnce(io::Error) -> StorageError + 'a {
    move |err| {
        StorageError::builder(ENGINE, err.kind().into(), err)
            .path(path.as_str())
            .context(op)
            .build()
    }
}

fn traversal(path: &Utf8Path) -> StorageError {
    StorageError::builder(
        ENGINE,
        StorageErrorKind::PathTraversal,
        eyre::eyre!("{path} resolves outside of the storage root"),
    )
    .path(path.as_str())
    .build()
}

/// Filesystem driver confined to a single root directory.
///
/// Relative paths are resolved under the root. Any path with `..`, an
/// absolute component, or a symlink that leads outside of the root is
/// rejected with [`StorageErrorKind::PathTraversal`] before the operation runs.
#[derive(Debug, Clone)]
pub struct LocalDriver {
    root: Utf8PathBuf,
}

impl LocalDriver {
    /// Create a driver rooted at `root`.
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The directory every path is resolved under.
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Create the root directory if it is missing and check that it can be read.
    pub async fn ensure_root(&self) -> Result<(), StorageError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(io_error("create root", &self.root))?;
        tokio::fs::read_dir(&self.root)
            .await
            .map_err(io_error("read root", &self.root))?;
        Ok(())
    }

    fn resolve(&self, path: &Utf8Path) -> Result<Utf8PathBuf, StorageError> {
        let mut full = self.root.clone();
        for component in path.components() {
            match component {
                Utf8Component::Normal(part) => full.push(part),
                Utf8Component::CurDir => {}
                Utf8Component::ParentDir | Utf8Component::RootDir | Utf8Component::Prefix(_) => {
                    return Err(traversal(path));
                }
            }
        }
        Ok(full)
    }

    /// Check that the deepest existing ancestor of `full` does not leave the root through a symlink.
    async fn confine(&self, full: &Utf8Path) -> Result<(), StorageError> {
        let root = match tokio::fs::canonicalize(&self.root).await {
            Ok(root) => root,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(io_error("canonicalize root", &self.root)(err)),
        };

        for ancestor in full.ancestors() {
            match tokio::fs::canonicalize(ancestor).await {
                Ok(real) if real.starts_with(&root) => return Ok(()),
                Ok(_) => return Err(traversal(full)),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    // A dangling symlink has no canonical form, but writing through it would follow it.
                    // Anything else found here was created after the lookup; its parent decides.
                    match tokio::fs::symlink_metadata(ancestor).await {
                        Ok(metadata) if metadata.file_type().is_symlink() => {
                            return Err(traversal(full));
                        }
                        _ => {}
                    }
                }
                Err(err) => return Err(io_error("canonicalize", ancestor)(err)),
            }
        }
        Ok(())
    }

    async fn confined(&self, path: &Utf8Path) -> Result<Utf8PathBuf, StorageError> {
        let full = self.resolve(path)?;
        self.confine(&full).await?;
        Ok(full)
    }

    async fn create_parent(&self, full: &Utf8Path) -> Result<(), StorageError> {
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(io_error("create_dir_all", parent))?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Driver for LocalDriver {
    fn name(&self) -> &'static str {
        ENGINE
    }

    async fn get(&self, path: &Utf8Path) -> Result<Vec<u8>, StorageError> {
        let full = self.confined(path).await?;
        tokio::fs::read(&full).await.map_err(io_error("read", path))
    }

    async fn put(
        &self,
        path: &Utf8Path,
        content: &[u8],
        progress: Option<&Progress>,
    ) -> Result<(), StorageError> {
        let full = self.confined(path).await?;
        self.create_parent(&full).await?;

        let name = full.file_name().unwrap_or("object");
        let partial = full.with_file_name(format!(
            ".{name}.{}.{}.partial",
            std::process::id(),
            PARTIAL_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));

        if let Err(err) = tokio::fs::write(&partial, content).await {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(io_error("write", path)(err));
        }

        if let Err(err) = tokio::fs::rename(&partial, &full).await {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(io_error("rename into place", path)(err));
        }

        if let Some(progress) = progress {
            let total = content.len() as u64;
            progress(total, total);
        }

        tracing::trace!(%path, size = content.len(), "wrote local object");
        Ok(())
    }

    async fn reader(&self, path: &Utf8Path, offset: u64) -> Result<Box<Reader<'static>>, StorageError> {
        let full = self.confined(path).await?;
        let mut file = tokio::fs::File::open(&full)
            .await
            .map_err(io_error("open", path))?;
        if offset > 0 {
            file.seek(io::SeekFrom::Start(offset))
                .await
                .map_err(io_error("seek", path))?;
        }
        Ok(Box::new(io::BufReader::new(file)))
    }

    async fn writer(&self, path: &Utf8Path, append: bool) -> Result<Box<dyn FileWriter>, StorageError> {
        let full = self.confined(path).await?;
        self.create_parent(&full).await?;

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(&full)
            .await
            .map_err(io_error("open for writing", path))?;

        Ok(Box::new(LocalWriter {
            path: full,
            file,
            written: 0,
        }))
    }

    async fn stat(&self, path: &Utf8Path) -> Result<Metadata, StorageError> {
        let full = self.confined(path).await?;
        let metadata = tokio::fs::metadata(&full)
            .await
            .map_err(io_error("metadata", path))?;
        let modified = metadata
            .modified()
            .map_err(io_error("modified time", path))?;
        Ok(Metadata {
            size: metadata.len(),
            modified: modified.into(),
            is_dir: metadata.is_dir(),
        })
    }

    async fn list(&self, path: &Utf8Path) -> Result<Vec<String>, StorageError> {
        let full = self.confined(path).await?;
        let mut entries = tokio::fs::read_dir(&full)
            .await
            .map_err(io_error("read_dir", path))?;

        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(io_error("read_dir entry", path))?
        {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_owned());
            }
        }
        names.sort();

        tracing::trace!(%path, "found {} entries", names.len());
        Ok(names)
    }

    async fn rename(&self, from: &Utf8Path, to: &Utf8Path) -> Result<(), StorageError> {
        let source = self.confined(from).await?;
        let target = self.confined(to).await?;
        self.create_parent(&target).await?;
        tokio::fs::rename(&source, &target)
            .await
            .map_err(io_error("rename", from))
    }

    async fn delete(&self, path: &Utf8Path) -> Result<(), StorageError> {
        let full = self.confined(path).await?;
        let metadata = match tokio::fs::symlink_metadata(&full).await {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(io_error("metadata", path)(err)),
        };

        let result = if metadata.is_dir() {
            tokio::fs::remove_dir_all(&full).await
        } else {
            tokio::fs::remove_file(&full).await
        };

        match result {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(io_error("remove", path)(err)),
        }
    }

    async fn create_dir(&self, path: &Utf8Path) -> Result<(), StorageError> {
        let full = self.confined(path).await?;
        tokio::fs::create_dir_all(&full)
            .await
            .map_err(io_error("create_dir_all", path))
    }
}

/// Streaming writer for a file under a [`LocalDriver`] root.
#[derive(Debug)]
pub struct LocalWriter {
    path: Utf8PathBuf,
    file: tokio::fs::File,
    written: u64,
}

impl AsyncWrite for LocalWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let poll = Pin::new(&mut self.file).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = poll {
            self.written += n as u64;
        }
        poll
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.file).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.file).poll_shutdown(cx)
    }
}

#[async_trait::async_trait]
impl FileWriter for LocalWriter {
    fn written(&self) -> u64 {
        self.written
    }

    async fn commit(mut self: Box<Self>) -> Result<u64, StorageError> {
        self.file
            .flush()
            .await
            .map_err(io_error("flush", &self.path))?;
        self.file
            .sync_all()
            .await
            .map_err(io_error("sync", &self.path))?;
        Ok(self.written)
    }

    async fn cancel(self: Box<Self>) -> Result<(), StorageError> {
        let LocalWriter { path, file, .. } = *self;
        drop(file);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(io_error("remove", &path)(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn driver() -> (tempfile::TempDir, LocalDriver) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_owned()).unwrap();
        (dir, LocalDriver::new(root))
    }

    #[tokio::test]
    async fn put_creates_parents_and_replaces() {
        let (_dir, driver) = driver();
        let path = Utf8Path::new("library/app/blobs/sha256:abc");

        driver.put(path, b"first", None).await.unwrap();
        driver.put(path, b"second", None).await.unwrap();

        assert_eq!(driver.get(path).await.unwrap(), b"second");
        assert_eq!(
            driver.list(Utf8Path::new("library/app/blobs")).await.unwrap(),
            vec!["sha256:abc".to_owned()]
        );
    }

    #[tokio::test]
    async fn parent_components_are_rejected() {
        let (_dir, driver) = driver();
        let err = driver
            .put(Utf8Path::new("../etc/passwd"), b"x", None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), StorageErrorKind::PathTraversal);

        let err = driver.get(Utf8Path::new("/etc/passwd")).await.unwrap_err();
        assert_eq!(err.kind(), StorageErrorKind::PathTraversal);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlinks_out_of_root_are_rejected() {
        let (dir, driver) = driver();
        let outside = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("escape")).unwrap();

        let err = driver
            .put(Utf8Path::new("escape/file"), b"x", None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), StorageErrorKind::PathTraversal);
        assert!(!outside.path().join("file").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn dangling_symlinks_are_rejected() {
        let (dir, driver) = driver();
        let outside = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path().join("missing"), dir.path().join("dangling")).unwrap();

        let err = driver
            .put(Utf8Path::new("dangling/file"), b"x", None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), StorageErrorKind::PathTraversal);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writers_share_new_directories() {
        for _ in 0..20 {
            let (_dir, driver) = driver();
            let writers: Vec<_> = (0..12)
                .map(|session| {
                    let driver = driver.clone();
                    tokio::spawn(async move {
                        let path = Utf8PathBuf::from(format!("app/blobs/uploads/{session}"));
                        let mut writer = driver.writer(&path, true).await?;
                        writer.write_all(&[7; 4096]).await.map_err(io_error("write", &path))?;
                        writer.commit().await
                    })
                })
                .collect();

            for writer in writers {
                assert_eq!(writer.await.unwrap().unwrap(), 4096);
            }
            assert_eq!(
                driver.list(Utf8Path::new("app/blobs/uploads")).await.unwrap().len(),
                12
            );
        }
    }

    #[tokio::test]
    async fn appending_writer_accumulates_chunks() {
        let (_dir, driver) = driver();
        let path = Utf8Path::new("app/blobs/uploads/session");

        for chunk in [&b"hello "[..], &b"world"[..]] {
            let mut writer = driver.writer(path, true).await.unwrap();
            writer.write_all(chunk).await.unwrap();
            assert_eq!(writer.written(), chunk.len() as u64);
            writer.commit().await.unwrap();
        }

        let mut reader = driver.reader(path, 6).await.unwrap();
        let mut tail = String::new();
        reader.read_to_string(&mut tail).await.unwrap();
        assert_eq!(tail, "world");
    }

    #[tokio::test]
    async fn cancelled_writer_removes_file() {
        let (_dir, driver) = driver();
        let path = Utf8Path::new("app/partial");

        let mut writer = driver.writer(path, false).await.unwrap();
        writer.write_all(b"partial").await.unwrap();
        writer.cancel().await.unwrap();

        assert!(!driver.exists(path).await.unwrap());
    }

    #[tokio::test]
    async fn rename_promotes_into_new_directory() {
        let (_dir, driver) = driver();
        let staged = Utf8Path::new("app/blobs/uploads/id");
        let target = Utf8Path::new("app/blobs/sha256:def");

        driver.put(staged, b"layer", None).await.unwrap();
        driver.rename(staged, target).await.unwrap();

        assert!(!driver.exists(staged).await.unwrap());
        assert_eq!(driver.stat(target).await.unwrap().size, 5);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let (_dir, driver) = driver();
        let path = Utf8Path::new("app/file");
        driver.put(path, b"x", None).await.unwrap();

        driver.delete(path).await.unwrap();
        driver.delete(path).await.unwrap();
        assert!(driver.get(path).await.unwrap_err().is_not_found());
    }
}
