//! The storage driver on top of the session pool.

use std::pin::Pin;
use std::task::{Context, Poll};

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

use storage_driver::{
    Driver, FileWriter, Metadata, Progress, Reader, StorageError, StorageErrorKind,
};

use crate::pool::{PooledSession, SessionPool};
use crate::session::{Connector, RemoteSession, RemoteWriter};
use crate::sftp::SftpConnector;
use crate::{CHUNK_SIZE, SFTP_STORAGE_NAME};

/// A pooled driver connected to a real SFTP server.
pub type SftpDriver = PooledDriver<SftpConnector>;

fn io_error<'a>(op: &'static str, path: &'a Utf8Path) -> impl FnOnce(io::Error) -> StorageError + 'a {
    move |error| {
        StorageError::builder(SFTP_STORAGE_NAME, error.kind().into(), error)
            .path(path.as_str())
            .context(op)
            .build()
    }
}

fn invalid_path(path: &Utf8Path) -> StorageError {
    StorageError::builder(
        SFTP_STORAGE_NAME,
        StorageErrorKind::PathTraversal,
        eyre::eyre!("{path} is not a relative path below the remote root"),
    )
    .path(path.as_str())
    .build()
}

/// Storage driver for a remote server, borrowing a pooled session for every operation.
///
/// Paths are resolved under `root`. The first component of a path names its
/// repository: writes, renames and deletes fail with
/// [`StorageErrorKind::RepositoryNotFound`] unless `root/<repository>`
/// already exists. Directories below the repository are created as needed.
///
/// Buffered writes are sent in [`CHUNK_SIZE`] pieces after checking that the
/// server has room for them. A write that fails part way removes the partial
/// object before the error is returned.
pub struct PooledDriver<C: Connector> {
    pool: SessionPool<C>,
    root: Utf8PathBuf,
}

impl<C: Connector> std::fmt::Debug for PooledDriver<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledDriver")
            .field("pool", &self.pool)
            .field("root", &self.root)
            .finish()
    }
}

impl<C: Connector> PooledDriver<C> {
    /// Create a driver over `pool`, resolving paths under `root`.
    pub fn new(pool: SessionPool<C>, root: impl Into<Utf8PathBuf>) -> Self {
        Self {
            pool,
            root: root.into(),
        }
    }

    /// The session pool backing this driver.
    pub fn pool(&self) -> &SessionPool<C> {
        &self.pool
    }

    /// The remote directory under which paths are resolved.
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn resolve(&self, path: &Utf8Path) -> Result<Utf8PathBuf, StorageError> {
        let mut full = self.root.clone();
        for component in path.components() {
            match component {
                Utf8Component::Normal(part) => full.push(part),
                Utf8Component::CurDir => {}
                _ => return Err(invalid_path(path)),
            }
        }
        Ok(full)
    }

    fn repository_dir(&self, path: &Utf8Path) -> Result<Utf8PathBuf, StorageError> {
        match path.components().find(|c| matches!(c, Utf8Component::Normal(_))) {
            Some(Utf8Component::Normal(repository)) => Ok(self.root.join(repository)),
            _ => Err(invalid_path(path)),
        }
    }

    async fn check_repository(&self, session: &C::Session, path: &Utf8Path) -> Result<(), StorageError> {
        let repository = self.repository_dir(path)?;
        match session.stat(&repository).await {
            Ok(metadata) if metadata.is_dir => Ok(()),
            Ok(_) => Err(repository_missing(&repository)),
            Err(error) if error.is_not_found() => Err(repository_missing(&repository)),
            Err(error) => Err(error),
        }
    }

    /// Check the repository and create the parent directory of `full`.
    async fn prepare_write(
        &self,
        session: &C::Session,
        path: &Utf8Path,
        full: &Utf8Path,
    ) -> Result<(), StorageError> {
        self.check_repository(session, path).await?;
        if let Some(parent) = full.parent() {
            ensure_dir(session, parent).await?;
        }
        Ok(())
    }

    /// Remove a partially written object after a failed write.
    async fn discard(&self, full: &Utf8Path) {
        let session = match self.pool.acquire().await {
            Ok(session) => session,
            Err(error) => {
                tracing::warn!(path = %full, %error, "could not remove partial object");
                return;
            }
        };
        match session.track(session.remove(full).await) {
            Ok(()) => tracing::debug!(path = %full, "removed partial object"),
            Err(error) if error.is_not_found() => {}
            Err(error) => tracing::warn!(path = %full, %error, "could not remove partial object"),
        }
    }
}

fn repository_missing(repository: &Utf8Path) -> StorageError {
    StorageError::builder(
        SFTP_STORAGE_NAME,
        StorageErrorKind::RepositoryNotFound,
        eyre::eyre!("repository directory {repository} does not exist"),
    )
    .path(repository.as_str())
    .build()
}

/// Create `dir` and any missing parents. Directories that already exist, or
/// that another session creates concurrently, are not an error.
async fn ensure_dir<S: RemoteSession + ?Sized>(session: &S, dir: &Utf8Path) -> Result<(), StorageError> {
    match session.stat(dir).await {
        Ok(metadata) if metadata.is_dir => return Ok(()),
        Ok(_) => {
            return Err(StorageError::builder(
                SFTP_STORAGE_NAME,
                StorageErrorKind::Io,
                eyre::eyre!("{dir} exists and is not a directory"),
            )
            .path(dir.as_str())
            .build());
        }
        Err(error) if error.is_not_found() => {}
        Err(error) => return Err(error),
    }

    let mut current = Utf8PathBuf::new();
    for component in dir.components() {
        current.push(component);
        match session.stat(&current).await {
            Ok(metadata) if metadata.is_dir => continue,
            Ok(_) | Err(_) => {}
        }
        if let Err(error) = session.mkdir(&current).await {
            match session.stat(&current).await {
                Ok(metadata) if metadata.is_dir => {}
                _ => return Err(error),
            }
        } else {
            tracing::trace!(dir = %current, "created remote directory");
        }
    }
    Ok(())
}

async fn check_capacity<S: RemoteSession + ?Sized>(
    session: &S,
    dir: &Utf8Path,
    needed: u64,
) -> Result<(), StorageError> {
    match session.available_space(dir).await? {
        Some(available) if available < needed => Err(StorageError::builder(
            SFTP_STORAGE_NAME,
            StorageErrorKind::InsufficientStorage,
            eyre::eyre!("{needed} bytes needed but only {available} available"),
        )
        .path(dir.as_str())
        .build()),
        _ => Ok(()),
    }
}

async fn write_chunks<S: RemoteSession + ?Sized>(
    session: &S,
    full: &Utf8Path,
    content: &[u8],
    progress: Option<&Progress>,
) -> Result<(), StorageError> {
    let mut writer = session.open_write(full, false).await?;
    let total = content.len() as u64;
    let mut written = 0u64;
    let mut reported = 0u64;

    for chunk in content.chunks(CHUNK_SIZE) {
        writer
            .write_all(chunk)
            .await
            .map_err(io_error("write", full))?;
        written += chunk.len() as u64;

        if let Some(progress) = progress {
            let decile = written * 10 / total;
            if decile > reported {
                reported = decile;
                progress(written, total);
            }
        }
    }

    writer.shutdown().await.map_err(io_error("close", full))?;
    Ok(())
}

#[async_trait::async_trait]
impl<C: Connector> Driver for PooledDriver<C> {
    fn name(&self) -> &'static str {
        SFTP_STORAGE_NAME
    }

    async fn get(&self, path: &Utf8Path) -> Result<Vec<u8>, StorageError> {
        let full = self.resolve(path)?;
        let session = self.pool.acquire().await?;
        let mut reader = session.track(session.open_read(&full, 0).await)?;
        let mut content = Vec::new();
        let read = reader
            .read_to_end(&mut content)
            .await
            .map_err(io_error("read", &full));
        session.track(read)?;
        Ok(content)
    }

    #[tracing::instrument(skip(self, content, progress), fields(size = content.len()))]
    async fn put(
        &self,
        path: &Utf8Path,
        content: &[u8],
        progress: Option<&Progress>,
    ) -> Result<(), StorageError> {
        let full = self.resolve(path)?;
        let session = self.pool.acquire().await?;
        session.track(self.prepare_write(&session, path, &full).await)?;

        let parent = full.parent().unwrap_or(&self.root);
        session.track(check_capacity(&*session, parent, content.len() as u64).await)?;

        let written = session.track(write_chunks(&*session, &full, content, progress).await);
        if let Err(error) = written {
            tracing::warn!(%path, %error, "remote write failed");
            drop(session);
            self.discard(&full).await;
            return Err(error);
        }

        tracing::debug!(%path, "stored remote object");
        Ok(())
    }

    async fn reader(&self, path: &Utf8Path, offset: u64) -> Result<Box<Reader<'static>>, StorageError> {
        let full = self.resolve(path)?;
        let session = self.pool.acquire().await?;
        let inner = session.track(session.open_read(&full, offset).await)?;
        Ok(Box::new(PooledReader {
            inner,
            _session: session,
        }))
    }

    async fn writer(&self, path: &Utf8Path, append: bool) -> Result<Box<dyn FileWriter>, StorageError> {
        let full = self.resolve(path)?;
        let session = self.pool.acquire().await?;
        session.track(self.prepare_write(&session, path, &full).await)?;
        let inner = session.track(session.open_write(&full, append).await)?;

        Ok(Box::new(PooledWriter {
            inner,
            session: Some(session),
            pool: self.pool.clone(),
            path: full,
            written: 0,
        }))
    }

    async fn stat(&self, path: &Utf8Path) -> Result<Metadata, StorageError> {
        let full = self.resolve(path)?;
        let session = self.pool.acquire().await?;
        session.track(session.stat(&full).await)
    }

    async fn list(&self, path: &Utf8Path) -> Result<Vec<String>, StorageError> {
        let full = self.resolve(path)?;
        let session = self.pool.acquire().await?;
        let mut names = session.track(session.read_dir(&full).await)?;
        names.sort();
        Ok(names)
    }

    async fn rename(&self, from: &Utf8Path, to: &Utf8Path) -> Result<(), StorageError> {
        let source = self.resolve(from)?;
        let target = self.resolve(to)?;
        let session = self.pool.acquire().await?;
        session.track(self.prepare_write(&session, to, &target).await)?;

        match session.track(session.remove(&target).await) {
            Ok(()) => {}
            Err(error) if error.is_not_found() => {}
            Err(error) => return Err(error),
        }
        session.track(session.rename(&source, &target).await)
    }

    async fn delete(&self, path: &Utf8Path) -> Result<(), StorageError> {
        let full = self.resolve(path)?;
        let session = self.pool.acquire().await?;
        session.track(self.check_repository(&session, path).await)?;

        let metadata = match session.track(session.stat(&full).await) {
            Ok(metadata) => metadata,
            Err(error) if error.is_not_found() => return Ok(()),
            Err(error) => return Err(error),
        };

        if metadata.is_dir {
            session.track(remove_tree(&*session, &full).await)
        } else {
            session.track(session.remove(&full).await)
        }
    }

    async fn create_dir(&self, path: &Utf8Path) -> Result<(), StorageError> {
        let full = self.resolve(path)?;
        let session = self.pool.acquire().await?;
        session.track(ensure_dir(&*session, &full).await)
    }
}

async fn remove_tree<S: RemoteSession + ?Sized>(session: &S, dir: &Utf8Path) -> Result<(), StorageError> {
    let mut pending = vec![(dir.to_owned(), false)];
    while let Some((current, visited)) = pending.pop() {
        if visited {
            session.remove_dir(&current).await?;
            continue;
        }
        pending.push((current.clone(), true));
        for name in session.read_dir(&current).await? {
            let child = current.join(&name);
            if session.stat(&child).await?.is_dir {
                pending.push((child, false));
            } else {
                session.remove(&child).await?;
            }
        }
    }
    Ok(())
}

/// A remote file reader that holds its pooled session until dropped.
#[pin_project::pin_project]
pub struct PooledReader<C: Connector> {
    #[pin]
    inner: Box<Reader<'static>>,
    _session: PooledSession<C>,
}

impl<C: Connector> std::fmt::Debug for PooledReader<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledReader")
            .field("session", &self._session)
            .finish()
    }
}

impl<C: Connector> AsyncRead for PooledReader<C> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.project().inner.poll_read(cx, buf)
    }
}

/// A remote file writer that holds its pooled session until committed or cancelled.
///
/// Cancelling, or failing to commit, removes the file.
pub struct PooledWriter<C: Connector> {
    inner: Box<RemoteWriter>,
    session: Option<PooledSession<C>>,
    pool: SessionPool<C>,
    path: Utf8PathBuf,
    written: u64,
}

impl<C: Connector> std::fmt::Debug for PooledWriter<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledWriter")
            .field("path", &self.path)
            .field("written", &self.written)
            .finish()
    }
}

impl<C: Connector> PooledWriter<C> {
    fn poison_on(&self, error: &io::Error) {
        if StorageErrorKind::from(error.kind()) == StorageErrorKind::ServiceUnavailable {
            if let Some(session) = &self.session {
                session.poison();
            }
        }
    }

    async fn remove(mut self: Box<Self>) {
        let session = match self.session.take() {
            Some(session) if !session.is_poisoned() => Some(session),
            _ => None,
        };
        let session = match session {
            Some(session) => session,
            None => match self.pool.acquire().await {
                Ok(session) => session,
                Err(error) => {
                    tracing::warn!(path = %self.path, %error, "could not remove partial object");
                    return;
                }
            },
        };

        match session.track(session.remove(&self.path).await) {
            Ok(()) => tracing::debug!(path = %self.path, "removed partial object"),
            Err(error) if error.is_not_found() => {}
            Err(error) => {
                tracing::warn!(path = %self.path, %error, "could not remove partial object")
            }
        }
    }
}

impl<C: Connector> AsyncWrite for PooledWriter<C> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let poll = Pin::new(&mut self.inner).poll_write(cx, buf);
        match &poll {
            Poll::Ready(Ok(n)) => self.written += *n as u64,
            Poll::Ready(Err(error)) => self.poison_on(error),
            Poll::Pending => {}
        }
        poll
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[async_trait::async_trait]
impl<C: Connector> FileWriter for PooledWriter<C> {
    fn written(&self) -> u64 {
        self.written
    }

    async fn commit(mut self: Box<Self>) -> Result<u64, StorageError> {
        match self.inner.shutdown().await {
            Ok(()) => Ok(self.written),
            Err(error) => {
                self.poison_on(&error);
                let error = io_error("close", &self.path)(error);
                self.remove().await;
                Err(error)
            }
        }
    }

    async fn cancel(self: Box<Self>) -> Result<(), StorageError> {
        self.remove().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::memory::{MemoryConnector, MemoryRemote};

    async fn driver(remote: &MemoryRemote) -> PooledDriver<MemoryConnector> {
        remote.create_dir_all("registry/app");
        let pool = SessionPool::connect(remote.connector(), 2).await.unwrap();
        PooledDriver::new(pool, "registry")
    }

    #[tokio::test]
    async fn put_requires_repository_directory() {
        let remote = MemoryRemote::new();
        let driver = driver(&remote).await;

        let err = driver
            .put(Utf8Path::new("missing/blobs/sha256:aa"), b"data", None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), StorageErrorKind::RepositoryNotFound);
        assert!(!remote.exists("registry/missing"));
    }

    #[tokio::test]
    async fn put_creates_directories_below_repository() {
        let remote = MemoryRemote::new();
        let driver = driver(&remote).await;

        driver
            .put(Utf8Path::new("app/blobs/sha256:aa"), b"data", None)
            .await
            .unwrap();
        assert_eq!(remote.file("registry/app/blobs/sha256:aa").unwrap(), b"data");
        assert_eq!(driver.pool().available(), 2);
    }

    #[tokio::test]
    async fn put_reports_progress_by_decile() {
        let remote = MemoryRemote::new();
        let driver = driver(&remote).await;
        let content = vec![7u8; CHUNK_SIZE * 3 + 10];

        let calls = Arc::new(Mutex::new(Vec::new()));
        let recorder = calls.clone();
        let progress = move |written: u64, total: u64| recorder.lock().unwrap().push((written, total));

        driver
            .put(Utf8Path::new("app/blobs/big"), &content, Some(&progress))
            .await
            .unwrap();

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 4);
        assert_eq!(calls.last(), Some(&(content.len() as u64, content.len() as u64)));
    }

    #[tokio::test]
    async fn failed_write_removes_partial_object() {
        let remote = MemoryRemote::new();
        let driver = driver(&remote).await;
        remote.fail_writes(1);

        let err = driver
            .put(Utf8Path::new("app/blobs/sha256:aa"), b"data", None)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(!remote.exists("registry/app/blobs/sha256:aa"));

        driver
            .put(Utf8Path::new("app/blobs/sha256:aa"), b"data", None)
            .await
            .unwrap();
        assert!(remote.exists("registry/app/blobs/sha256:aa"));
    }

    #[tokio::test]
    async fn insufficient_space_is_reported_before_writing() {
        let remote = MemoryRemote::new();
        let driver = driver(&remote).await;
        remote.set_capacity(Some(3));

        let err = driver
            .put(Utf8Path::new("app/blobs/sha256:aa"), b"data", None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), StorageErrorKind::InsufficientStorage);
        assert!(!err.is_retryable());
        assert_eq!(remote.write_opens("registry/app/blobs/sha256:aa"), 0);
    }

    #[tokio::test]
    async fn streaming_writer_cancel_removes_file() {
        let remote = MemoryRemote::new();
        let driver = driver(&remote).await;

        let mut writer = driver
            .writer(Utf8Path::new("app/blobs/sha256:bb"), false)
            .await
            .unwrap();
        writer.write_all(b"partial").await.unwrap();
        assert_eq!(driver.pool().available(), 1);
        writer.cancel().await.unwrap();

        assert!(!remote.exists("registry/app/blobs/sha256:bb"));
        assert_eq!(driver.pool().available(), 2);
    }

    #[tokio::test]
    async fn reader_streams_from_offset() {
        let remote = MemoryRemote::new();
        let driver = driver(&remote).await;
        remote.insert("registry/app/blobs/sha256:cc", b"0123456789".to_vec());

        let mut reader = driver
            .reader(Utf8Path::new("app/blobs/sha256:cc"), 4)
            .await
            .unwrap();
        let mut rest = String::new();
        reader.read_to_string(&mut rest).await.unwrap();
        assert_eq!(rest, "456789");
    }

    #[tokio::test]
    async fn create_dir_is_idempotent() {
        let remote = MemoryRemote::new();
        let pool = SessionPool::connect(remote.connector(), 1).await.unwrap();
        let driver = PooledDriver::new(pool, "registry");

        driver.create_dir(Utf8Path::new("library")).await.unwrap();
        driver.create_dir(Utf8Path::new("library")).await.unwrap();
        assert!(remote.exists("registry/library"));
    }

    #[tokio::test]
    async fn list_and_delete() {
        let remote = MemoryRemote::new();
        let driver = driver(&remote).await;
        remote.insert("registry/app/manifests/v1", b"{}".to_vec());
        remote.insert("registry/app/manifests/latest", b"{}".to_vec());

        assert_eq!(
            driver.list(Utf8Path::new("app/manifests")).await.unwrap(),
            vec!["latest".to_owned(), "v1".to_owned()]
        );

        driver.delete(Utf8Path::new("app/manifests/v1")).await.unwrap();
        driver.delete(Utf8Path::new("app/manifests/v1")).await.unwrap();
        assert!(!remote.exists("registry/app/manifests/v1"));
    }

    #[tokio::test]
    async fn parent_components_are_rejected() {
        let remote = MemoryRemote::new();
        let driver = driver(&remote).await;

        let err = driver.stat(Utf8Path::new("../etc/passwd")).await.unwrap_err();
        assert_eq!(err.kind(), StorageErrorKind::PathTraversal);
    }
}
