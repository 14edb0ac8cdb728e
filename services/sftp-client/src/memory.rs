//! An in-process remote with SFTP semantics.

use std::collections::{BTreeMap, HashMap};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::io;

use storage_driver::{Metadata, Reader, StorageError, StorageErrorKind};

use crate::session::{Connector, RemoteSession, RemoteWriter};

const ENGINE: &str = "memory-sftp";

fn error(kind: StorageErrorKind, path: &Utf8Path, message: &str) -> StorageError {
    StorageError::builder(ENGINE, kind, eyre::eyre!("{message}: {path}"))
        .path(path.as_str())
        .build()
}

#[derive(Debug, Clone)]
enum Node {
    Dir { modified: DateTime<Utc> },
    File { data: Vec<u8>, modified: DateTime<Utc> },
}

#[derive(Debug, Default)]
struct State {
    nodes: BTreeMap<Utf8PathBuf, Node>,
    write_opens: HashMap<Utf8PathBuf, usize>,
    write_failures: usize,
    capacity: Option<u64>,
}

impl State {
    fn is_dir(&self, path: &Utf8Path) -> bool {
        path.as_str().is_empty() || matches!(self.nodes.get(path), Some(Node::Dir { .. }))
    }

    fn parent_is_dir(&self, path: &Utf8Path) -> bool {
        path.parent().is_some_and(|parent| self.is_dir(parent))
    }

    fn used(&self) -> u64 {
        self.nodes
            .values()
            .map(|node| match node {
                Node::File { data, .. } => data.len() as u64,
                Node::Dir { .. } => 0,
            })
            .sum()
    }

    fn mkdir_all(&mut self, path: &Utf8Path) {
        let mut current = Utf8PathBuf::new();
        for component in path.components() {
            current.push(component);
            self.nodes
                .entry(current.clone())
                .or_insert_with(|| Node::Dir { modified: Utc::now() });
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: Mutex<State>,
    online: AtomicBool,
    connects: AtomicUsize,
}

/// An in-memory remote filesystem.
///
/// Clones share the same filesystem. Sessions produced by
/// [`MemoryRemote::connector`] behave like SFTP sessions: directories are
/// created one level at a time, opening a file requires its parent to exist,
/// and renames do not overwrite.
///
/// The remote can be switched offline, given a capacity, or told to fail the
/// next few writes, to exercise the failure paths of its callers.
#[derive(Debug, Clone)]
pub struct MemoryRemote {
    inner: Arc<Inner>,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemote {
    /// An empty, online remote without a capacity limit.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                online: AtomicBool::new(true),
                connects: AtomicUsize::new(0),
            }),
        }
    }

    /// A connector producing sessions on this remote.
    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            remote: self.clone(),
        }
    }

    /// Take the remote offline or bring it back.
    ///
    /// While offline, new connections are refused and every operation on an
    /// existing session fails as if the transport had dropped.
    pub fn set_online(&self, online: bool) {
        self.inner.online.store(online, Ordering::SeqCst);
    }

    /// Limit the total number of bytes reported as available.
    pub fn set_capacity(&self, capacity: Option<u64>) {
        self.inner.state.lock().capacity = capacity;
    }

    /// Make the next `count` opened writers fail when they are closed.
    pub fn fail_writes(&self, count: usize) {
        self.inner.state.lock().write_failures = count;
    }

    /// Create a directory and all of its parents.
    pub fn create_dir_all(&self, path: impl AsRef<Utf8Path>) {
        self.inner.state.lock().mkdir_all(path.as_ref());
    }

    /// Store a file, creating its parent directories.
    pub fn insert(&self, path: impl AsRef<Utf8Path>, data: impl Into<Vec<u8>>) {
        let path = path.as_ref();
        let mut state = self.inner.state.lock();
        if let Some(parent) = path.parent() {
            state.mkdir_all(parent);
        }
        state.nodes.insert(
            path.to_owned(),
            Node::File {
                data: data.into(),
                modified: Utc::now(),
            },
        );
    }

    /// The contents of a file, if it exists.
    pub fn file(&self, path: impl AsRef<Utf8Path>) -> Option<Vec<u8>> {
        match self.inner.state.lock().nodes.get(path.as_ref()) {
            Some(Node::File { data, .. }) => Some(data.clone()),
            _ => None,
        }
    }

    /// Whether a file or directory exists.
    pub fn exists(&self, path: impl AsRef<Utf8Path>) -> bool {
        let path = path.as_ref();
        let state = self.inner.state.lock();
        state.is_dir(path) || state.nodes.contains_key(path)
    }

    /// Paths of all files under `prefix`.
    pub fn files(&self, prefix: impl AsRef<Utf8Path>) -> Vec<Utf8PathBuf> {
        let prefix = prefix.as_ref();
        self.inner
            .state
            .lock()
            .nodes
            .iter()
            .filter(|(path, node)| matches!(node, Node::File { .. }) && path.starts_with(prefix))
            .map(|(path, _)| path.clone())
            .collect()
    }

    /// How many times `path` has been opened for writing.
    pub fn write_opens(&self, path: impl AsRef<Utf8Path>) -> usize {
        self.inner
            .state
            .lock()
            .write_opens
            .get(path.as_ref())
            .copied()
            .unwrap_or(0)
    }

    /// How many sessions have been established.
    pub fn connections(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    fn online(&self) -> bool {
        self.inner.online.load(Ordering::SeqCst)
    }

    fn check_online(&self, path: &Utf8Path) -> Result<(), StorageError> {
        if self.online() {
            Ok(())
        } else {
            Err(error(
                StorageErrorKind::ServiceUnavailable,
                path,
                "connection lost",
            ))
        }
    }
}

/// Produces [`MemorySession`]s for a [`MemoryRemote`].
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    remote: MemoryRemote,
}

#[async_trait::async_trait]
impl Connector for MemoryConnector {
    type Session = MemorySession;

    async fn connect(&self) -> Result<MemorySession, StorageError> {
        self.remote.check_online(Utf8Path::new(""))?;
        self.remote.inner.connects.fetch_add(1, Ordering::SeqCst);
        Ok(MemorySession {
            remote: self.remote.clone(),
        })
    }
}

/// A session on a [`MemoryRemote`].
#[derive(Debug)]
pub struct MemorySession {
    remote: MemoryRemote,
}

#[async_trait::async_trait]
impl RemoteSession for MemorySession {
    async fn stat(&self, path: &Utf8Path) -> Result<Metadata, StorageError> {
        self.remote.check_online(path)?;
        let state = self.remote.inner.state.lock();
        if path.as_str().is_empty() {
            return Ok(Metadata {
                size: 0,
                modified: Utc::now(),
                is_dir: true,
            });
        }
        match state.nodes.get(path) {
            Some(Node::Dir { modified }) => Ok(Metadata {
                size: 0,
                modified: *modified,
                is_dir: true,
            }),
            Some(Node::File { data, modified }) => Ok(Metadata {
                size: data.len() as u64,
                modified: *modified,
                is_dir: false,
            }),
            None => Err(error(StorageErrorKind::NotFound, path, "no such file")),
        }
    }

    async fn read_dir(&self, path: &Utf8Path) -> Result<Vec<String>, StorageError> {
        self.remote.check_online(path)?;
        let state = self.remote.inner.state.lock();
        if !state.is_dir(path) {
            return Err(error(StorageErrorKind::NotFound, path, "no such directory"));
        }
        Ok(state
            .nodes
            .keys()
            .filter(|entry| entry.parent() == Some(path))
            .filter_map(|entry| entry.file_name().map(str::to_owned))
            .collect())
    }

    async fn mkdir(&self, path: &Utf8Path) -> Result<(), StorageError> {
        self.remote.check_online(path)?;
        let mut state = self.remote.inner.state.lock();
        if state.is_dir(path) || state.nodes.contains_key(path) {
            return Err(error(StorageErrorKind::Io, path, "failure: already exists"));
        }
        if !state.parent_is_dir(path) {
            return Err(error(StorageErrorKind::NotFound, path, "no such file"));
        }
        state
            .nodes
            .insert(path.to_owned(), Node::Dir { modified: Utc::now() });
        Ok(())
    }

    async fn remove(&self, path: &Utf8Path) -> Result<(), StorageError> {
        self.remote.check_online(path)?;
        let mut state = self.remote.inner.state.lock();
        match state.nodes.get(path) {
            Some(Node::File { .. }) => {
                state.nodes.remove(path);
                Ok(())
            }
            Some(Node::Dir { .. }) => Err(error(StorageErrorKind::Io, path, "failure: is a directory")),
            None => Err(error(StorageErrorKind::NotFound, path, "no such file")),
        }
    }

    async fn remove_dir(&self, path: &Utf8Path) -> Result<(), StorageError> {
        self.remote.check_online(path)?;
        let mut state = self.remote.inner.state.lock();
        if !matches!(state.nodes.get(path), Some(Node::Dir { .. })) {
            return Err(error(StorageErrorKind::NotFound, path, "no such directory"));
        }
        if state.nodes.keys().any(|entry| entry.parent() == Some(path)) {
            return Err(error(StorageErrorKind::Io, path, "failure: directory not empty"));
        }
        state.nodes.remove(path);
        Ok(())
    }

    async fn rename(&self, from: &Utf8Path, to: &Utf8Path) -> Result<(), StorageError> {
        self.remote.check_online(from)?;
        let mut state = self.remote.inner.state.lock();
        if !state.nodes.contains_key(from) {
            return Err(error(StorageErrorKind::NotFound, from, "no such file"));
        }
        if state.nodes.contains_key(to) {
            return Err(error(StorageErrorKind::Io, to, "failure: target exists"));
        }
        if !state.parent_is_dir(to) {
            return Err(error(StorageErrorKind::NotFound, to, "no such file"));
        }

        let moved: Vec<Utf8PathBuf> = state
            .nodes
            .keys()
            .filter(|entry| entry.starts_with(from))
            .cloned()
            .collect();
        for entry in moved {
            if let Some(node) = state.nodes.remove(&entry) {
                let relative = entry.strip_prefix(from).unwrap_or(Utf8Path::new(""));
                let target = if relative.as_str().is_empty() {
                    to.to_owned()
                } else {
                    to.join(relative)
                };
                state.nodes.insert(target, node);
            }
        }
        Ok(())
    }

    async fn open_read(&self, path: &Utf8Path, offset: u64) -> Result<Box<Reader<'static>>, StorageError> {
        self.remote.check_online(path)?;
        let state = self.remote.inner.state.lock();
        match state.nodes.get(path) {
            Some(Node::File { data, .. }) => {
                let mut cursor = std::io::Cursor::new(data.clone());
                cursor.set_position(offset);
                Ok(Box::new(cursor))
            }
            Some(Node::Dir { .. }) => Err(error(StorageErrorKind::Io, path, "failure: is a directory")),
            None => Err(error(StorageErrorKind::NotFound, path, "no such file")),
        }
    }

    async fn open_write(&self, path: &Utf8Path, append: bool) -> Result<Box<RemoteWriter>, StorageError> {
        self.remote.check_online(path)?;
        let mut state = self.remote.inner.state.lock();
        if !state.parent_is_dir(path) {
            return Err(error(StorageErrorKind::NotFound, path, "no such file"));
        }

        match state.nodes.get_mut(path) {
            Some(Node::Dir { .. }) => {
                return Err(error(StorageErrorKind::Io, path, "failure: is a directory"));
            }
            Some(Node::File { data, modified }) => {
                if !append {
                    data.clear();
                }
                *modified = Utc::now();
            }
            None => {
                state.nodes.insert(
                    path.to_owned(),
                    Node::File {
                        data: Vec::new(),
                        modified: Utc::now(),
                    },
                );
            }
        }

        *state.write_opens.entry(path.to_owned()).or_default() += 1;
        let fail_on_close = state.write_failures > 0;
        if fail_on_close {
            state.write_failures -= 1;
        }

        Ok(Box::new(MemoryWriter {
            remote: self.remote.clone(),
            path: path.to_owned(),
            fail_on_close,
        }))
    }

    async fn available_space(&self, path: &Utf8Path) -> Result<Option<u64>, StorageError> {
        self.remote.check_online(path)?;
        let state = self.remote.inner.state.lock();
        Ok(state
            .capacity
            .map(|capacity| capacity.saturating_sub(state.used())))
    }

    async fn is_alive(&self) -> bool {
        self.remote.online()
    }
}

#[derive(Debug)]
struct MemoryWriter {
    remote: MemoryRemote,
    path: Utf8PathBuf,
    fail_on_close: bool,
}

impl io::AsyncWrite for MemoryWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if !self.remote.online() {
            return Poll::Ready(Err(io::Error::from(io::ErrorKind::BrokenPipe)));
        }
        let mut state = self.remote.inner.state.lock();
        match state.nodes.get_mut(&self.path) {
            Some(Node::File { data, modified }) => {
                data.extend_from_slice(buf);
                *modified = Utc::now();
                Poll::Ready(Ok(buf.len()))
            }
            _ => Poll::Ready(Err(io::Error::from(io::ErrorKind::NotFound))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.fail_on_close || !self.remote.online() {
            Poll::Ready(Err(io::Error::from(io::ErrorKind::ConnectionReset)))
        } else {
            Poll::Ready(Ok(()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn mkdir_requires_parent_and_rejects_existing() {
        let remote = MemoryRemote::new();
        let session = remote.connector().connect().await.unwrap();

        let err = session.mkdir(Utf8Path::new("registry/app")).await.unwrap_err();
        assert!(err.is_not_found());

        session.mkdir(Utf8Path::new("registry")).await.unwrap();
        session.mkdir(Utf8Path::new("registry/app")).await.unwrap();
        assert!(session.mkdir(Utf8Path::new("registry/app")).await.is_err());
        assert!(remote.exists("registry/app"));
    }

    #[tokio::test]
    async fn writes_are_visible_and_counted() {
        let remote = MemoryRemote::new();
        remote.create_dir_all("registry/app/blobs");
        let session = remote.connector().connect().await.unwrap();
        let path = Utf8Path::new("registry/app/blobs/sha256:aa");

        let mut writer = session.open_write(path, false).await.unwrap();
        writer.write_all(b"layer").await.unwrap();
        writer.shutdown().await.unwrap();

        let mut reader = session.open_read(path, 2).await.unwrap();
        let mut tail = Vec::new();
        reader.read_to_end(&mut tail).await.unwrap();

        assert_eq!(tail, b"yer");
        assert_eq!(remote.write_opens(path), 1);
        assert_eq!(session.read_dir(Utf8Path::new("registry/app/blobs")).await.unwrap(), vec!["sha256:aa"]);
    }

    #[tokio::test]
    async fn offline_remote_refuses_connections() {
        let remote = MemoryRemote::new();
        let session = remote.connector().connect().await.unwrap();
        remote.set_online(false);

        assert!(!session.is_alive().await);
        let err = remote.connector().connect().await.unwrap_err();
        assert_eq!(err.kind(), StorageErrorKind::ServiceUnavailable);
        assert_eq!(remote.connections(), 1);
    }

    #[tokio::test]
    async fn capacity_reports_remaining_space() {
        let remote = MemoryRemote::new();
        remote.insert("registry/a", vec![0; 10]);
        remote.set_capacity(Some(25));
        let session = remote.connector().connect().await.unwrap();

        assert_eq!(session.available_space(Utf8Path::new("registry")).await.unwrap(), Some(15));
    }
}
