//! A fixed-size pool of remote sessions.

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use storage_driver::{StorageError, StorageErrorKind};

use crate::session::{Connector, RemoteSession};
use crate::SFTP_STORAGE_NAME;

struct Shared<C: Connector> {
    connector: C,

    /// One slot per pooled session. `None` marks a session that must be re-established.
    slots: Mutex<Vec<Option<C::Session>>>,
    permits: Arc<Semaphore>,
    size: usize,
}

/// A fixed number of sessions, lent to one caller at a time.
///
/// Every session is established when the pool is created, and creation fails
/// if any of them cannot be. [`SessionPool::acquire`] waits for a free session
/// without a timeout; the session goes back to the pool when the returned
/// guard is dropped.
///
/// A session that is no longer alive when it is acquired, or that was
/// [poisoned](PooledSession::poison) by its last user, is replaced by a new
/// connection at acquisition time.
pub struct SessionPool<C: Connector> {
    shared: Arc<Shared<C>>,
}

impl<C: Connector> Clone for SessionPool<C> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<C: Connector> fmt::Debug for SessionPool<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionPool")
            .field("connector", &self.shared.connector)
            .field("size", &self.shared.size)
            .field("available", &self.available())
            .finish()
    }
}

impl<C: Connector> SessionPool<C> {
    /// Establish `size` sessions (at least one) with `connector`.
    #[tracing::instrument(skip(connector), fields(connector = ?connector))]
    pub async fn connect(connector: C, size: usize) -> Result<Self, StorageError> {
        let size = size.max(1);
        let sessions =
            futures::future::try_join_all((0..size).map(|_| connector.connect())).await?;
        tracing::debug!(size, "session pool connected");

        Ok(Self {
            shared: Arc::new(Shared {
                connector,
                slots: Mutex::new(sessions.into_iter().map(Some).collect()),
                permits: Arc::new(Semaphore::new(size)),
                size,
            }),
        })
    }

    /// The number of sessions in the pool.
    pub fn size(&self) -> usize {
        self.shared.size
    }

    /// The number of sessions not currently lent out.
    pub fn available(&self) -> usize {
        self.shared.permits.available_permits()
    }

    /// Borrow a session, waiting until one is free.
    pub async fn acquire(&self) -> Result<PooledSession<C>, StorageError> {
        let permit = self
            .shared
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(StorageError::with(
                SFTP_STORAGE_NAME,
                StorageErrorKind::ServiceUnavailable,
            ))?;

        let slot = self.shared.slots.lock().pop().flatten();
        let session = match slot {
            Some(session) if session.is_alive().await => session,
            stale => {
                if stale.is_some() {
                    tracing::warn!("pooled session is no longer alive, reconnecting");
                }
                match self.shared.connector.connect().await {
                    Ok(session) => session,
                    Err(error) => {
                        self.shared.slots.lock().push(None);
                        return Err(error);
                    }
                }
            }
        };

        Ok(PooledSession {
            session: Some(session),
            shared: self.shared.clone(),
            poisoned: AtomicBool::new(false),
            _permit: permit,
        })
    }
}

/// A session borrowed from a [`SessionPool`].
///
/// Dereferences to the session. Dropping the guard returns the session to
/// the pool, unless it was poisoned, in which case it is closed and replaced
/// on the next acquisition.
pub struct PooledSession<C: Connector> {
    session: Option<C::Session>,
    shared: Arc<Shared<C>>,
    poisoned: AtomicBool,
    _permit: OwnedSemaphorePermit,
}

impl<C: Connector> PooledSession<C> {
    /// Mark the session as broken so that it is not reused.
    pub fn poison(&self) {
        self.poisoned.store(true, Ordering::Relaxed);
    }

    /// Whether the session has been poisoned.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Relaxed)
    }

    /// Pass a result through, poisoning the session if it failed because the transport broke.
    pub fn track<T>(&self, result: Result<T, StorageError>) -> Result<T, StorageError> {
        if let Err(error) = &result {
            if error.kind() == StorageErrorKind::ServiceUnavailable {
                self.poison();
            }
        }
        result
    }
}

// The session is never pinned through the guard.
impl<C: Connector> Unpin for PooledSession<C> {}

impl<C: Connector> Deref for PooledSession<C> {
    type Target = C::Session;

    fn deref(&self) -> &Self::Target {
        self.session
            .as_ref()
            .expect("pooled session is present until the guard is dropped")
    }
}

impl<C: Connector> fmt::Debug for PooledSession<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledSession")
            .field("session", &self.session)
            .field("poisoned", &self.is_poisoned())
            .finish()
    }
}

impl<C: Connector> Drop for PooledSession<C> {
    fn drop(&mut self) {
        let session = self.session.take();
        let slot = if self.is_poisoned() {
            tracing::debug!("dropping poisoned session");
            None
        } else {
            session
        };
        self.shared.slots.lock().push(slot);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use camino::Utf8Path;

    use super::*;
    use crate::memory::{MemoryConnector, MemoryRemote};

    #[tokio::test]
    async fn pool_connects_every_session_up_front() {
        let remote = MemoryRemote::new();
        let pool = SessionPool::connect(remote.connector(), 3).await.unwrap();

        assert_eq!(remote.connections(), 3);
        assert_eq!(pool.size(), 3);
        assert_eq!(pool.available(), 3);
    }

    #[tokio::test]
    async fn pool_construction_fails_when_remote_is_down() {
        let remote = MemoryRemote::new();
        remote.set_online(false);
        let err = SessionPool::connect(remote.connector(), 2).await.unwrap_err();
        assert_eq!(err.kind(), StorageErrorKind::ServiceUnavailable);
    }

    #[tokio::test]
    async fn acquire_waits_for_release() {
        let remote = MemoryRemote::new();
        let pool: SessionPool<MemoryConnector> =
            SessionPool::connect(remote.connector(), 1).await.unwrap();

        let held = pool.acquire().await.unwrap();
        assert_eq!(pool.available(), 0);

        let waiting = tokio::time::timeout(Duration::from_millis(50), pool.acquire()).await;
        assert!(waiting.is_err(), "second acquire should wait");

        drop(held);
        let session = pool.acquire().await.unwrap();
        session.stat(Utf8Path::new("")).await.unwrap();
        assert_eq!(remote.connections(), 1);
    }

    #[tokio::test]
    async fn poisoned_and_dead_sessions_are_replaced() {
        let remote = MemoryRemote::new();
        let pool = SessionPool::connect(remote.connector(), 1).await.unwrap();

        let session = pool.acquire().await.unwrap();
        session.poison();
        drop(session);

        let session = pool.acquire().await.unwrap();
        assert_eq!(remote.connections(), 2);
        drop(session);

        remote.set_online(false);
        assert!(pool.acquire().await.is_err());
        remote.set_online(true);

        let session = pool.acquire().await.unwrap();
        assert!(session.is_alive().await);
        assert_eq!(remote.connections(), 3);
        assert_eq!(pool.available(), 0);
    }
}
