//! Copying committed objects from local staging to the remote store.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use dashmap::DashMap;
use serde::Deserialize;
use tokio::sync::{Mutex, OwnedMutexGuard, OwnedSemaphorePermit, Semaphore};

use storage::{Progress, Storage, StorageError, StorageErrorKind};

const REPLICATION: &str = "replication";

/// When the HTTP response waits for replication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReplicationMode {
    /// Replicate before responding, and stream blob bodies straight to the remote store.
    Sync,
    /// Respond once the object is staged locally and replicate in the background.
    #[default]
    Async,
}

/// Exponential backoff between replication attempts.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Backoff {
    /// Total number of attempts, including the first.
    pub attempts: u32,

    /// Delay after the first failed attempt.
    #[serde(with = "seconds")]
    pub delay: Duration,

    /// Upper bound for a single delay.
    #[serde(with = "seconds")]
    pub max_delay: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            attempts: 5,
            delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(16),
        }
    }
}

impl Backoff {
    /// Create a new backoff policy.
    pub fn new(attempts: u32, delay: Duration, max_delay: Duration) -> Self {
        Self {
            attempts,
            delay,
            max_delay,
        }
    }

    /// The delay after `failures` consecutive failed attempts.
    pub fn delay(&self, failures: u32) -> Duration {
        let factor = 1u32.checked_shl(failures.saturating_sub(1)).unwrap_or(u32::MAX);
        self.delay
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

mod seconds {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        f64::deserialize(deserializer).map(Duration::from_secs_f64)
    }
}

/// What [`ReplicationCoordinator::replicate`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Replicated {
    /// The object was already stored remotely, so nothing was sent.
    Existing,
    /// The object was uploaded.
    Uploaded,
}

/// Observer of transfer progress, called with the remote path and `(written, total)` bytes.
pub type ProgressObserver = dyn Fn(&Utf8Path, u64, u64) + Send + Sync;

/// Exclusive use of one remote path, within the global transfer limit.
#[derive(Debug)]
pub struct ReplicationGuard {
    path: Utf8PathBuf,
    _lock: OwnedMutexGuard<()>,
    _permit: OwnedSemaphorePermit,
}

impl ReplicationGuard {
    /// The remote path this guard holds.
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }
}

/// Replication of staged objects to the remote store.
///
/// The coordinator owns the global transfer limit (a semaphore sized to the
/// connection pool), a table of per-path locks, and the retry policy. Locks
/// are created the first time a path is replicated and kept for the lifetime
/// of the coordinator, so two transfers to the same remote path never
/// overlap.
pub struct ReplicationCoordinator {
    local: Storage,
    remote: Storage,
    permits: Arc<Semaphore>,
    locks: DashMap<Utf8PathBuf, Arc<Mutex<()>>>,
    backoff: Backoff,
    observer: Option<Arc<ProgressObserver>>,
}

impl fmt::Debug for ReplicationCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicationCoordinator")
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("available", &self.permits.available_permits())
            .field("locks", &self.locks.len())
            .field("backoff", &self.backoff)
            .field("observed", &self.observer.is_some())
            .finish()
    }
}

impl ReplicationCoordinator {
    /// A coordinator copying from `local` to `remote`, with at most
    /// `concurrency` transfers in flight.
    pub fn new(local: Storage, remote: Storage, concurrency: usize, backoff: Backoff) -> Self {
        Self {
            local,
            remote,
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            locks: DashMap::new(),
            backoff,
            observer: None,
        }
    }

    /// Report the progress of every transfer to `observer`, in tenths.
    pub fn observe_progress(mut self, observer: Arc<ProgressObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// The local staging store.
    pub fn local(&self) -> &Storage {
        &self.local
    }

    /// The remote store.
    pub fn remote(&self) -> &Storage {
        &self.remote
    }

    /// The retry policy.
    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    /// Take a transfer slot, then the lock for `remote_path`.
    pub async fn guard(&self, remote_path: &Utf8Path) -> Result<ReplicationGuard, StorageError> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(StorageError::with(REPLICATION, StorageErrorKind::ServiceUnavailable))?;

        let lock = self
            .locks
            .entry(remote_path.to_path_buf())
            .or_default()
            .clone();
        let lock = lock.lock_owned().await;

        Ok(ReplicationGuard {
            path: remote_path.to_path_buf(),
            _lock: lock,
            _permit: permit,
        })
    }

    /// Copy `data`, staged locally at `local_path`, to `remote_path`.
    ///
    /// A remote object of the same size is taken to be this content already,
    /// and nothing is sent. Retryable failures are retried with backoff. The
    /// local copy is removed once the remote one is in place, and kept if
    /// replication fails.
    #[tracing::instrument(skip(self, data), fields(size = data.len()))]
    pub async fn replicate(
        &self,
        local_path: &Utf8Path,
        remote_path: &Utf8Path,
        data: Bytes,
    ) -> Result<Replicated, StorageError> {
        let guard = self.guard(remote_path).await?;
        self.replicate_locked(&guard, local_path, data).await
    }

    /// [`replicate`](Self::replicate) under a guard the caller already holds.
    ///
    /// The object is copied to the path the guard was taken for.
    #[tracing::instrument(skip(self, guard, data), fields(remote_path = %guard.path, size = data.len()))]
    pub async fn replicate_locked(
        &self,
        guard: &ReplicationGuard,
        local_path: &Utf8Path,
        data: Bytes,
    ) -> Result<Replicated, StorageError> {
        let remote_path = guard.path();

        match self.remote.stat(remote_path).await {
            Ok(metadata) if !metadata.is_dir && metadata.size == data.len() as u64 => {
                tracing::info!(%remote_path, "object already replicated, skipping transfer");
                self.discard_local(local_path).await;
                return Ok(Replicated::Existing);
            }
            Ok(metadata) => {
                tracing::warn!(%remote_path, remote_size = metadata.size, "remote object differs in size, replacing it");
            }
            Err(error) if error.is_not_found() || error.is_retryable() => {}
            Err(error) => return Err(error),
        }

        self.put(remote_path, &data).await?;
        self.discard_local(local_path).await;
        Ok(Replicated::Uploaded)
    }

    /// Copy `data` to `remote_path`, replacing whatever is stored there.
    ///
    /// Used for objects stored under a mutable name, such as a manifest tag.
    #[tracing::instrument(skip(self, data), fields(size = data.len()))]
    pub async fn replace(
        &self,
        local_path: &Utf8Path,
        remote_path: &Utf8Path,
        data: Bytes,
    ) -> Result<Replicated, StorageError> {
        let _guard = self.guard(remote_path).await?;
        self.put(remote_path, &data).await?;
        self.discard_local(local_path).await;
        Ok(Replicated::Uploaded)
    }

    async fn put(&self, remote_path: &Utf8Path, data: &[u8]) -> Result<(), StorageError> {
        let observer = self.observer.clone();
        let progress_path = remote_path.to_owned();
        let progress: &Progress = &move |written: u64, total: u64| {
            let remote_path = progress_path.as_path();
            tracing::debug!(%remote_path, written, total, "replication progress");
            if let Some(observer) = &observer {
                observer(remote_path, written, total);
            }
        };

        let mut failures = 0;
        loop {
            match self.remote.put(remote_path, data, Some(progress)).await {
                Ok(()) => {
                    tracing::info!(%remote_path, size = data.len(), "replicated to remote store");
                    return Ok(());
                }
                Err(error) if error.is_retryable() => {
                    failures += 1;
                    if failures >= self.backoff.attempts {
                        tracing::error!(%remote_path, %error, attempts = failures, "replication failed, giving up");
                        return Err(error);
                    }
                    let delay = self.backoff.delay(failures);
                    tracing::warn!(%remote_path, %error, attempt = failures, ?delay, "replication failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(error) => {
                    tracing::error!(%remote_path, %error, "replication failed");
                    return Err(error);
                }
            }
        }
    }

    async fn discard_local(&self, local_path: &Utf8Path) {
        if let Err(error) = self.local.delete(local_path).await {
            tracing::warn!(%local_path, %error, "could not remove staged copy");
        }
    }
}
