//! Removal of abandoned upload sessions.

use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::Utc;
use serde::Deserialize;
use tokio::task::JoinHandle;

use storage::{Storage, StorageError};

use crate::storage::uploads_dir;

/// How often the sweeper runs and what it removes.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    /// Seconds between sweeps.
    pub interval: u64,
    /// Seconds after which an unfinished upload is abandoned.
    pub max_age: u64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval: 60 * 60,
            max_age: 24 * 60 * 60,
        }
    }
}

/// Deletes staging files of uploads that were never committed.
///
/// A staging file lives at `<repo>/blobs/uploads/<session>` in the local
/// store. Once it has not been written to for `max_age` it is deleted, and a
/// client still holding the session has to start over.
#[derive(Debug, Clone)]
pub struct UploadSweeper {
    local: Storage,
    max_age: Duration,
}

impl UploadSweeper {
    /// A sweeper for `local` removing sessions idle for longer than `max_age`.
    pub fn new(local: Storage, max_age: Duration) -> Self {
        Self { local, max_age }
    }

    /// Run one sweep over every repository, returning the number of files removed.
    #[tracing::instrument(skip(self), fields(max_age = ?self.max_age))]
    pub async fn sweep(&self) -> Result<usize, StorageError> {
        let top = match self.local.list(Utf8Path::new("")).await {
            Ok(entries) => entries,
            Err(error) if error.is_not_found() => return Ok(0),
            Err(error) => return Err(error),
        };

        let mut removed = 0;
        for entry in top.iter().filter(|entry| !entry.starts_with('.')) {
            removed += self.sweep_dir(&uploads_dir(entry)).await;

            let Ok(children) = self.local.list(Utf8Path::new(entry)).await else {
                continue;
            };
            for child in children
                .iter()
                .filter(|child| !matches!(child.as_str(), "blobs" | "manifests") && !child.starts_with('.'))
            {
                removed += self.sweep_dir(&uploads_dir(&format!("{entry}/{child}"))).await;
            }
        }

        if removed > 0 {
            tracing::info!(removed, "removed abandoned uploads");
        }
        Ok(removed)
    }

    async fn sweep_dir(&self, dir: &Utf8Path) -> usize {
        let Ok(sessions) = self.local.list(dir).await else {
            return 0;
        };

        let cutoff = chrono::Duration::from_std(self.max_age).unwrap_or(chrono::Duration::MAX);
        let now = Utc::now();
        let mut removed = 0;
        for session in sessions {
            let path: Utf8PathBuf = dir.join(&session);
            let metadata = match self.local.stat(&path).await {
                Ok(metadata) => metadata,
                Err(error) => {
                    tracing::debug!(%path, %error, "skipping upload");
                    continue;
                }
            };

            if metadata.is_dir || now.signed_duration_since(metadata.modified) <= cutoff {
                continue;
            }

            match self.local.delete(&path).await {
                Ok(()) => {
                    tracing::debug!(%path, "removed abandoned upload");
                    removed += 1;
                }
                Err(error) => tracing::warn!(%path, %error, "could not remove abandoned upload"),
            }
        }
        removed
    }

    /// Sweep every `interval` until the returned task is aborted.
    pub fn spawn(self, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(error) = self.sweep().await {
                    tracing::warn!(%error, "upload sweep failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use storage::LocalDriver;

    use super::*;

    #[tokio::test]
    async fn only_stale_uploads_are_removed() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let local = Storage::new(LocalDriver::new(root));

        local
            .put(Utf8Path::new("app/blobs/uploads/old"), b"x", None)
            .await
            .unwrap();
        local
            .put(Utf8Path::new("library/web/blobs/uploads/old"), b"x", None)
            .await
            .unwrap();
        local
            .put(Utf8Path::new("app/blobs/sha256:abc"), b"layer", None)
            .await
            .unwrap();

        let patient = UploadSweeper::new(local.clone(), Duration::from_secs(3600));
        assert_eq!(patient.sweep().await.unwrap(), 0);

        tokio::time::sleep(Duration::from_millis(20)).await;
        let eager = UploadSweeper::new(local.clone(), Duration::from_millis(1));
        assert_eq!(eager.sweep().await.unwrap(), 2);

        assert!(!local.exists(Utf8Path::new("app/blobs/uploads/old")).await.unwrap());
        assert!(!local.exists(Utf8Path::new("library/web/blobs/uploads/old")).await.unwrap());
        assert!(local.exists(Utf8Path::new("app/blobs/sha256:abc")).await.unwrap());
    }

    #[tokio::test]
    async fn empty_root_is_fine() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().join("missing")).unwrap();
        let sweeper = UploadSweeper::new(Storage::new(LocalDriver::new(root)), Duration::ZERO);
        assert_eq!(sweeper.sweep().await.unwrap(), 0);
    }
}
