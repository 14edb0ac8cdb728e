//! Server configuration.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use serde::Deserialize;

use storage::{StorageConfig, StorageError};

use crate::api::RegistryBuilder;
use crate::metadata::MetadataStore;
use crate::replication::{Backoff, ReplicationMode};
use crate::sweep::SweepConfig;

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 5000))
}

fn default_local() -> StorageConfig {
    StorageConfig::Local {
        path: Utf8PathBuf::from("data"),
    }
}

/// How and when objects reach the remote store.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Whether responses wait for replication.
    pub mode: ReplicationMode,

    /// Retry policy for transfers.
    #[serde(flatten)]
    pub backoff: Backoff,
}

/// Configuration for `registry-server`.
///
/// ```toml
/// listen = "0.0.0.0:5000"
///
/// [local.local]
/// path = "/var/lib/registry"
///
/// [remote.sftp]
/// host = "storage.example.com"
/// username = "registry"
/// password = "..."
/// pool_size = 8
///
/// [replication]
/// mode = "async"
/// attempts = 5
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    /// Address to serve on.
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// Staging store.
    #[serde(default = "default_local")]
    pub local: StorageConfig,

    /// Durable store.
    pub remote: StorageConfig,

    /// Replication settings.
    #[serde(default)]
    pub replication: ReplicationConfig,

    /// Upload sweeper settings.
    #[serde(default)]
    pub sweep: SweepConfig,
}

impl RegistryConfig {
    /// Parse a TOML configuration file.
    #[cfg(feature = "cli")]
    pub fn from_toml(text: &str) -> Result<Self, toml_edit::de::Error> {
        toml_edit::de::from_str(text)
    }

    /// Number of concurrent transfers the remote store is sized for.
    pub fn concurrency(&self) -> usize {
        match &self.remote {
            StorageConfig::Sftp(sftp) => sftp.pool_size,
            _ => sftp_client::DEFAULT_POOL_SIZE,
        }
    }

    /// Interval between upload sweeps.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep.interval.max(1))
    }

    /// Connect both stores and prepare a registry builder.
    ///
    /// Fails when the local root cannot be used or the remote pool cannot be
    /// established.
    pub async fn builder(&self, metadata: Arc<dyn MetadataStore>) -> Result<RegistryBuilder, StorageError> {
        let local = self.local.clone().build().await?;
        let remote = self.remote.clone().build().await?;

        Ok(RegistryBuilder::new()
            .local(local)
            .remote(remote)
            .metadata(metadata)
            .mode(self.replication.mode)
            .backoff(self.replication.backoff.clone())
            .concurrency(self.concurrency()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_uses_defaults() {
        let config: RegistryConfig = serde_json::from_value(serde_json::json!({
            "remote": {"sftp": {"host": "sftp.example.com", "username": "registry", "password": "hunter2"}},
        }))
        .unwrap();

        assert_eq!(config.listen.port(), 5000);
        assert_eq!(config.replication.mode, ReplicationMode::Async);
        assert_eq!(config.replication.backoff.attempts, 5);
        assert_eq!(config.concurrency(), sftp_client::DEFAULT_POOL_SIZE);
        assert!(matches!(config.local, StorageConfig::Local { .. }));
    }

    #[test]
    fn replication_settings() {
        let config: RegistryConfig = serde_json::from_value(serde_json::json!({
            "remote": {"sftp": {"host": "h", "username": "u", "password": "p", "pool_size": 8}},
            "replication": {"mode": "async", "attempts": 3, "delay": 0.5, "max_delay": 2},
        }))
        .unwrap();

        assert_eq!(config.replication.mode, ReplicationMode::Async);
        assert_eq!(config.replication.backoff.attempts, 3);
        assert_eq!(config.replication.backoff.delay, Duration::from_millis(500));
        assert_eq!(config.replication.backoff.max_delay, Duration::from_secs(2));
        assert_eq!(config.concurrency(), 8);
    }

    #[cfg(feature = "cli")]
    #[test]
    fn toml_config() {
        let config = RegistryConfig::from_toml(
            r#"
            listen = "127.0.0.1:8080"

            [local.local]
            path = "/tmp/registry"

            [remote.sftp]
            host = "sftp.example.com"
            username = "registry"
            password = "hunter2"

            [sweep]
            max_age = 60
            "#,
        )
        .unwrap();

        assert_eq!(config.listen.port(), 8080);
        assert_eq!(config.sweep.max_age, 60);
    }
}
