use std::time::Duration;

use camino::Utf8PathBuf;
use serde::Deserialize;

use secret::Secret;
use storage_driver::{StorageError, StorageErrorKind};

use crate::driver::SftpDriver;
use crate::pool::SessionPool;
use crate::sftp::SftpConnector;
use crate::{DEFAULT_POOL_SIZE, DEFAULT_ROOT, SFTP_STORAGE_NAME};

fn default_port() -> u16 {
    22
}

fn default_root() -> Utf8PathBuf {
    Utf8PathBuf::from(DEFAULT_ROOT)
}

fn default_pool_size() -> usize {
    DEFAULT_POOL_SIZE
}

fn default_connect_timeout() -> u64 {
    30
}

/// Connection settings for an SFTP server.
#[derive(Debug, Clone, Deserialize)]
pub struct SftpConfig {
    /// Server hostname or address.
    pub host: String,

    /// SSH port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// User to authenticate as.
    pub username: String,

    /// Password for `username`.
    pub password: Secret,

    /// A `known_hosts` file to verify the server key against.
    ///
    /// Without one, any host key is accepted and a warning is logged.
    #[serde(default)]
    pub known_hosts: Option<Utf8PathBuf>,

    /// Directory on the server that holds every repository.
    #[serde(default = "default_root")]
    pub root: Utf8PathBuf,

    /// Number of sessions to keep open.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Seconds to wait for a connection to be established.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
}

impl SftpConfig {
    /// Settings for `username@host` with every other field at its default.
    pub fn new(host: impl Into<String>, username: impl Into<String>, password: impl Into<Secret>) -> Self {
        Self {
            host: host.into(),
            port: default_port(),
            username: username.into(),
            password: password.into(),
            known_hosts: None,
            root: default_root(),
            pool_size: default_pool_size(),
            connect_timeout: default_connect_timeout(),
        }
    }

    /// Reject settings that cannot possibly connect.
    pub fn validate(&self) -> Result<(), StorageError> {
        let missing = if self.host.is_empty() {
            Some("host")
        } else if self.username.is_empty() {
            Some("username")
        } else if self.password.is_empty() {
            Some("password")
        } else {
            None
        };

        match missing {
            Some(field) => Err(StorageError::builder(
                SFTP_STORAGE_NAME,
                StorageErrorKind::InvalidRequest,
                eyre::eyre!("SFTP {field} is not configured"),
            )
            .context("configuration")
            .build()),
            None => Ok(()),
        }
    }

    /// A connector using these settings.
    pub fn connector(&self) -> SftpConnector {
        SftpConnector::new(
            self.host.clone(),
            self.port,
            self.username.clone(),
            self.password.clone(),
        )
        .known_hosts(self.known_hosts.clone())
        .connect_timeout(Duration::from_secs(self.connect_timeout))
    }

    /// Connect the session pool and wrap it in a driver.
    #[tracing::instrument(skip(self), fields(host = %self.host, pool_size = self.pool_size))]
    pub async fn driver(&self) -> Result<SftpDriver, StorageError> {
        self.validate()?;
        let pool = SessionPool::connect(self.connector(), self.pool_size).await?;
        tracing::info!(host = %self.host, root = %self.root, "connected to SFTP server");
        Ok(SftpDriver::new(pool, self.root.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_optional_fields() {
        let config: SftpConfig = serde_json::from_value(serde_json::json!({
            "host": "sftp.example.com",
            "username": "registry",
            "password": "hunter2",
        }))
        .unwrap();

        assert_eq!(config.port, 22);
        assert_eq!(config.root, Utf8PathBuf::from("registry"));
        assert_eq!(config.pool_size, DEFAULT_POOL_SIZE);
        assert!(config.known_hosts.is_none());
        assert!(!format!("{config:?}").contains("hunter2"));
        config.validate().unwrap();
    }

    #[test]
    fn missing_credentials_are_rejected() {
        let config = SftpConfig::new("sftp.example.com", "registry", "");
        let err = config.validate().unwrap_err();
        assert_eq!(err.kind(), StorageErrorKind::InvalidRequest);
    }
}
