//! Sessions with a real SFTP server, over SSH.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use russh_sftp::client::error::Error as SftpError;
use russh_sftp::protocol::{OpenFlags, StatusCode};
use tokio::io::AsyncSeekExt;

use secret::Secret;
use storage_driver::{Metadata, Reader, StorageError, StorageErrorKind};

use crate::session::{Connector, RemoteSession, RemoteWriter};
use crate::SFTP_STORAGE_NAME;

fn sftp_error<'a>(op: &'static str, path: &'a Utf8Path) -> impl FnOnce(SftpError) -> StorageError + 'a {
    move |error| {
        let kind = match &error {
            SftpError::Status(status) => match status.status_code {
                StatusCode::NoSuchFile => StorageErrorKind::NotFound,
                StatusCode::PermissionDenied => StorageErrorKind::PermissionDenied,
                StatusCode::NoConnection | StatusCode::ConnectionLost => {
                    StorageErrorKind::ServiceUnavailable
                }
                StatusCode::OpUnsupported => StorageErrorKind::InvalidRequest,
                _ => StorageErrorKind::Io,
            },
            SftpError::Timeout | SftpError::IO(_) => StorageErrorKind::ServiceUnavailable,
            _ => StorageErrorKind::Other,
        };
        StorageError::builder(SFTP_STORAGE_NAME, kind, error)
            .path(path.as_str())
            .context(op)
            .build()
    }
}

fn ssh_error(op: &'static str) -> impl FnOnce(russh::Error) -> StorageError {
    move |error| {
        StorageError::builder(SFTP_STORAGE_NAME, StorageErrorKind::ServiceUnavailable, error)
            .context(op)
            .build()
    }
}

/// Checks the server's host key against a `known_hosts` file, when one is configured.
struct HostKeyVerifier {
    host: String,
    port: u16,
    known_hosts: Option<Utf8PathBuf>,
}

#[async_trait::async_trait]
impl russh::client::Handler for HostKeyVerifier {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh_keys::key::PublicKey,
    ) -> Result<bool, Self::Error> {
        let Some(known_hosts) = &self.known_hosts else {
            tracing::warn!(host = %self.host, "SSH host key verification disabled, no known_hosts file configured");
            return Ok(true);
        };

        match russh_keys::check_known_hosts_path(&self.host, self.port, server_public_key, known_hosts) {
            Ok(true) => Ok(true),
            Ok(false) => {
                tracing::error!(host = %self.host, %known_hosts, "host key is not listed in known_hosts");
                Ok(false)
            }
            Err(error) => {
                tracing::error!(host = %self.host, %known_hosts, %error, "host key verification failed");
                Ok(false)
            }
        }
    }
}

/// Connects to an SFTP server with password authentication.
#[derive(Debug, Clone)]
pub struct SftpConnector {
    host: String,
    port: u16,
    username: String,
    password: Secret,
    known_hosts: Option<Utf8PathBuf>,
    connect_timeout: Duration,
}

impl SftpConnector {
    /// A connector for `username@host:port`.
    pub fn new(host: impl Into<String>, port: u16, username: impl Into<String>, password: Secret) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            password,
            known_hosts: None,
            connect_timeout: Duration::from_secs(30),
        }
    }

    /// Verify host keys against this `known_hosts` file.
    pub fn known_hosts(mut self, path: Option<Utf8PathBuf>) -> Self {
        self.known_hosts = path;
        self
    }

    /// Give up on establishing a connection after `timeout`.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

#[async_trait::async_trait]
impl Connector for SftpConnector {
    type Session = SftpSession;

    #[tracing::instrument(skip(self), fields(host = %self.host, port = self.port, user = %self.username))]
    async fn connect(&self) -> Result<SftpSession, StorageError> {
        let config = Arc::new(russh::client::Config::default());
        let handler = HostKeyVerifier {
            host: self.host.clone(),
            port: self.port,
            known_hosts: self.known_hosts.clone(),
        };

        let connecting = russh::client::connect(config, (self.host.as_str(), self.port), handler);
        let mut handle = tokio::time::timeout(self.connect_timeout, connecting)
            .await
            .map_err(StorageError::with(
                SFTP_STORAGE_NAME,
                StorageErrorKind::ServiceUnavailable,
            ))?
            .map_err(ssh_error("connect"))?;

        let authenticated = handle
            .authenticate_password(self.username.as_str(), self.password.revealed())
            .await
            .map_err(ssh_error("authenticate"))?;
        if !authenticated {
            return Err(StorageError::builder(
                SFTP_STORAGE_NAME,
                StorageErrorKind::PermissionDenied,
                eyre::eyre!("password authentication rejected for {}", self.username),
            )
            .context("authenticate")
            .build());
        }

        let channel = handle
            .channel_open_session()
            .await
            .map_err(ssh_error("open channel"))?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(ssh_error("request sftp subsystem"))?;

        let sftp = russh_sftp::client::SftpSession::new(channel.into_stream())
            .await
            .map_err(sftp_error("start sftp", Utf8Path::new("")))?;

        tracing::debug!("SFTP session established");
        Ok(SftpSession {
            host: self.host.clone(),
            handle,
            sftp,
        })
    }
}

/// An authenticated SFTP session.
pub struct SftpSession {
    host: String,
    handle: russh::client::Handle<HostKeyVerifier>,
    sftp: russh_sftp::client::SftpSession,
}

impl fmt::Debug for SftpSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SftpSession")
            .field("host", &self.host)
            .field("closed", &self.handle.is_closed())
            .finish()
    }
}

#[async_trait::async_trait]
impl RemoteSession for SftpSession {
    async fn stat(&self, path: &Utf8Path) -> Result<Metadata, StorageError> {
        let attributes = self
            .sftp
            .metadata(path.as_str())
            .await
            .map_err(sftp_error("stat", path))?;
        let modified = attributes
            .mtime
            .and_then(|mtime| DateTime::<Utc>::from_timestamp(i64::from(mtime), 0))
            .unwrap_or_default();
        Ok(Metadata {
            size: attributes.size.unwrap_or(0),
            modified,
            is_dir: attributes.is_dir(),
        })
    }

    async fn read_dir(&self, path: &Utf8Path) -> Result<Vec<String>, StorageError> {
        let entries = self
            .sftp
            .read_dir(path.as_str())
            .await
            .map_err(sftp_error("read_dir", path))?;
        Ok(entries
            .map(|entry| entry.file_name())
            .filter(|name| name != "." && name != "..")
            .collect())
    }

    async fn mkdir(&self, path: &Utf8Path) -> Result<(), StorageError> {
        self.sftp
            .create_dir(path.as_str())
            .await
            .map_err(sftp_error("mkdir", path))
    }

    async fn remove(&self, path: &Utf8Path) -> Result<(), StorageError> {
        self.sftp
            .remove_file(path.as_str())
            .await
            .map_err(sftp_error("remove", path))
    }

    async fn remove_dir(&self, path: &Utf8Path) -> Result<(), StorageError> {
        self.sftp
            .remove_dir(path.as_str())
            .await
            .map_err(sftp_error("rmdir", path))
    }

    async fn rename(&self, from: &Utf8Path, to: &Utf8Path) -> Result<(), StorageError> {
        self.sftp
            .rename(from.as_str(), to.as_str())
            .await
            .map_err(sftp_error("rename", from))
    }

    async fn open_read(&self, path: &Utf8Path, offset: u64) -> Result<Box<Reader<'static>>, StorageError> {
        let mut file = self
            .sftp
            .open(path.as_str())
            .await
            .map_err(sftp_error("open", path))?;
        if offset > 0 {
            file.seek(std::io::SeekFrom::Start(offset))
                .await
                .map_err(|error| StorageError::io(SFTP_STORAGE_NAME, error).at(path.as_str()))?;
        }
        Ok(Box::new(Box::pin(file)))
    }

    async fn open_write(&self, path: &Utf8Path, append: bool) -> Result<Box<RemoteWriter>, StorageError> {
        let mode = if append {
            OpenFlags::CREATE | OpenFlags::WRITE | OpenFlags::APPEND
        } else {
            OpenFlags::CREATE | OpenFlags::WRITE | OpenFlags::TRUNCATE
        };
        let file = self
            .sftp
            .open_with_flags(path.as_str(), mode)
            .await
            .map_err(sftp_error("open for writing", path))?;
        Ok(Box::new(Box::pin(file)))
    }

    async fn available_space(&self, path: &Utf8Path) -> Result<Option<u64>, StorageError> {
        match self.sftp.fs_info(path.as_str()).await {
            Ok(Some(stats)) => Ok(Some(stats.blocks_avail.saturating_mul(stats.fragment_size))),
            Ok(None) => Ok(None),
            Err(error) => {
                // statvfs@openssh.com is an extension; servers without it just skip the check.
                tracing::debug!(%path, %error, "capacity query not supported");
                Ok(None)
            }
        }
    }

    async fn is_alive(&self) -> bool {
        !self.handle.is_closed()
    }
}
