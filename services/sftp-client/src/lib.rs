//! # SFTP storage
//!
//! A storage driver for a remote SFTP server, reached through a fixed-size
//! pool of authenticated sessions.
//!
//! The driver is generic over a [`Connector`], which produces
//! [`RemoteSession`]s. [`SftpConnector`] speaks SSH and SFTP through `russh`;
//! [`MemoryRemote`] is an in-process server with the same semantics and
//! switches for simulating outages, full disks and failed writes.
//!
//! ```no_run
//! use sftp_client::SftpConfig;
//!
//! # async fn example() -> Result<(), storage_driver::StorageError> {
//! let config = SftpConfig::new("sftp.example.com", "registry", "hunter2");
//! let driver = config.driver().await?;
//! # Ok(())
//! # }
//! ```

mod config;
mod driver;
mod memory;
mod pool;
mod session;
mod sftp;

/// The name of the storage driver.
const SFTP_STORAGE_NAME: &str = "sftp";

/// Writes are issued to the server in chunks of this many bytes.
pub const CHUNK_SIZE: usize = 1024 * 1024;

/// Number of sessions kept open when no pool size is configured.
pub const DEFAULT_POOL_SIZE: usize = 4;

/// Directory on the server under which every repository lives.
pub const DEFAULT_ROOT: &str = "registry";

pub use crate::config::SftpConfig;
pub use crate::driver::{PooledDriver, PooledReader, PooledWriter, SftpDriver};
pub use crate::memory::{MemoryConnector, MemoryRemote, MemorySession};
pub use crate::pool::{PooledSession, SessionPool};
pub use crate::session::{Connector, RemoteSession, RemoteWriter};
pub use crate::sftp::{SftpConnector, SftpSession};
