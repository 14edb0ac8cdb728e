//! Registry server binary.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use clap::Parser;
use eyre::WrapErr;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use registry::{MemoryMetadata, RegistryConfig, ReplicationConfig, ReplicationMode, SweepConfig, UploadSweeper};
use sftp_client::SftpConfig;
use storage::StorageConfig;

/// A container registry backed by an SFTP server.
#[derive(Debug, Parser)]
#[command(name = "registry-server", version, about)]
struct Args {
    /// TOML configuration file. When given, the other storage flags are ignored.
    #[arg(short, long, env = "REGISTRY_CONFIG")]
    config: Option<Utf8PathBuf>,

    /// Port to listen on.
    #[arg(long, env = "PORT", default_value_t = 5000)]
    port: u16,

    /// Local staging directory.
    #[arg(long, env = "LOCAL_ROOT", default_value = "data")]
    local_root: Utf8PathBuf,

    /// SFTP server hostname.
    #[arg(long, env = "FTP_HOST")]
    host: Option<String>,

    /// SFTP server port.
    #[arg(long, env = "FTP_PORT", default_value_t = 22)]
    sftp_port: u16,

    /// SFTP user.
    #[arg(long, env = "FTP_USERNAME")]
    username: Option<String>,

    /// SFTP password.
    #[arg(long, env = "FTP_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// known_hosts file used to verify the server key.
    #[arg(long, env = "FTP_KNOWN_HOSTS")]
    known_hosts: Option<Utf8PathBuf>,

    /// Directory on the SFTP server holding every repository.
    #[arg(long, env = "REMOTE_ROOT", default_value = sftp_client::DEFAULT_ROOT)]
    remote_root: Utf8PathBuf,

    /// Number of SFTP sessions to keep open.
    #[arg(long, env = "SFTP_POOL_SIZE", default_value_t = sftp_client::DEFAULT_POOL_SIZE)]
    pool_size: usize,

    /// Wait for replication before answering uploads. Accepts `1`, `true`, `yes` or `on`.
    #[arg(
        long,
        env = "SFTP_SYNC_UPLOAD",
        default_value_t = false,
        value_parser = clap::builder::BoolishValueParser::new(),
        action = clap::ArgAction::Set
    )]
    sync_upload: bool,

    /// Emit logs as JSON.
    #[arg(long, env = "LOG_JSON")]
    json: bool,
}

impl Args {
    fn replication_mode(&self) -> ReplicationMode {
        if self.sync_upload {
            ReplicationMode::Sync
        } else {
            ReplicationMode::Async
        }
    }

    fn config(&self) -> eyre::Result<RegistryConfig> {
        if let Some(path) = &self.config {
            let text = std::fs::read_to_string(path).wrap_err_with(|| format!("reading {path}"))?;
            return RegistryConfig::from_toml(&text).wrap_err_with(|| format!("parsing {path}"));
        }

        let (Some(host), Some(username), Some(password)) = (&self.host, &self.username, &self.password) else {
            eyre::bail!("FTP_HOST, FTP_USERNAME and FTP_PASSWORD are required without --config");
        };

        let mut sftp = SftpConfig::new(host.clone(), username.clone(), password.clone());
        sftp.port = self.sftp_port;
        sftp.known_hosts = self.known_hosts.clone();
        sftp.root = self.remote_root.clone();
        sftp.pool_size = self.pool_size;

        Ok(RegistryConfig {
            listen: SocketAddr::from(([0, 0, 0, 0], self.port)),
            local: StorageConfig::Local {
                path: self.local_root.clone(),
            },
            remote: StorageConfig::Sftp(sftp),
            replication: ReplicationConfig {
                mode: self.replication_mode(),
                ..Default::default()
            },
            sweep: SweepConfig::default(),
        })
    }
}

fn init_tracing(json: bool) {
    let filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(%error, "could not listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let args = Args::parse();
    init_tracing(args.json);

    let config = args.config()?;
    tracing::info!(mode = ?config.replication.mode, listen = %config.listen, "starting registry");

    let builder = config
        .builder(Arc::new(MemoryMetadata::new()))
        .await
        .wrap_err("connecting storage")?;
    let storage = builder
        .build_storage()
        .ok_or_else(|| eyre::eyre!("storage is not configured"))?;

    let sweeper = UploadSweeper::new(
        storage.local().clone(),
        Duration::from_secs(config.sweep.max_age),
    )
    .spawn(config.sweep_interval());

    let app = registry::router(storage);
    let listener = tokio::net::TcpListener::bind(config.listen)
        .await
        .wrap_err_with(|| format!("binding {}", config.listen))?;
    tracing::info!("registry listening on http://{}", config.listen);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .wrap_err("serving registry")?;

    sweeper.abort();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replication_is_async_by_default() {
        let args = Args::try_parse_from(["registry-server"]).unwrap();
        assert_eq!(args.replication_mode(), ReplicationMode::Async);
    }

    #[test]
    fn sync_upload_accepts_numeric_flags() {
        let args = Args::try_parse_from(["registry-server", "--sync-upload", "1"]).unwrap();
        assert_eq!(args.replication_mode(), ReplicationMode::Sync);

        let args = Args::try_parse_from(["registry-server", "--sync-upload", "0"]).unwrap();
        assert_eq!(args.replication_mode(), ReplicationMode::Async);

        let args = Args::try_parse_from(["registry-server", "--sync-upload", "true"]).unwrap();
        assert_eq!(args.replication_mode(), ReplicationMode::Sync);
    }
}
