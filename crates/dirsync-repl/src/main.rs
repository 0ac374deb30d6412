#![warn(missing_docs)]

//! dirsync replication daemon: one replicated domain over TCP.

use anyhow::{Context, Result};
use clap::Parser;
use dirsync_repl::{spawn_listener, MemoryBackend, ReplicationConfig, ReplicationDomain};
use dirsync_transport::{TcpConnector, TcpSessionConfig};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Command line of the replication daemon.
#[derive(Debug, Parser)]
#[command(name = "dirsync-repl", version, about = "Directory replication daemon")]
struct Cli {
    /// Configuration file (.toml or .json).
    #[arg(long, env = "DIRSYNC_CONFIG")]
    config: PathBuf,

    /// Log as JSON lines.
    #[arg(long)]
    json_logs: bool,

    /// Generation id of the local data.
    #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
    generation_id: i64,

    /// Seconds between monitoring log lines, 0 disables them.
    #[arg(long, default_value_t = 60)]
    monitor_interval_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let json = cli.json_logs.then(|| fmt::layer().json());
    let plain = (!cli.json_logs).then(fmt::layer);
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(json)
        .with(plain)
        .init();

    let config = ReplicationConfig::from_file(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    tracing::info!(
        server_id = config.broker.server_id,
        base_dn = %config.broker.base_dn,
        relays = ?config.broker.relay_urls,
        "dirsync replication starting"
    );

    let backend = Arc::new(MemoryBackend::new(cli.generation_id));
    let connector = Arc::new(TcpConnector::new(TcpSessionConfig::default()));
    let domain = ReplicationDomain::new(config, backend, connector)?;

    let recovery = domain.spawn_recovery();
    let listener = spawn_listener(domain.clone());

    let monitor = (cli.monitor_interval_secs > 0).then(|| {
        let domain = domain.clone();
        let every = Duration::from_secs(cli.monitor_interval_secs);
        tokio::spawn(async move {
            let shutdown = domain.broker().shutdown_token();
            while shutdown.sleep(every).await {
                match serde_json::to_string(&domain.monitor()) {
                    Ok(snapshot) => tracing::info!(%snapshot, "replication monitor"),
                    Err(e) => tracing::warn!(error = %e, "monitor snapshot not serializable"),
                }
            }
        })
    });

    tokio::signal::ctrl_c()
        .await
        .context("waiting for ctrl-c")?;
    tracing::info!("shutting down");

    domain.broker().stop().await;
    let _ = listener.await;
    let _ = recovery.await;
    if let Some(monitor) = monitor {
        let _ = monitor.await;
    }
    Ok(())
}
