#![warn(missing_docs)]

//! Replication server daemon.
//!
//! Hosts the configured domains with their background tasks until
//! interrupted or a fatal error. There is no network listener: sessions are
//! attached in-process through [`ReplicationServer::accept`] and
//! [`ReplicationServer::connect_relay`] by code embedding the library.

use anyhow::Result;
use clap::Parser;
use dirrepl_broker::changelog::{ChangelogDb, InMemoryChangelog};
use dirrepl_broker::{BrokerConfig, ReplicationServer};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Command line of the replication server.
#[derive(Debug, Parser)]
#[command(name = "dirrepl-broker", version, about = "Directory replication server")]
struct Args {
    /// Configuration file (.toml or .json)
    #[arg(short, long, env = "DIRREPL_CONFIG")]
    config: Option<PathBuf>,

    /// Override the configured server id
    #[arg(long)]
    server_id: Option<i32>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

fn init_tracing(json: bool) {
    let registry = tracing_subscriber::registry().with(EnvFilter::from_default_env());
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

fn load_config(args: &Args) -> Result<BrokerConfig> {
    let mut config = match &args.config {
        Some(path) if path.exists() => BrokerConfig::from_file(path)?,
        Some(path) => anyhow::bail!("config file not found: {}", path.display()),
        None => {
            tracing::warn!("no config file given, using defaults");
            BrokerConfig::default()
        }
    };
    if let Some(server_id) = args.server_id {
        config.server_id = server_id;
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    let config = load_config(&args)?;
    tracing::info!(
        server_id = config.server_id,
        url = %config.server_url,
        "replication server starting"
    );

    let changelog: Arc<dyn ChangelogDb> = Arc::new(InMemoryChangelog::new());
    let server = ReplicationServer::new(config, changelog);
    server.start();

    let shutdown = server.shutdown_handle().clone();
    // domains run on their own tasks; wait for ctrl-c or a fatal error
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            tracing::info!("interrupted, shutting down");
        }
        _ = shutdown.wait() => {
            tracing::error!(
                reason = %shutdown.reason().unwrap_or_default(),
                "fatal error, shutting down"
            );
        }
    }

    server.shutdown().await;
    if shutdown.is_triggered() {
        anyhow::bail!("replication server stopped after a fatal error");
    }
    Ok(())
}
