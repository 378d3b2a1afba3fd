//! Attest node entry point.
//!
//! Starts the consistency engine and its HTTP API with configuration from a
//! TOML file or defaults.

#![allow(dead_code)]

mod api;
mod config;
mod node;
mod state;
mod storage;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use config::AttestConfig;
use node::AttestNode;

/// Attest Node
#[derive(Parser, Debug)]
#[command(name = "attest-node", version, about = "Attest credential consistency node")]
struct Args {
    /// Path to the configuration file (TOML).
    #[arg(short, long, default_value = "attest.toml")]
    config: PathBuf,

    /// Override the API port.
    #[arg(long)]
    api_port: Option<u16>,

    /// Override the data directory.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Override the log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    /// Generate a default config file and exit.
    #[arg(long)]
    init: bool,
}

fn init_tracing(level: &str, format: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    if format.eq_ignore_ascii_case("json") {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.init {
        init_tracing(args.log_level.as_deref().unwrap_or("info"), "text");
        let config = AttestConfig::default();
        config.save(&args.config)?;
        tracing::info!(path = %args.config.display(), "wrote default config");
        return Ok(());
    }

    let mut config = AttestConfig::load(&args.config)?;
    if let Some(api_port) = args.api_port {
        config.api.port = api_port;
    }
    if let Some(ref data_dir) = args.data_dir {
        config.storage.data_dir = data_dir.clone();
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }

    init_tracing(&config.logging.level, &config.logging.format);
    tracing::info!("Attest node v{}", env!("CARGO_PKG_VERSION"));

    let mut node = AttestNode::new(config)?;
    node.start().await?;

    let shutdown = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("received shutdown signal"),
            Err(e) => tracing::error!(error = %e, "failed to listen for ctrl-c"),
        }
    };

    tokio::select! {
        result = node.run() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "node event loop error");
            }
        }
        _ = shutdown => {
            tracing::info!("initiating graceful shutdown");
        }
    }

    node.shutdown().await?;
    tracing::info!("Attest node exited cleanly");
    Ok(())
}
