//! Relay Exporter Entrypoint
//!
//! Usage: relay-exporter [--config <path>]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use relay_exporter::{start_server, ExporterConfig, ServerState};
use relay_store::DockerCli;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_LEVEL: &str = "relay_exporter=info,tower_http=info";
const LOG_FILE_NAME: &str = "relay-exporter.log";

#[derive(Parser)]
#[command(name = "relay-exporter")]
#[command(about = "Export container images as downloadable tar artifacts", version)]
struct Cli {
    /// Path to config file (default: /etc/image-relay/exporter.toml)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config =
        ExporterConfig::load(cli.config.as_deref()).context("failed to load exporter config")?;

    // Dropping the guard stops the background log writer.
    let _log_guard = init_tracing(config.log_dir.as_deref());

    info!("relay-exporter v{} starting up", env!("CARGO_PKG_VERSION"));

    std::fs::create_dir_all(&config.download_dir).with_context(|| {
        format!(
            "failed to create download directory {}",
            config.download_dir.display()
        )
    })?;

    let store = DockerCli::with_binary(&config.docker_binary)
        .with_timeout(Some(config.tool_timeout()));
    let state = ServerState::new(config, Arc::new(store));

    start_server(state).await
}

fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::builder().parse_lossy(
        std::env::var("RUST_LOG").unwrap_or_else(|_| DEFAULT_LOG_LEVEL.to_string()),
    );

    match log_dir {
        Some(dir) => {
            let file_appender = RollingFileAppender::new(Rotation::DAILY, dir, LOG_FILE_NAME);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(true)
                .with_ansi(false)
                .with_writer(non_blocking)
                .init();

            info!("File logging enabled to {}/{}", dir.display(), LOG_FILE_NAME);
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(true)
                .init();
            None
        }
    }
}
