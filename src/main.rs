//! Image Relay CLI
//!
//! Usage: image-relay [--config <path>] <image>

use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use image_relay::{ImporterConfig, Importer, SignalHandler, StdConsole, EXIT_CODE_CANCELLED};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_LEVEL: &str = "image_relay=warn";
const LOG_FILE_NAME: &str = "image-relay.log";

#[derive(Parser)]
#[command(name = "image-relay")]
#[command(about = "Fetch a container image through a relay exporter and load it locally", version)]
struct Cli {
    /// Image to transfer, e.g. alpine:latest
    image: String,

    /// Path to config file (default: ~/.config/image-relay/importer.toml)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config =
        ImporterConfig::load(cli.config.as_deref()).context("failed to load importer config")?;

    let log_guard = init_tracing(config.log_dir.as_deref());
    debug!(server = %config.server_url, image = %cli.image, "starting transfer");

    let cancel = CancellationToken::new();
    SignalHandler::new(cancel.clone())
        .install()
        .context("failed to install signal handler")?;

    let importer = Importer::from_config(config, Arc::new(StdConsole), cancel)
        .context("failed to set up importer")?;

    // Failures are already printed by the importer.
    let code = match importer.run(&cli.image).await {
        Ok(report) => {
            println!("{}", report);
            0
        }
        Err(failure) if failure.is_cancelled() => EXIT_CODE_CANCELLED,
        Err(_) => 1,
    };

    // Flush the file writer before exiting.
    drop(log_guard);
    process::exit(code)
}

/// Diagnostics go to stderr, or to a daily file when `log_dir` is set, so
/// stdout carries only operator output.
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
                .with_ansi(false)
                .with_writer(non_blocking)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
            None
        }
    }
}
