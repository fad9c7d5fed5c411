//! Import orchestration.
//!
//! One [`Importer::run`] is one transfer:
//!
//! ```text
//! AwaitingPreflight -> Requesting -> StreamingEvents -> Fetching -> Verifying
//!     -> Importing -> RequestingCleanup -> LocalCleanup -> Done
//! ```
//!
//! Any stage may end in `Failed`. Remote and local cleanup failures are
//! reported but never fail the transfer.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use relay_protocol::{url_file_name, CleanupToken, TransferEvent};
use relay_store::{DockerCli, ImageStore, StoreError};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::{ClientError, ExporterClient};
use crate::config::{ConfigError, ImporterConfig};
use crate::console::Console;
use crate::fetcher::{Aria2c, FetchError, Fetcher};
use crate::stream::{EventReader, StreamError};

/// Where a transfer is, or where it stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportStage {
    AwaitingPreflight,
    Requesting,
    StreamingEvents,
    Fetching,
    Verifying,
    Importing,
    RequestingCleanup,
    LocalCleanup,
    Done,
    Failed,
}

impl fmt::Display for ImportStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::AwaitingPreflight => "awaiting_preflight",
            Self::Requesting => "requesting",
            Self::StreamingEvents => "streaming_events",
            Self::Fetching => "fetching",
            Self::Verifying => "verifying",
            Self::Importing => "importing",
            Self::RequestingCleanup => "requesting_cleanup",
            Self::LocalCleanup => "local_cleanup",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Reasons a transfer fails
#[derive(Debug, Error)]
pub enum ImportError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("{0}")]
    Preflight(#[source] FetchError),

    #[error("{0}")]
    Request(#[source] ClientError),

    #[error(transparent)]
    Stream(#[from] StreamError),

    /// Reported by the exporter through an `error` event.
    #[error("{0}")]
    Remote(String),

    #[error("no download address received")]
    NoUrl,

    #[error("no artifact size received")]
    NoSize,

    #[error("download address '{0}' does not name an artifact file")]
    BadUrl(String),

    #[error("{0}")]
    Fetch(#[source] FetchError),

    #[error("cannot access {}: {source}", .path.display())]
    LocalFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("size mismatch: expected {expected} bytes, got {actual} bytes")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("failed to load {}: {}", .path.display(), .source.diagnostic())]
    Load {
        path: PathBuf,
        #[source]
        source: StoreError,
    },

    #[error("cancelled")]
    Cancelled,
}

/// A failed transfer and the stage it failed in.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct ImportFailure {
    pub stage: ImportStage,
    #[source]
    pub error: ImportError,
}

impl ImportFailure {
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self.error,
            ImportError::Cancelled | ImportError::Stream(StreamError::Cancelled)
        )
    }
}

/// Outcome of a best-effort cleanup step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupOutcome {
    Done(String),
    Failed(String),
}

impl fmt::Display for CleanupOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Done(detail) => write!(f, "ok ({})", detail),
            Self::Failed(reason) => write!(f, "failed ({})", reason),
        }
    }
}

/// Summary of a successful transfer.
#[derive(Debug, Clone)]
pub struct ImportReport {
    pub image: String,
    pub file_name: String,
    pub bytes: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub remote_cleanup: CleanupOutcome,
    pub local_cleanup: CleanupOutcome,
}

impl ImportReport {
    pub fn seconds(&self) -> f64 {
        (self.finished_at - self.started_at).num_milliseconds() as f64 / 1000.0
    }
}

impl fmt::Display for ImportReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "imported {} ({}, {} bytes) in {:.1}s",
            self.image,
            self.file_name,
            self.bytes,
            self.seconds()
        )?;
        writeln!(f, "  started:        {}", self.started_at.to_rfc3339())?;
        writeln!(f, "  remote cleanup: {}", self.remote_cleanup)?;
        write!(f, "  local cleanup:  {}", self.local_cleanup)
    }
}

/// What the event stream told us.
struct Advertised {
    url: String,
    size: u64,
    token: CleanupToken,
}

/// Drives one transfer from request to cleanup.
pub struct Importer {
    config: ImporterConfig,
    client: ExporterClient,
    fetcher: Arc<dyn Fetcher>,
    store: Arc<dyn ImageStore>,
    console: Arc<dyn Console>,
    cancel: CancellationToken,
}

impl Importer {
    pub fn new(
        config: ImporterConfig,
        fetcher: Arc<dyn Fetcher>,
        store: Arc<dyn ImageStore>,
        console: Arc<dyn Console>,
        cancel: CancellationToken,
    ) -> Result<Self, ImportError> {
        let base = config.base_url()?;
        let client = ExporterClient::new(
            base,
            config.token.clone(),
            config.timeouts.connect_timeout(),
        )
        .map_err(ImportError::Request)?;

        Ok(Self {
            config,
            client,
            fetcher,
            store,
            console,
            cancel,
        })
    }

    /// Importer with `aria2c` and the docker CLI from `config`.
    pub fn from_config(
        config: ImporterConfig,
        console: Arc<dyn Console>,
        cancel: CancellationToken,
    ) -> Result<Self, ImportError> {
        let fetcher = Aria2c::new(&config.fetcher_binary, config.connections)
            .with_timeout(config.timeouts.fetch_timeout());
        let store = DockerCli::with_binary(&config.docker_binary);
        Self::new(config, Arc::new(fetcher), Arc::new(store), console, cancel)
    }

    /// Transfer `image`. Failures are printed to the console before returning.
    pub async fn run(&self, image: &str) -> Result<ImportReport, ImportFailure> {
        let mut stage = ImportStage::AwaitingPreflight;
        match self.transfer(image, &mut stage).await {
            Ok(report) => {
                info!(image, bytes = report.bytes, "import complete");
                Ok(report)
            }
            Err(error) => {
                warn!(image, %stage, error = %error, "import failed");
                // The exporter's own error line was already shown.
                if !matches!(error, ImportError::Remote(_)) {
                    self.console.error(&error.to_string());
                }
                Err(ImportFailure { stage, error })
            }
        }
    }

    async fn transfer(
        &self,
        image: &str,
        stage: &mut ImportStage,
    ) -> Result<ImportReport, ImportError> {
        let started_at = Utc::now();

        self.fetcher.preflight().map_err(ImportError::Preflight)?;

        advance(stage, ImportStage::Requesting);
        let response = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(ImportError::Cancelled),
            response = self.client.download(image) => response.map_err(ImportError::Request)?,
        };

        advance(stage, ImportStage::StreamingEvents);
        let advertised = self.read_events(response).await?;
        let dir = self.config.download_dir.as_path();
        let path = advertised.token.path_in(dir);

        advance(stage, ImportStage::Fetching);
        self.fetch(&advertised, dir, &path).await?;

        advance(stage, ImportStage::Verifying);
        let bytes = verify_size(&path, advertised.size)?;

        advance(stage, ImportStage::Importing);
        self.load(&path).await?;

        advance(stage, ImportStage::RequestingCleanup);
        let remote_cleanup = self.remote_cleanup(&advertised.token).await;

        advance(stage, ImportStage::LocalCleanup);
        let local_cleanup = match tokio::fs::remove_file(&path).await {
            Ok(()) => CleanupOutcome::Done(format!("removed {}", path.display())),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to remove local artifact");
                CleanupOutcome::Failed(e.to_string())
            }
        };

        advance(stage, ImportStage::Done);
        Ok(ImportReport {
            image: image.to_string(),
            file_name: advertised.token.to_string(),
            bytes,
            started_at,
            finished_at: Utc::now(),
            remote_cleanup,
            local_cleanup,
        })
    }

    async fn read_events(&self, response: reqwest::Response) -> Result<Advertised, ImportError> {
        let mut reader = EventReader::new(
            Box::pin(response.bytes_stream()),
            self.config.timeouts,
            self.cancel.clone(),
        );

        let mut url = None;
        let mut size = None;
        while let Some(event) = reader.next_event().await? {
            match event {
                TransferEvent::Log { message } => self.console.line(&message),
                TransferEvent::Error { message } => {
                    self.console.error(&message);
                    return Err(ImportError::Remote(message));
                }
                TransferEvent::UrlReady { url: advertised } => {
                    debug!(url = %advertised, "download address received");
                    url = Some(advertised);
                }
                TransferEvent::SizeKnown { size: advertised } => {
                    debug!(size = advertised, "artifact size received");
                    size = Some(advertised);
                }
            }
        }
        if reader.skipped() > 0 {
            debug!(skipped = reader.skipped(), "ignored unrecognized lines");
        }

        let url = url.ok_or(ImportError::NoUrl)?;
        let size = size.ok_or(ImportError::NoSize)?;
        let token = url_file_name(&url)
            .and_then(|name| CleanupToken::parse(name).ok())
            .ok_or_else(|| ImportError::BadUrl(url.clone()))?;

        Ok(Advertised { url, size, token })
    }

    async fn fetch(&self, advertised: &Advertised, dir: &Path, path: &Path) -> Result<(), ImportError> {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|source| ImportError::LocalFile {
                path: dir.to_path_buf(),
                source,
            })?;

        self.console.line(&format!(
            "downloading {} ({} bytes)",
            advertised.url, advertised.size
        ));
        let fetched = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ImportError::Cancelled),
            result = self.fetcher.fetch(&advertised.url, dir, advertised.token.as_str()) => {
                result.map_err(ImportError::Fetch)
            }
        };

        if fetched.is_err() {
            remove_partial(path);
        }
        fetched
    }

    async fn load(&self, path: &Path) -> Result<(), ImportError> {
        self.console.line(&format!("loading {}", path.display()));
        let loaded = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(ImportError::Cancelled),
            loaded = self.store.load(path) => loaded,
        };

        // The artifact stays on disk when loading fails.
        let output = loaded.map_err(|source| ImportError::Load {
            path: path.to_path_buf(),
            source,
        })?;
        for line in output.stdout.lines().filter(|l| !l.trim().is_empty()) {
            self.console.line(line);
        }
        Ok(())
    }

    async fn remote_cleanup(&self, token: &CleanupToken) -> CleanupOutcome {
        match self.client.cleanup(token.as_str()).await {
            Ok(text) => {
                let text = text.trim().to_string();
                self.console.line(&text);
                CleanupOutcome::Done(text)
            }
            Err(e) => {
                warn!(file = %token, error = %e, "remote cleanup failed");
                self.console
                    .line(&format!("warning: remote cleanup of {} failed: {}", token, e));
                CleanupOutcome::Failed(e.to_string())
            }
        }
    }
}

fn advance(stage: &mut ImportStage, next: ImportStage) {
    debug!(from = %stage, to = %next, "stage");
    *stage = next;
}

/// Size of the downloaded file, which is deleted if it is not `expected`.
fn verify_size(path: &Path, expected: u64) -> Result<u64, ImportError> {
    let actual = std::fs::metadata(path)
        .map_err(|source| ImportError::LocalFile {
            path: path.to_path_buf(),
            source,
        })?
        .len();

    if actual != expected {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "failed to remove mismatched artifact");
        }
        return Err(ImportError::SizeMismatch { expected, actual });
    }
    Ok(actual)
}

/// Remove what a failed or interrupted fetch left behind.
fn remove_partial(path: &Path) {
    let mut control = path.as_os_str().to_os_string();
    control.push(".aria2");
    for leftover in [path.to_path_buf(), PathBuf::from(control)] {
        match std::fs::remove_file(&leftover) {
            Ok(()) => debug!(path = %leftover.display(), "removed partial download"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %leftover.display(), error = %e, "failed to remove partial download"),
        }
    }
}
