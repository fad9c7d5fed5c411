//! Export state machine.
//!
//! One export per `/download` request:
//!
//! ```text
//! ReceivingRequest -> Pulling -> Saving -> SettingPermissions
//!     -> SizingAndAdvertising -> CleaningLocalImage -> Done
//! ```
//!
//! Any stage before `CleaningLocalImage` may exit to `Failed`, which sends a
//! single `error` event (preceded by a `log` event carrying the tool output
//! when there is one). Removing the local image afterwards is best effort and
//! never produces an `error` event.
//!
//! Everything before the advertisement runs under the export deadline and is
//! abandoned as soon as the client goes away. A tar that was being written but
//! never advertised is removed. While a pull or save runs, a `log` event is sent
//! every `progress_interval_seconds` so the client can tell a slow tool from a
//! stalled connection.
//!
//! The `size` and `url` events are sent back to back outside the deadline, so
//! a stream that carries `size` never also carries `error`. After a successful
//! export the artifact stays leased until its `/cleanup` (see [`crate::locks`]).

use std::fmt;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use relay_protocol::{encode_event, ArtifactName, ArtifactNameError, TransferEvent};
use relay_store::StoreError;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::DuplicatePolicy;
use crate::locks::{ArtifactGuard, LockError};
use crate::state::ServerState;

/// Events buffered between the export task and the response body.
pub const EVENT_BUFFER: usize = 16;

/// Where an export is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportStage {
    ReceivingRequest,
    Pulling,
    Saving,
    SettingPermissions,
    SizingAndAdvertising,
    CleaningLocalImage,
    Done,
    Failed,
}

impl fmt::Display for ExportStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ReceivingRequest => "receiving_request",
            Self::Pulling => "pulling",
            Self::Saving => "saving",
            Self::SettingPermissions => "setting_permissions",
            Self::SizingAndAdvertising => "sizing_and_advertising",
            Self::CleaningLocalImage => "cleaning_local_image",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Reasons an export stops before the artifact is advertised.
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("invalid image: {0}")]
    InvalidImage(#[from] ArtifactNameError),

    #[error("export of {image} is still in progress")]
    Busy {
        image: String,
        #[source]
        source: LockError,
    },

    #[error("failed to pull {image}")]
    Pull {
        image: String,
        #[source]
        source: StoreError,
    },

    #[error("failed to save {image}")]
    Save {
        image: String,
        #[source]
        source: StoreError,
    },

    #[error("failed to set permissions on {}", .path.display())]
    Permissions {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to read size of {}", .path.display())]
    Stat {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("export deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),

    #[error("client disconnected")]
    Disconnected,
}

impl ExportError {
    /// Operator-facing detail sent as a `log` event before the `error`.
    pub fn detail(&self) -> Option<String> {
        match self {
            Self::Pull { source, .. } | Self::Save { source, .. } => Some(source.diagnostic()),
            Self::Permissions { source, .. } | Self::Stat { source, .. } => {
                Some(source.to_string())
            }
            _ => None,
        }
    }
}

/// A failed export and the stage it failed in.
#[derive(Debug)]
pub struct ExportFailure {
    pub stage: ExportStage,
    pub error: ExportError,
}

/// Inputs of one export.
#[derive(Debug, Clone)]
pub struct ExportRequest {
    pub request_id: Uuid,
    pub image: String,
    /// Host placed in the advertised URL.
    pub host: String,
}

/// Writing half of the event stream.
///
/// Each event is encoded as one line and handed to the response body as its
/// own chunk, so it reaches the client without waiting for later events.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::Sender<Bytes>,
}

impl EventSink {
    /// Create a sink and the receiver the response body reads from.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Send one event. Returns false once the client is gone.
    pub async fn send(&self, event: TransferEvent) -> bool {
        let line = match encode_event(&event) {
            Ok(line) => line,
            Err(err) => {
                error!(error = %err, kind = event.kind(), "failed to encode event");
                return false;
            }
        };
        debug!(kind = event.kind(), "sending event");
        self.tx.send(Bytes::from(line)).await.is_ok()
    }

    /// Resolves when the receiving side has been dropped.
    pub async fn closed(&self) {
        self.tx.closed().await
    }
}

/// Run one export to completion, sending its events to `sink`.
///
/// On success the artifact lock is turned into a lease before `sink` is
/// dropped, so by the time the client sees the end of the stream its cleanup
/// request can end the lease, and no other export can replace the file first.
/// On failure the lock is released before `sink` is dropped.
pub async fn run_export(
    state: ServerState,
    request: ExportRequest,
    sink: EventSink,
) -> Result<(), ExportFailure> {
    let deadline = state.config.export_deadline();
    let mut export = Export::new(&state, &request, &sink);

    let prepared = tokio::select! {
        biased;
        _ = sink.closed() => Err(ExportError::Disconnected),
        result = tokio::time::timeout(deadline, export.prepare()) => {
            result.unwrap_or_else(|_| Err(ExportError::DeadlineExceeded(deadline)))
        }
    };
    let result = match prepared {
        Ok(advertisement) => export.advertise(advertisement).await,
        Err(error) => Err(error),
    };

    let outcome = match result {
        Ok(()) => {
            export.clean_local_image().await;
            export.hold_for_cleanup();
            Ok(())
        }
        Err(error) => Err(export.fail(error).await),
    };
    drop(export);
    outcome
}

/// Size and download URL of a saved artifact.
struct Advertisement {
    size: u64,
    url: String,
}

struct Export<'a> {
    state: &'a ServerState,
    request: &'a ExportRequest,
    sink: &'a EventSink,
    stage: ExportStage,
    /// Held until the export is dropped or the artifact is leased.
    guard: Option<ArtifactGuard>,
    /// Tar being written and not yet advertised.
    partial: Option<PathBuf>,
}

impl<'a> Export<'a> {
    fn new(state: &'a ServerState, request: &'a ExportRequest, sink: &'a EventSink) -> Self {
        Self {
            state,
            request,
            sink,
            stage: ExportStage::ReceivingRequest,
            guard: None,
            partial: None,
        }
    }

    fn image(&self) -> &'a str {
        self.request.image.trim()
    }

    fn enter(&mut self, stage: ExportStage) {
        debug!(from = %self.stage, to = %stage, "export stage");
        self.stage = stage;
    }

    async fn emit(&self, event: TransferEvent) -> Result<(), ExportError> {
        if self.sink.send(event).await {
            Ok(())
        } else {
            Err(ExportError::Disconnected)
        }
    }

    /// Run `step`, sending a progress `log` event every interval until it
    /// completes.
    async fn with_progress<T>(
        &self,
        action: &str,
        step: impl Future<Output = T>,
    ) -> Result<T, ExportError> {
        let every = self.state.config.progress_interval();
        let started = tokio::time::Instant::now();
        let mut ticks = tokio::time::interval_at(started + every, every);
        tokio::pin!(step);

        loop {
            tokio::select! {
                output = &mut step => return Ok(output),
                _ = ticks.tick() => {
                    let elapsed = started.elapsed().as_secs();
                    debug!(action, elapsed, "tool still running");
                    self.emit(TransferEvent::log(format!(
                        "still {} {} ({}s elapsed)",
                        action,
                        self.image(),
                        elapsed
                    )))
                    .await?;
                }
            }
        }
    }

    /// Everything up to the advertisement.
    async fn prepare(&mut self) -> Result<Advertisement, ExportError> {
        let image = self.image();
        let artifact = ArtifactName::derive(image)?;
        info!(artifact = %artifact, "export requested");

        self.guard = Some(self.lock(&artifact).await?);

        let state = self.state;
        let config = &state.config;
        let path = artifact.path_in(&config.download_dir);
        remove_stale(&path).await;

        self.enter(ExportStage::Pulling);
        self.with_progress("pulling", state.store.pull(image))
            .await?
            .map_err(|source| ExportError::Pull {
                image: image.to_string(),
                source,
            })?;
        info!("image pulled");
        self.emit(TransferEvent::log(format!("pulled {}", image)))
            .await?;

        self.enter(ExportStage::Saving);
        self.partial = Some(path.clone());
        self.with_progress("saving", state.store.save(image, &path))
            .await?
            .map_err(|source| ExportError::Save {
                image: image.to_string(),
                source,
            })?;
        info!(path = %path.display(), "image saved");

        self.enter(ExportStage::SettingPermissions);
        set_mode(&path, config.artifact_mode)
            .await
            .map_err(|source| ExportError::Permissions {
                path: path.clone(),
                source,
            })?;

        self.enter(ExportStage::SizingAndAdvertising);
        let size = tokio::fs::metadata(&path)
            .await
            .map_err(|source| ExportError::Stat {
                path: path.clone(),
                source,
            })?
            .len();
        let url = artifact.download_url(&self.request.host, config.file_port);

        Ok(Advertisement { size, url })
    }

    /// Send the size and URL. Only a disconnect can interrupt this.
    async fn advertise(&mut self, advertisement: Advertisement) -> Result<(), ExportError> {
        let Advertisement { size, url } = advertisement;
        self.emit(TransferEvent::size_known(size)).await?;
        self.emit(TransferEvent::url_ready(url.clone())).await?;
        self.partial = None;
        info!(size, url = %url, "artifact advertised");
        Ok(())
    }

    async fn lock(&self, artifact: &ArtifactName) -> Result<ArtifactGuard, ExportError> {
        let locks = &self.state.locks;
        let result = match self.state.config.duplicate_exports {
            DuplicatePolicy::Reject => locks.try_acquire(artifact),
            DuplicatePolicy::Wait => locks.acquire(artifact, self.state.config.lock_wait()).await,
        };
        result.map_err(|source| ExportError::Busy {
            image: self.image().to_string(),
            source,
        })
    }

    /// Remove the image from the local store. Failures are only logged.
    async fn clean_local_image(&mut self) {
        self.enter(ExportStage::CleaningLocalImage);
        let image = self.image();

        self.sink
            .send(TransferEvent::log(format!("removing local image {}", image)))
            .await;
        if let Err(err) = self.state.store.remove(image).await {
            warn!(error = %err.diagnostic(), "failed to remove local image");
        }
        self.sink.send(TransferEvent::log("cleanup complete")).await;

        self.enter(ExportStage::Done);
        info!("export complete");
    }

    /// Keep the artifact reserved until the importer cleans it up.
    fn hold_for_cleanup(&mut self) {
        if let Some(guard) = self.guard.take() {
            guard.into_lease(self.request.request_id, self.state.config.artifact_lease());
        }
    }

    async fn fail(&mut self, error: ExportError) -> ExportFailure {
        let stage = self.stage;
        self.enter(ExportStage::Failed);

        if let Some(path) = self.partial.take() {
            remove_stale(&path).await;
        }

        match &error {
            ExportError::Disconnected => {
                warn!(stage = %stage, "client disconnected, export abandoned");
            }
            _ => {
                warn!(stage = %stage, error = %error, "export failed");
                if let Some(detail) = error.detail() {
                    self.sink.send(TransferEvent::log(detail)).await;
                }
                self.sink.send(TransferEvent::error(error.to_string())).await;
            }
        }

        ExportFailure { stage, error }
    }
}

/// Delete `path` if it exists.
async fn remove_stale(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "removed stale artifact"),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), error = %err, "failed to remove stale artifact"),
    }
}

#[cfg(unix)]
async fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await
}

#[cfg(not(unix))]
async fn set_mode(path: &Path, _mode: u32) -> io::Result<()> {
    tokio::fs::metadata(path).await.map(|_| ())
}
