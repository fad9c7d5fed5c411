//! Artifact deletion for `/cleanup`.

use std::io;
use std::path::PathBuf;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use relay_protocol::{ArtifactNameError, CleanupToken, RelayError};
use thiserror::Error;
use tracing::{info, warn};

use crate::locks::LockError;
use crate::state::ServerState;

/// Errors from deleting an artifact.
#[derive(Debug, Error)]
pub enum CleanupError {
    #[error("missing file parameter")]
    MissingFile,

    #[error(transparent)]
    InvalidFile(#[from] ArtifactNameError),

    #[error(transparent)]
    Busy(#[from] LockError),

    #[error("failed to delete {file}: {source}")]
    Delete {
        file: String,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl CleanupError {
    pub fn to_relay_error(&self) -> RelayError {
        match self {
            Self::MissingFile | Self::InvalidFile(_) => RelayError::invalid_request(self.to_string()),
            Self::Busy(LockError::Busy(name)) | Self::Busy(LockError::Timeout { name, .. }) => {
                RelayError::busy(name.as_str())
            }
            Self::Delete { file, source, .. } => RelayError::cleanup_failed(file, source),
        }
    }
}

impl IntoResponse for CleanupError {
    fn into_response(self) -> Response {
        let relay = self.to_relay_error();
        let status = StatusCode::from_u16(relay.code.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, relay.message).into_response()
    }
}

/// Delete the artifact named by `file` from the managed directory.
///
/// Ends the artifact's lease when it has one. Otherwise waits for a running
/// export of the same artifact to finish first. A file that does not exist is
/// reported as a failure, so a repeated cleanup gets an error response rather
/// than a second confirmation.
pub async fn delete_artifact(
    state: &ServerState,
    file: Option<&str>,
) -> Result<CleanupToken, CleanupError> {
    let file = file.filter(|f| !f.is_empty()).ok_or(CleanupError::MissingFile)?;
    let token = CleanupToken::parse(file)?;

    let artifact = token.artifact();
    let _guard = match state.locks.release(&artifact) {
        Some(guard) => guard,
        None => state.locks.acquire(&artifact, state.config.lock_wait()).await?,
    };

    let path = token.path_in(&state.config.download_dir);
    match tokio::fs::remove_file(&path).await {
        Ok(()) => {
            info!(file = token.as_str(), "artifact deleted");
            Ok(token)
        }
        Err(source) => {
            warn!(file = token.as_str(), error = %source, "artifact deletion failed");
            Err(CleanupError::Delete {
                file: token.as_str().to_string(),
                path,
                source,
            })
        }
    }
}
