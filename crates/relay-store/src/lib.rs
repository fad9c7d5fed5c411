//! Image store adapter.
//!
//! The relay never talks to a container runtime directly; it drives the
//! runtime's CLI (`docker pull`, `docker save`, `docker rmi`, `docker load`)
//! and captures what the tool prints so failures can be shown verbatim.
//!
//! [`ImageStore`] is the seam the exporter and importer program against;
//! [`DockerCli`] is the production implementation.

mod command;
mod docker;

pub use command::{run_tool, ToolOutput};
pub use docker::DockerCli;

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Result type for image store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Image store operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    Pull,
    Save,
    Remove,
    Load,
}

impl fmt::Display for StoreOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pull => write!(f, "pull"),
            Self::Save => write!(f, "save"),
            Self::Remove => write!(f, "remove"),
            Self::Load => write!(f, "load"),
        }
    }
}

/// Errors from image store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{op}: failed to start {program}: {source}")]
    Spawn {
        op: StoreOp,
        program: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{op} failed: {status}")]
    Failed {
        op: StoreOp,
        status: String,
        output: String,
    },

    #[error("{op} timed out after {after:?}")]
    Timeout { op: StoreOp, after: Duration },
}

impl StoreError {
    /// The operation that failed.
    pub fn op(&self) -> StoreOp {
        match self {
            Self::Spawn { op, .. } | Self::Failed { op, .. } | Self::Timeout { op, .. } => *op,
        }
    }

    /// Error text followed by whatever the tool printed, for operators.
    pub fn diagnostic(&self) -> String {
        match self {
            Self::Failed { output, .. } if !output.trim().is_empty() => {
                format!("{}\n{}", self, output.trim_end())
            }
            _ => self.to_string(),
        }
    }
}

/// Operations on a local container image store.
#[async_trait]
pub trait ImageStore: Send + Sync {
    /// Fetch `image` from its registry into the local store.
    async fn pull(&self, image: &str) -> StoreResult<ToolOutput>;

    /// Write `image` as a tar archive to `dest`.
    async fn save(&self, image: &str, dest: &Path) -> StoreResult<ToolOutput>;

    /// Remove `image` from the local store. The archive is untouched.
    async fn remove(&self, image: &str) -> StoreResult<ToolOutput>;

    /// Import the tar archive at `archive` into the local store.
    async fn load(&self, archive: &Path) -> StoreResult<ToolOutput>;
}
