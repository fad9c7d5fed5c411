//! Accelerated fetcher adapter.
//!
//! The artifact itself is not downloaded by this process. A multi-connection
//! downloader (`aria2c`) fetches it from the exporter's file port, and its
//! progress output goes straight to the operator's terminal.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

/// Errors from the fetcher
#[derive(Debug, Error)]
pub enum FetchError {
    #[error(
        "{binary} is not installed or not in PATH. Install aria2 first:\n  \
         Debian/Ubuntu: sudo apt-get install aria2\n  \
         CentOS/RHEL:   sudo yum install aria2"
    )]
    NotInstalled { binary: String },

    #[error("failed to start {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    #[error("download failed: {binary} exited with {status}")]
    Failed { binary: String, status: String },

    #[error("download timed out after {0:?}")]
    Timeout(Duration),
}

/// Downloads one URL to one local file.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Confirm the fetcher can run. Called before any network request.
    fn preflight(&self) -> Result<(), FetchError>;

    /// Download `url` to `dir/file_name`, replacing any existing file.
    async fn fetch(&self, url: &str, dir: &Path, file_name: &str) -> Result<(), FetchError>;
}

/// `aria2c` with a fixed connection count.
#[derive(Debug, Clone)]
pub struct Aria2c {
    binary: PathBuf,
    connections: u8,
    timeout: Option<Duration>,
}

impl Aria2c {
    pub fn new(binary: impl Into<PathBuf>, connections: u8) -> Self {
        Self {
            binary: binary.into(),
            connections,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    fn name(&self) -> String {
        self.binary.display().to_string()
    }

    /// Command line for one download.
    pub fn args(&self, url: &str, dir: &Path, file_name: &str) -> Vec<OsString> {
        let n = self.connections.to_string();
        vec![
            "-x".into(),
            n.clone().into(),
            "-s".into(),
            n.into(),
            "--allow-overwrite=true".into(),
            "--auto-file-renaming=false".into(),
            "-d".into(),
            dir.into(),
            "-o".into(),
            file_name.into(),
            url.into(),
        ]
    }
}

#[async_trait]
impl Fetcher for Aria2c {
    fn preflight(&self) -> Result<(), FetchError> {
        let path = which::which(&self.binary).map_err(|err| {
            debug!(binary = %self.name(), error = %err, "fetcher lookup failed");
            FetchError::NotInstalled { binary: self.name() }
        })?;
        debug!(path = %path.display(), "fetcher found");
        Ok(())
    }

    async fn fetch(&self, url: &str, dir: &Path, file_name: &str) -> Result<(), FetchError> {
        info!(url, file = file_name, connections = self.connections, "starting download");

        let mut command = Command::new(&self.binary);
        command
            .args(self.args(url, dir, file_name))
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|source| FetchError::Spawn {
            binary: self.name(),
            source,
        })?;

        let wait = child.wait();
        let status = match self.timeout {
            Some(after) => tokio::time::timeout(after, wait)
                .await
                .map_err(|_| FetchError::Timeout(after))?,
            None => wait.await,
        }
        .map_err(|source| FetchError::Spawn {
            binary: self.name(),
            source,
        })?;

        if status.success() {
            Ok(())
        } else {
            Err(FetchError::Failed {
                binary: self.name(),
                status: status.to_string(),
            })
        }
    }
}
