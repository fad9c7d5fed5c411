//! Subprocess execution with captured output.

use std::ffi::OsStr;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

use crate::{StoreError, StoreOp, StoreResult};

/// Captured output of a finished tool invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    /// stdout followed by stderr.
    pub fn combined(&self) -> String {
        let mut out = self.stdout.clone();
        if !self.stderr.is_empty() {
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(&self.stderr);
        }
        out
    }
}

/// Run `program` with `args`, wait for it, and capture its output.
///
/// A non-zero exit becomes [`StoreError::Failed`] carrying the combined
/// output. The child is killed if the timeout elapses or the returned future
/// is dropped, so cancelling the caller cancels the tool.
pub async fn run_tool<I, S>(
    op: StoreOp,
    program: &Path,
    args: I,
    timeout: Option<Duration>,
) -> StoreResult<ToolOutput>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!(%op, program = %program.display(), "running image tool");

    let child = command.spawn().map_err(|source| StoreError::Spawn {
        op,
        program: program.to_path_buf(),
        source,
    })?;

    let wait = child.wait_with_output();
    let output = match timeout {
        Some(after) => tokio::time::timeout(after, wait)
            .await
            .map_err(|_| StoreError::Timeout { op, after })?,
        None => wait.await,
    }
    .map_err(|source| StoreError::Spawn {
        op,
        program: program.to_path_buf(),
        source,
    })?;

    let captured = ToolOutput {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    };

    if output.status.success() {
        Ok(captured)
    } else {
        Err(StoreError::Failed {
            op,
            status: output.status.to_string(),
            output: captured.combined(),
        })
    }
}
