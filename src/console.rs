//! Operator-facing output.
//!
//! What the operator reads (exporter log lines, errors, the final report) is
//! kept apart from diagnostic tracing, which may be going to a file.

use std::io::Write;

/// Sink for operator-facing text.
pub trait Console: Send + Sync {
    /// Progress or informational line.
    fn line(&self, text: &str);

    /// Failure line.
    fn error(&self, text: &str);
}

/// Writes lines to stdout and errors to stderr.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdConsole;

impl Console for StdConsole {
    fn line(&self, text: &str) {
        let mut out = std::io::stdout().lock();
        let _ = writeln!(out, "{}", text);
        let _ = out.flush();
    }

    fn error(&self, text: &str) {
        let _ = writeln!(std::io::stderr().lock(), "error: {}", text);
    }
}

#[cfg(test)]
pub(crate) use recording::RecordingConsole;
