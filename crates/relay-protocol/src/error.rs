//! Error codes for control-plane rejections.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable error codes for requests the exporter refuses outright.
///
/// Failures that happen after the event stream has opened are reported as
/// `error` events instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Missing, malformed, or wrong bearer token.
    Unauthorized,
    /// Missing or invalid query parameter.
    InvalidRequest,
    /// Deleting the artifact failed.
    CleanupFailed,
    /// Another operation holds the artifact.
    Busy,
}

impl ErrorCode {
    /// HTTP status code the exporter answers with.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Unauthorized => 401,
            Self::InvalidRequest => 400,
            Self::CleanupFailed => 500,
            Self::Busy => 409,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unauthorized => write!(f, "UNAUTHORIZED"),
            Self::InvalidRequest => write!(f, "INVALID_REQUEST"),
            Self::CleanupFailed => write!(f, "CLEANUP_FAILED"),
            Self::Busy => write!(f, "BUSY"),
        }
    }
}

/// A rejected control-plane request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayError {
    pub code: ErrorCode,
    /// Single-line, human-readable message. Sent as the response body.
    pub message: String,
}

impl RelayError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Create an UNAUTHORIZED error.
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unauthorized, message)
    }

    /// Create an INVALID_REQUEST error.
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidRequest, message)
    }

    /// Create a CLEANUP_FAILED error.
    pub fn cleanup_failed(file: &str, reason: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::CleanupFailed,
            format!("failed to delete {}: {}", file, reason),
        )
    }

    /// Create a BUSY error.
    pub fn busy(artifact: &str) -> Self {
        Self::new(
            ErrorCode::Busy,
            format!("artifact '{}' is in use by another request", artifact),
        )
    }
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for RelayError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(RelayError::unauthorized("x").code.http_status(), 401);
        assert_eq!(RelayError::invalid_request("x").code.http_status(), 400);
        assert_eq!(RelayError::cleanup_failed("a.tar", "gone").code.http_status(), 500);
    }

    #[test]
    fn test_display_includes_code() {
        let err = RelayError::cleanup_failed("a.tar", "No such file or directory");
        assert_eq!(
            err.to_string(),
            "CLEANUP_FAILED: failed to delete a.tar: No such file or directory"
        );
    }
}
