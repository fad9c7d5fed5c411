//! Image Relay Protocol Types
//!
//! Defines the newline-delimited JSON event stream sent from the exporter to
//! the importer, the artifact naming policy both sides agree on, and the
//! HTTP endpoint names of the exporter's control plane.

pub mod artifact;
pub mod buffer;
pub mod endpoints;
pub mod error;
pub mod event;

pub use artifact::{url_file_name, ArtifactName, ArtifactNameError, CleanupToken, ARTIFACT_EXTENSION};
pub use buffer::LineBuffer;
pub use error::{ErrorCode, RelayError};
pub use event::{decode_line, encode_event, LineDecode, SkipReason, TransferEvent};

/// Default port of the authenticated control plane (`/download`, `/cleanup`).
pub const DEFAULT_CONTROL_PORT: u16 = 50000;

/// Default port of the unauthenticated static file server.
pub const DEFAULT_FILE_PORT: u16 = 30000;
