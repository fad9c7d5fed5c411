//! Relay exporter.
//!
//! Pulls a container image, saves it as a tar artifact, and streams progress
//! and the artifact's size and download URL back to the caller as
//! newline-delimited JSON. The artifact stays on disk until the caller asks
//! for it to be deleted through `/cleanup`.

pub mod auth;
pub mod cleanup;
pub mod config;
pub mod export;
pub mod locks;
pub mod server;
pub mod state;

#[cfg(test)]
mod testing;

pub use cleanup::{delete_artifact, CleanupError};
pub use config::{ConfigError, DuplicatePolicy, ExporterConfig};
pub use export::{run_export, EventSink, ExportError, ExportFailure, ExportRequest, ExportStage};
pub use locks::{ArtifactGuard, ArtifactLocks, LockError};
pub use server::{create_app, file_server, serve, start_server};
pub use state::ServerState;
