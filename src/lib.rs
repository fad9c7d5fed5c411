//! Image Relay importer
//!
//! Asks a relay exporter to export a container image, follows its event
//! stream until the artifact is advertised, downloads it with an accelerated
//! fetcher, verifies the size, loads it into the local image store, and asks
//! the exporter to delete its copy.

pub mod client;
pub mod config;
pub mod console;
pub mod fetcher;
pub mod import;
pub mod signal;
pub mod stream;
pub mod timeout;

pub use client::{ClientError, ExporterClient};
pub use config::{ConfigError, ImporterConfig};
pub use console::{Console, StdConsole};
pub use fetcher::{Aria2c, FetchError, Fetcher};
pub use import::{CleanupOutcome, ImportError, ImportFailure, ImportReport, ImportStage, Importer};
pub use signal::{SignalHandler, EXIT_CODE_CANCELLED};
pub use stream::{EventReader, StreamError};
pub use timeout::{TimeoutConfig, TimeoutEnforcer, TimeoutStatus};
