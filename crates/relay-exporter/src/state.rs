//! Shared server state.

use std::sync::Arc;

use relay_store::ImageStore;

use crate::config::ExporterConfig;
use crate::locks::ArtifactLocks;

/// State handed to every handler.
#[derive(Clone)]
pub struct ServerState {
    pub config: Arc<ExporterConfig>,
    pub store: Arc<dyn ImageStore>,
    pub locks: ArtifactLocks,
}

impl ServerState {
    pub fn new(config: ExporterConfig, store: Arc<dyn ImageStore>) -> Self {
        Self {
            config: Arc::new(config),
            store,
            locks: ArtifactLocks::new(),
        }
    }
}
