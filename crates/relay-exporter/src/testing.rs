//! In-memory image store for handler tests.

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use relay_store::{ImageStore, StoreError, StoreOp, StoreResult, ToolOutput};

#[derive(Debug, Default)]
pub struct FakeStore {
    artifact: Vec<u8>,
    pull_error: Option<String>,
    save_error: Option<String>,
    remove_fails: bool,
    pull_delay: Duration,
    save_delay: Duration,
    calls: Mutex<Vec<String>>,
}

impl FakeStore {
    /// Saves write `artifact` to the destination.
    pub fn with_artifact(artifact: Vec<u8>) -> Self {
        Self {
            artifact,
            ..Default::default()
        }
    }

    pub fn failing_pull(output: &str) -> Self {
        Self {
            pull_error: Some(output.to_string()),
            ..Default::default()
        }
    }

    /// Saves write a partial file and then fail.
    pub fn failing_save(output: &str) -> Self {
        Self {
            artifact: b"partial".to_vec(),
            save_error: Some(output.to_string()),
            ..Default::default()
        }
    }

    pub fn failing_remove(mut self) -> Self {
        self.remove_fails = true;
        self
    }

    /// Pulls take `delay` before returning.
    pub fn slow_pull(mut self, delay: Duration) -> Self {
        self.pull_delay = delay;
        self
    }

    /// Saves write the artifact, then take `delay` before returning.
    pub fn slow_save(mut self, delay: Duration) -> Self {
        self.save_delay = delay;
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

fn failed(op: StoreOp, output: &str) -> StoreError {
    StoreError::Failed {
        op,
        status: "exit status: 1".to_string(),
        output: output.to_string(),
    }
}

#[async_trait]
impl ImageStore for FakeStore {
    async fn pull(&self, image: &str) -> StoreResult<ToolOutput> {
        self.record(format!("pull {}", image));
        tokio::time::sleep(self.pull_delay).await;
        match &self.pull_error {
            Some(output) => Err(failed(StoreOp::Pull, output)),
            None => Ok(ToolOutput::default()),
        }
    }

    async fn save(&self, image: &str, dest: &Path) -> StoreResult<ToolOutput> {
        self.record(format!("save {} {}", image, dest.display()));
        std::fs::write(dest, &self.artifact).unwrap();
        tokio::time::sleep(self.save_delay).await;
        match &self.save_error {
            Some(output) => Err(failed(StoreOp::Save, output)),
            None => Ok(ToolOutput::default()),
        }
    }

    async fn remove(&self, image: &str) -> StoreResult<ToolOutput> {
        self.record(format!("remove {}", image));
        if self.remove_fails {
            Err(failed(StoreOp::Remove, "image is being used by running container"))
        } else {
            Ok(ToolOutput::default())
        }
    }

    async fn load(&self, archive: &Path) -> StoreResult<ToolOutput> {
        self.record(format!("load {}", archive.display()));
        Ok(ToolOutput::default())
    }
}
