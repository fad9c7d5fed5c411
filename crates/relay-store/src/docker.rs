//! Docker CLI implementation of [`ImageStore`].

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;

use crate::command::{run_tool, ToolOutput};
use crate::{ImageStore, StoreOp, StoreResult};

/// Drives the `docker` CLI (or any CLI with the same verbs, e.g. `podman`).
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: PathBuf,
    timeout: Option<Duration>,
}

impl DockerCli {
    /// Default binary name, resolved through `PATH`.
    pub const DEFAULT_BINARY: &'static str = "docker";

    pub fn new() -> Self {
        Self::with_binary(Self::DEFAULT_BINARY)
    }

    /// Use a specific binary instead of `docker`.
    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            timeout: None,
        }
    }

    /// Bound every invocation by `timeout`.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    async fn run(&self, op: StoreOp, args: Vec<OsString>) -> StoreResult<ToolOutput> {
        run_tool(op, &self.binary, args, self.timeout).await
    }
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ImageStore for DockerCli {
    async fn pull(&self, image: &str) -> StoreResult<ToolOutput> {
        self.run(StoreOp::Pull, vec!["pull".into(), image.into()]).await
    }

    async fn save(&self, image: &str, dest: &Path) -> StoreResult<ToolOutput> {
        self.run(
            StoreOp::Save,
            vec!["save".into(), "-o".into(), dest.into(), image.into()],
        )
        .await
    }

    async fn remove(&self, image: &str) -> StoreResult<ToolOutput> {
        self.run(StoreOp::Remove, vec!["rmi".into(), image.into()]).await
    }

    async fn load(&self, archive: &Path) -> StoreResult<ToolOutput> {
        self.run(StoreOp::Load, vec!["load".into(), "-i".into(), archive.into()])
            .await
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::StoreError;
    use std::os::unix::fs::PermissionsExt;

    /// A stand-in `docker` that echoes its arguments and fails on request.
    fn fake_docker(dir: &Path) -> PathBuf {
        let path = dir.join("docker");
        std::fs::write(
            &path,
            "#!/bin/sh\necho \"args: $*\"\nif [ \"$2\" = \"missing:tag\" ]; then echo 'manifest unknown' >&2; exit 1; fi\n",
        )
        .unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn test_pull_passes_image() {
        let dir = tempfile::tempdir().unwrap();
        let docker = DockerCli::with_binary(fake_docker(dir.path()));

        let out = docker.pull("alpine:latest").await.unwrap();
        assert_eq!(out.stdout, "args: pull alpine:latest\n");
    }

    #[tokio::test]
    async fn test_save_and_load_argument_order() {
        let dir = tempfile::tempdir().unwrap();
        let docker = DockerCli::with_binary(fake_docker(dir.path()));

        let out = docker
            .save("alpine:latest", Path::new("/data/package/alpine_latest.tar"))
            .await
            .unwrap();
        assert_eq!(
            out.stdout,
            "args: save -o /data/package/alpine_latest.tar alpine:latest\n"
        );

        let out = docker.load(Path::new("alpine_latest.tar")).await.unwrap();
        assert_eq!(out.stdout, "args: load -i alpine_latest.tar\n");

        let out = docker.remove("alpine:latest").await.unwrap();
        assert_eq!(out.stdout, "args: rmi alpine:latest\n");
    }

    #[tokio::test]
    async fn test_pull_failure_diagnostic() {
        let dir = tempfile::tempdir().unwrap();
        let docker = DockerCli::with_binary(fake_docker(dir.path()));

        let err = docker.pull("missing:tag").await.unwrap_err();
        assert!(matches!(err, StoreError::Failed { op: StoreOp::Pull, .. }));
        let diagnostic = err.diagnostic();
        assert!(diagnostic.contains("manifest unknown"), "{}", diagnostic);
        assert!(diagnostic.contains("args: pull missing:tag"), "{}", diagnostic);
    }
}
