//! Artifact naming policy.
//!
//! An image reference such as `registry.local:5000/team/app:1.2` becomes the
//! artifact name `registry.local_5000-team-app_1.2`, stored as
//! `<download_dir>/registry.local_5000-team-app_1.2.tar` and advertised under
//! the same file name. The importer hands that file name back as the
//! [`CleanupToken`].
//!
//! The mapping is deterministic but not injective: `a/b:c` and `a-b_c` share a
//! name. Exports of one name are serialized by the exporter.

use std::fmt;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// File extension of exported artifacts.
pub const ARTIFACT_EXTENSION: &str = "tar";

/// Errors from deriving or validating artifact names.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArtifactNameError {
    #[error("image name is empty")]
    EmptyImage,

    #[error("image name '{0}' must not start with '-'")]
    OptionLikeImage(String),

    #[error("image name '{0}' does not map to a usable file name")]
    Unrepresentable(String),

    #[error("file name is empty")]
    EmptyFile,

    #[error("file name '{0}' must be a plain .tar file name without path components")]
    InvalidFile(String),
}

/// Filesystem-safe name derived from an image reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArtifactName(String);

impl ArtifactName {
    /// Derive the artifact name for an image reference.
    ///
    /// `:` becomes `_` and `/` becomes `-`. Backslashes and control
    /// characters also become `_` so the result is always a single path
    /// component on every platform.
    pub fn derive(image: &str) -> Result<Self, ArtifactNameError> {
        let image = image.trim();
        if image.is_empty() {
            return Err(ArtifactNameError::EmptyImage);
        }
        if image.starts_with('-') {
            return Err(ArtifactNameError::OptionLikeImage(image.to_string()));
        }

        let name: String = image
            .chars()
            .map(|c| match c {
                ':' => '_',
                '/' => '-',
                '\\' => '_',
                c if c.is_control() => '_',
                c => c,
            })
            .collect();

        if name == "." || name == ".." {
            return Err(ArtifactNameError::Unrepresentable(image.to_string()));
        }

        Ok(Self(name))
    }

    /// The bare name, without extension.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `<name>.tar`
    pub fn file_name(&self) -> String {
        format!("{}.{}", self.0, ARTIFACT_EXTENSION)
    }

    /// Location of the artifact under a managed directory.
    pub fn path_in(&self, dir: &Path) -> PathBuf {
        dir.join(self.file_name())
    }

    /// Download URL on the file server at `host:port`.
    ///
    /// `host` is a bare host name or address; IPv6 literals may be given with
    /// or without brackets.
    pub fn download_url(&self, host: &str, port: u16) -> String {
        let host = if host.contains(':') && !host.starts_with('[') {
            format!("[{}]", host)
        } else {
            host.to_string()
        };
        format!("http://{}:{}/{}", host, port, self.file_name())
    }
}

impl fmt::Display for ArtifactName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A validated artifact file name sent to the cleanup endpoint.
///
/// Only plain `<name>.tar` file names are accepted: no separators, no `.` or
/// `..`, no hidden files, no NUL. Combined with [`CleanupToken::path_in`]
/// this confines deletion to the managed directory itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupToken(String);

impl CleanupToken {
    pub fn parse(file: &str) -> Result<Self, ArtifactNameError> {
        if file.is_empty() {
            return Err(ArtifactNameError::EmptyFile);
        }

        let invalid = || ArtifactNameError::InvalidFile(file.to_string());

        if file.contains(['/', '\\', '\0']) || file.starts_with('.') {
            return Err(invalid());
        }

        let stem = file
            .strip_suffix(ARTIFACT_EXTENSION)
            .and_then(|s| s.strip_suffix('.'))
            .ok_or_else(invalid)?;
        if stem.is_empty() {
            return Err(invalid());
        }

        Ok(Self(file.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The artifact name this file belongs to.
    pub fn artifact(&self) -> ArtifactName {
        let stem = &self.0[..self.0.len() - ARTIFACT_EXTENSION.len() - 1];
        ArtifactName(stem.to_string())
    }

    pub fn path_in(&self, dir: &Path) -> PathBuf {
        dir.join(&self.0)
    }
}

impl fmt::Display for CleanupToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The last path segment of a URL, ignoring query and fragment.
///
/// Returns `None` when the URL ends in `/` or has no path.
pub fn url_file_name(url: &str) -> Option<&str> {
    let without_query = url.split(['?', '#']).next().unwrap_or(url);
    let after_scheme = without_query
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(without_query);
    let (_, path) = after_scheme.split_once('/')?;
    let name = path.rsplit('/').next()?;
    if name.is_empty() || name == "." || name == ".." {
        None
    } else {
        Some(name)
    }
}
