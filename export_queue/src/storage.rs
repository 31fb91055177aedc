use std::{
    ffi::OsStr,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use eyre::{eyre, WrapErr};
use tracing::{event, instrument, Level};
use uuid::Uuid;

/// Durable storage for finished export artifacts.
#[async_trait]
pub trait ArtifactStorage: Send + Sync + 'static {
    /// Persist an artifact and return a location from which it can be retrieved later, such as
    /// a path or URL.
    async fn store(&self, job_id: Uuid, filename: &str, content: &[u8]) -> eyre::Result<String>;
}

/// An [ArtifactStorage] that writes artifacts beneath a local directory, as
/// `<root>/<job_id>/<filename>`.
#[derive(Debug, Clone)]
pub struct DirectoryStorage {
    root: PathBuf,
}

impl DirectoryStorage {
    /// Store artifacts beneath `root`. The directory is created on first use.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        DirectoryStorage { root: root.into() }
    }

    /// The directory artifacts are written to.
    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl ArtifactStorage for DirectoryStorage {
    #[instrument(level = "debug", skip(self, content), fields(bytes = content.len()))]
    async fn store(&self, job_id: Uuid, filename: &str, content: &[u8]) -> eyre::Result<String> {
        // Only accept a bare file name so a handler can't write outside the job's directory.
        if filename.is_empty() || Path::new(filename).file_name() != Some(OsStr::new(filename)) {
            return Err(eyre!("Invalid artifact file name {filename:?}"));
        }

        let dir = self.root.join(job_id.to_string());
        tokio::fs::create_dir_all(&dir)
            .await
            .wrap_err_with(|| format!("Creating {}", dir.display()))?;

        let path = dir.join(filename);
        tokio::fs::write(&path, content)
            .await
            .wrap_err_with(|| format!("Writing {}", path.display()))?;

        event!(Level::DEBUG, path=%path.display(), "stored artifact");
        Ok(path.display().to_string())
    }
}
