//! Artifact storage backends.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;
use wikiselect_shared::{Result, WikiSelectError};

/// Blob storage addressed by artifact key.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store `bytes` under `key`, replacing any previous content.
    async fn put(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<()>;

    /// Read the bytes stored under `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Remove `key`. Returns `false` if nothing was stored there.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Public download URL of `key`.
    fn public_url(&self, key: &str) -> String;
}

/// Join a base URL and a key, percent-encoding each key segment.
pub fn public_url(base_url: &str, key: &str) -> String {
    let encoded: Vec<String> = key
        .split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect();
    format!("{}/{}", base_url.trim_end_matches('/'), encoded.join("/"))
}

/// Stores artifacts as files below a root directory.
#[derive(Debug, Clone)]
pub struct LocalArtifactStore {
    root: PathBuf,
    base_url: String,
}

impl LocalArtifactStore {
    pub fn new(root: impl Into<PathBuf>, base_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            base_url: base_url.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let valid = !key.is_empty()
            && key
                .split('/')
                .all(|segment| !segment.is_empty() && segment != "." && segment != "..");
        if !valid {
            return Err(WikiSelectError::Storage(format!("invalid artifact key: {key}")));
        }
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl ArtifactStore for LocalArtifactStore {
    async fn put(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<()> {
        let target = self.path_for(key)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| WikiSelectError::io(parent, e))?;
        }

        // Write beside the target, then rename over it.
        let file_name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let temp = target.with_file_name(format!(".{file_name}.tmp"));
        tokio::fs::write(&temp, bytes)
            .await
            .map_err(|e| WikiSelectError::io(&temp, e))?;
        tokio::fs::rename(&temp, &target)
            .await
            .map_err(|e| WikiSelectError::io(&target, e))?;

        debug!(key, content_type, size = bytes.len(), "stored artifact");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(WikiSelectError::io(&path, e)),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!(key, "deleted artifact");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(WikiSelectError::io(&path, e)),
        }
    }

    fn public_url(&self, key: &str) -> String {
        public_url(&self.base_url, key)
    }
}
