//! Local filesystem storage backend.

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::error::{StorageError, StorageResult};
use crate::storage::Storage;

/// Stores outputs under a base directory and serves them from a URL
/// prefix (by default `/downloads`).
#[derive(Debug, Clone)]
pub struct LocalStorage {
    base_dir: PathBuf,
    public_base_url: String,
    url_ttl: Duration,
}

impl LocalStorage {
    /// Create the base directory if needed.
    pub async fn new(
        base_dir: impl Into<PathBuf>,
        public_base_url: impl Into<String>,
        url_ttl: Duration,
    ) -> StorageResult<Self> {
        let base_dir = base_dir.into();
        tokio::fs::create_dir_all(&base_dir).await?;
        Ok(Self {
            base_dir,
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
            url_ttl,
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Filesystem path for `key`, refusing keys that escape the base dir.
    pub fn path_for(&self, key: &str) -> StorageResult<PathBuf> {
        let relative = Path::new(key);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if key.is_empty() || escapes {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.base_dir.join(relative))
    }
}

#[async_trait]
impl Storage for LocalStorage {
    async fn upload(&self, path: &Path, key: &str) -> StorageResult<()> {
        let destination = self.path_for(key)?;
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(path, &destination)
            .await
            .map_err(|e| StorageError::upload_failed(format!("{}: {}", path.display(), e)))?;

        info!(key = %key, path = %destination.display(), "File uploaded to local storage");
        Ok(())
    }

    async fn presigned_url(&self, key: &str) -> StorageResult<String> {
        self.path_for(key)?;
        let encoded: Vec<String> = key
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect();
        Ok(format!("{}/{}", self.public_base_url, encoded.join("/")))
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        match tokio::fs::remove_file(self.path_for(key)?).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::delete_failed(e.to_string())),
        }
    }

    fn url_ttl(&self) -> Duration {
        self.url_ttl
    }

    fn name(&self) -> &'static str {
        "local"
    }
}
