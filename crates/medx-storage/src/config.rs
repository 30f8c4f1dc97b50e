//! Storage configuration and backend factory.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{StorageError, StorageResult};
use crate::local::LocalStorage;
use crate::s3::S3Storage;
use crate::storage::Storage;

/// Which backend stores finished downloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    S3,
    Local,
}

impl FromStr for StorageBackend {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "s3" | "r2" | "minio" => Ok(StorageBackend::S3),
            "local" | "fs" => Ok(StorageBackend::Local),
            other => Err(StorageError::config_error(format!(
                "unknown storage backend '{}'",
                other
            ))),
        }
    }
}

/// Storage configuration.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub s3_endpoint_url: Option<String>,
    pub s3_access_key_id: Option<String>,
    pub s3_secret_access_key: Option<String>,
    pub s3_bucket: Option<String>,
    /// Region (usually "auto" for R2)
    pub s3_region: String,
    pub local_dir: PathBuf,
    /// Direct URL prefix for public buckets or the local download route
    pub public_base_url: Option<String>,
    pub presign_ttl: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Local,
            s3_endpoint_url: None,
            s3_access_key_id: None,
            s3_secret_access_key: None,
            s3_bucket: None,
            s3_region: "auto".to_string(),
            local_dir: PathBuf::from("./downloads"),
            public_base_url: None,
            presign_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl StorageConfig {
    /// Create config from environment variables.
    pub fn from_env() -> StorageResult<Self> {
        let defaults = Self::default();
        let backend = match std::env::var("STORAGE_BACKEND") {
            Ok(value) => value.parse()?,
            Err(_) => StorageBackend::S3,
        };

        Ok(Self {
            backend,
            s3_endpoint_url: std::env::var("S3_ENDPOINT_URL").ok(),
            s3_access_key_id: std::env::var("S3_ACCESS_KEY_ID").ok(),
            s3_secret_access_key: std::env::var("S3_SECRET_ACCESS_KEY").ok(),
            s3_bucket: std::env::var("S3_BUCKET").ok(),
            s3_region: std::env::var("S3_REGION").unwrap_or(defaults.s3_region),
            local_dir: std::env::var("STORAGE_LOCAL_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.local_dir),
            public_base_url: std::env::var("STORAGE_PUBLIC_BASE_URL").ok(),
            presign_ttl: std::env::var("STORAGE_PRESIGN_TTL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.presign_ttl),
        })
    }
}

/// Build the configured backend.
pub async fn create_storage(config: &StorageConfig) -> StorageResult<Arc<dyn Storage>> {
    match config.backend {
        StorageBackend::S3 => Ok(Arc::new(S3Storage::new(config)?)),
        StorageBackend::Local => {
            let public = config
                .public_base_url
                .clone()
                .unwrap_or_else(|| "/downloads".to_string());
            let storage = LocalStorage::new(&config.local_dir, public, config.presign_ttl).await?;
            Ok(Arc::new(storage))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_from_str() {
        assert_eq!("S3".parse::<StorageBackend>().unwrap(), StorageBackend::S3);
        assert_eq!("r2".parse::<StorageBackend>().unwrap(), StorageBackend::S3);
        assert_eq!("local".parse::<StorageBackend>().unwrap(), StorageBackend::Local);
        assert!("gcs".parse::<StorageBackend>().is_err());
    }

    #[tokio::test]
    async fn test_factory_builds_local_backend() {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig {
            local_dir: dir.path().join("out"),
            ..StorageConfig::default()
        };
        let storage = create_storage(&config).await.unwrap();
        assert_eq!(storage.name(), "local");
        assert_eq!(
            storage.presigned_url("downloads/j/a.mp4").await.unwrap(),
            "/downloads/downloads/j/a.mp4"
        );
    }

    #[tokio::test]
    async fn test_factory_requires_s3_settings() {
        let config = StorageConfig {
            backend: StorageBackend::S3,
            ..StorageConfig::default()
        };
        assert!(matches!(
            create_storage(&config).await,
            Err(StorageError::ConfigError(_))
        ));
    }
}
