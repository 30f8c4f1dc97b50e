//! S3-compatible storage backend.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::config::{Builder, Region};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use tracing::{debug, info};

use crate::config::StorageConfig;
use crate::error::{StorageError, StorageResult};
use crate::keys::content_type_for;
use crate::storage::Storage;

/// Storage backed by an S3-compatible bucket (AWS S3, R2, MinIO).
#[derive(Clone)]
pub struct S3Storage {
    client: Client,
    bucket: String,
    public_base_url: Option<String>,
    url_ttl: Duration,
}

impl S3Storage {
    /// Create a client from configuration.
    pub fn new(config: &StorageConfig) -> StorageResult<Self> {
        let endpoint = config
            .s3_endpoint_url
            .as_deref()
            .ok_or_else(|| StorageError::config_error("S3_ENDPOINT_URL not set"))?;
        let access_key = config
            .s3_access_key_id
            .as_deref()
            .ok_or_else(|| StorageError::config_error("S3_ACCESS_KEY_ID not set"))?;
        let secret_key = config
            .s3_secret_access_key
            .as_deref()
            .ok_or_else(|| StorageError::config_error("S3_SECRET_ACCESS_KEY not set"))?;
        let bucket = config
            .s3_bucket
            .clone()
            .ok_or_else(|| StorageError::config_error("S3_BUCKET not set"))?;

        let credentials = Credentials::new(access_key, secret_key, None, None, "medx");

        let sdk_config = Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .endpoint_url(endpoint)
            .region(Region::new(config.s3_region.clone()))
            .credentials_provider(credentials)
            .force_path_style(true)
            .build();

        info!(bucket = %bucket, endpoint = %endpoint, "Using S3 storage backend");

        Ok(Self {
            client: Client::from_conf(sdk_config),
            bucket,
            public_base_url: config
                .public_base_url
                .as_ref()
                .map(|u| u.trim_end_matches('/').to_string()),
            url_ttl: config.presign_ttl,
        })
    }

    /// Check connectivity by performing a head bucket operation.
    pub async fn check_connectivity(&self) -> StorageResult<()> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| StorageError::config_error(format!("S3 connectivity check failed: {}", e)))?;
        Ok(())
    }
}

#[async_trait]
impl Storage for S3Storage {
    async fn upload(&self, path: &Path, key: &str) -> StorageResult<()> {
        debug!("Uploading {} to {}", path.display(), key);

        let body = ByteStream::from_path(path)
            .await
            .map_err(|e| StorageError::upload_failed(e.to_string()))?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .content_type(content_type_for(path))
            .send()
            .await
            .map_err(|e| StorageError::upload_failed(e.to_string()))?;

        info!("Uploaded {} to {}", path.display(), key);
        Ok(())
    }

    /// Public buckets get a direct URL; private ones a presigned GET.
    async fn presigned_url(&self, key: &str) -> StorageResult<String> {
        if let Some(base) = &self.public_base_url {
            return Ok(format!("{}/{}", base, key));
        }

        let presign_config = PresigningConfig::expires_in(self.url_ttl)
            .map_err(|e| StorageError::PresignFailed(e.to_string()))?;

        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presign_config)
            .await
            .map_err(|e| StorageError::PresignFailed(e.to_string()))?;

        Ok(presigned.uri().to_string())
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        debug!("Deleting {}", key);

        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StorageError::delete_failed(e.to_string()))?;

        Ok(())
    }

    fn url_ttl(&self) -> Duration {
        self.url_ttl
    }

    fn name(&self) -> &'static str {
        "s3"
    }
}
