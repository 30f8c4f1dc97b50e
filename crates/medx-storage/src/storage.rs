//! Storage capability interface.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::StorageResult;

/// Where finished downloads are published.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Upload the file at `path` under `key`.
    async fn upload(&self, path: &Path, key: &str) -> StorageResult<()>;

    /// URL a client can fetch `key` from. Valid for [`Storage::url_ttl`].
    async fn presigned_url(&self, key: &str) -> StorageResult<String>;

    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// How long URLs from [`Storage::presigned_url`] stay valid.
    fn url_ttl(&self) -> Duration;

    fn name(&self) -> &'static str;
}
