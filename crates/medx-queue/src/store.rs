//! Job record persistence.

use std::time::Duration;

use async_trait::async_trait;
use medx_models::{ExtractionJob, JobId};
use redis::AsyncCommands;
use tracing::debug;

use crate::config::QueueConfig;
use crate::error::{QueueError, QueueResult};

/// Key/value storage of job records.
///
/// Every write refreshes the record's retention.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn save(&self, job: &ExtractionJob) -> QueueResult<()>;

    async fn get(&self, id: &JobId) -> QueueResult<Option<ExtractionJob>>;

    async fn delete(&self, id: &JobId) -> QueueResult<bool>;

    fn name(&self) -> &str;
}

/// Job records as JSON strings under `job:{id}`.
pub struct RedisJobStore {
    client: redis::Client,
    retention: Duration,
}

impl RedisJobStore {
    pub fn new(config: &QueueConfig) -> QueueResult<Self> {
        let client = redis::Client::open(config.redis_url.as_str())
            .map_err(|e| QueueError::connection_failed(e.to_string()))?;
        Ok(Self {
            client,
            retention: config.job_retention,
        })
    }

    async fn connection(&self) -> QueueResult<redis::aio::MultiplexedConnection> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }
}

#[async_trait]
impl JobStore for RedisJobStore {
    async fn save(&self, job: &ExtractionJob) -> QueueResult<()> {
        let mut conn = self.connection().await?;
        let payload = serde_json::to_string(job)?;

        redis::cmd("SET")
            .arg(QueueConfig::job_key(&job.id))
            .arg(payload)
            .arg("PX")
            .arg(self.retention.as_millis() as u64)
            .query_async::<()>(&mut conn)
            .await?;

        debug!(job_id = %job.id, status = %job.status, progress = job.progress, "Saved job");
        Ok(())
    }

    async fn get(&self, id: &JobId) -> QueueResult<Option<ExtractionJob>> {
        let mut conn = self.connection().await?;
        let payload: Option<String> = conn.get(QueueConfig::job_key(id)).await?;
        payload
            .map(|p| serde_json::from_str(&p).map_err(QueueError::from))
            .transpose()
    }

    async fn delete(&self, id: &JobId) -> QueueResult<bool> {
        let mut conn = self.connection().await?;
        let deleted: u64 = conn.del(QueueConfig::job_key(id)).await?;
        Ok(deleted > 0)
    }

    fn name(&self) -> &str {
        "redis"
    }
}
