//! Queue configuration.

use std::str::FromStr;
use std::time::Duration;

use medx_models::{sha256_hex, JobId, Lane};

/// How long an identical submission is folded into the existing job.
///
/// A 24 hour window has also been used for this purpose; it keeps
/// returning stale or failed jobs long after the source recovered.
pub const UNIQUE_WINDOW: Duration = Duration::from_secs(5 * 60);

/// How long job records are kept after their last write.
pub const JOB_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Broker and job store implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueBackend {
    #[default]
    Redis,
    Memory,
}

impl FromStr for QueueBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "redis" => Ok(QueueBackend::Redis),
            "memory" | "inmemory" => Ok(QueueBackend::Memory),
            other => Err(format!("unknown queue backend: {}", other)),
        }
    }
}

/// Queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub redis_url: String,
    /// Lane streams are named `{stream_prefix}:{lane}`
    pub stream_prefix: String,
    pub consumer_group: String,
    pub unique_window: Duration,
    pub job_retention: Duration,
    pub backend: QueueBackend,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            stream_prefix: "medx:queue".to_string(),
            consumer_group: "medx:workers".to_string(),
            unique_window: UNIQUE_WINDOW,
            job_retention: JOB_RETENTION,
            backend: QueueBackend::Redis,
        }
    }
}

impl QueueConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            redis_url: std::env::var("REDIS_URL").unwrap_or(defaults.redis_url),
            stream_prefix: std::env::var("QUEUE_STREAM_PREFIX").unwrap_or(defaults.stream_prefix),
            consumer_group: std::env::var("QUEUE_CONSUMER_GROUP").unwrap_or(defaults.consumer_group),
            unique_window: std::env::var("QUEUE_UNIQUE_WINDOW_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.unique_window),
            job_retention: std::env::var("QUEUE_JOB_RETENTION_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.job_retention),
            backend: std::env::var("QUEUE_BACKEND")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.backend),
        }
    }

    pub fn stream_name(&self, lane: Lane) -> String {
        format!("{}:{}", self.stream_prefix, lane)
    }

    /// Uniqueness key for a request dedup key. Hashed to bound key length.
    pub fn unique_key(&self, dedup_key: &str) -> String {
        format!("{}:unique:{}", self.stream_prefix, sha256_hex(dedup_key))
    }

    pub fn job_key(id: &JobId) -> String {
        format!("job:{}", id)
    }
}
