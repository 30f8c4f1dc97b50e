//! Worker error types.

use thiserror::Error;

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Job failed: {0}")]
    JobFailed(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Webhook delivery failed: {0}")]
    WebhookFailed(String),

    #[error("Job cancelled")]
    Cancelled,

    /// Media errors are already user-readable.
    #[error(transparent)]
    Media(#[from] medx_media::MediaError),

    #[error("Upload failed: {0}")]
    Storage(#[from] medx_storage::StorageError),

    #[error("Queue error: {0}")]
    Queue(#[from] medx_queue::QueueError),

    #[error("Webhook request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkerError {
    pub fn job_failed(msg: impl Into<String>) -> Self {
        Self::JobFailed(msg.into())
    }

    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    pub fn webhook_failed(msg: impl Into<String>) -> Self {
        Self::WebhookFailed(msg.into())
    }

    /// The job was interrupted rather than failed; its delivery should be
    /// left for redelivery.
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            WorkerError::Cancelled
                | WorkerError::Media(medx_media::MediaError::Cancelled)
                | WorkerError::Queue(medx_queue::QueueError::Cancelled)
        )
    }
}
