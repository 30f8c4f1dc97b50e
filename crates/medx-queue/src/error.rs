//! Queue error types.

use std::sync::Arc;

use medx_models::ModelError;
use medx_resilience::ResilienceError;
use thiserror::Error;

pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Enqueue failed: {0}")]
    EnqueueFailed(String),

    #[error("Dequeue failed: {0}")]
    DequeueFailed(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Rate limit exceeded for {0}")]
    RateLimited(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error(transparent)]
    InvalidTransition(#[from] ModelError),

    /// Failure of a submission shared with other callers
    #[error(transparent)]
    Shared(Arc<QueueError>),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl QueueError {
    pub fn connection_failed(msg: impl Into<String>) -> Self {
        Self::ConnectionFailed(msg.into())
    }

    pub fn enqueue_failed(msg: impl Into<String>) -> Self {
        Self::EnqueueFailed(msg.into())
    }

    pub fn dequeue_failed(msg: impl Into<String>) -> Self {
        Self::DequeueFailed(msg.into())
    }

    /// Admission was refused before any work was attempted.
    pub fn is_rejected(&self) -> bool {
        match self {
            QueueError::RateLimited(_) => true,
            QueueError::Shared(inner) => inner.is_rejected(),
            _ => false,
        }
    }
}

impl From<ResilienceError> for QueueError {
    fn from(err: ResilienceError) -> Self {
        match err {
            ResilienceError::Cancelled => QueueError::Cancelled,
            other => QueueError::Internal(other.to_string()),
        }
    }
}
