//! Resilience error types.

use thiserror::Error;

pub type ResilienceResult<T> = Result<T, ResilienceError>;

/// Errors raised by the primitives themselves, never by the wrapped work.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResilienceError {
    #[error("circuit breaker '{0}' is open")]
    CircuitOpen(String),

    #[error("circuit breaker '{0}' is half-open and its probe budget is spent")]
    TooManyRequests(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("shared call ended without producing a result")]
    Abandoned,

    #[error("worker pool queue is full")]
    QueueFull,

    #[error("worker pool is shut down")]
    PoolClosed,

    #[error("timed out waiting for workers to drain")]
    ShutdownTimeout,
}

impl ResilienceError {
    /// Admission was refused before any dependency call was made.
    pub fn is_rejected(&self) -> bool {
        matches!(
            self,
            ResilienceError::CircuitOpen(_)
                | ResilienceError::TooManyRequests(_)
                | ResilienceError::QueueFull
        )
    }
}
