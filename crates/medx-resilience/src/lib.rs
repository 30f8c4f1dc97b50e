//! Resilience and concurrency primitives.
//!
//! This crate provides:
//! - A generation-based circuit breaker
//! - Exponential backoff retry with jitter and error classification
//! - Singleflight request coalescing
//! - A fixed-window per-client rate limiter
//! - A bounded worker pool

pub mod circuit_breaker;
pub mod error;
pub mod failure_tracker;
pub mod pool;
pub mod rate_limit;
pub mod retry;
pub mod singleflight;

pub use circuit_breaker::{BreakerSettings, BreakerState, CircuitBreaker, Counts, Permit};
pub use error::{ResilienceError, ResilienceResult};
pub use failure_tracker::FailureTracker;
pub use pool::WorkerPool;
pub use rate_limit::{RateLimitConfig, RateLimiter};
pub use retry::{classify_message, Classify, ErrorClass, RetryAttempt, RetryPolicy};
pub use singleflight::{Flight, Group};
