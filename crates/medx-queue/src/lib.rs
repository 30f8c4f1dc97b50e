//! Job queue for media extraction.
//!
//! This crate provides:
//! - Job records persisted in a `JobStore` with a retention window
//! - Priority-lane delivery through a `Broker` (Redis Streams or in-memory)
//!   with per-request uniqueness windows
//! - `QueueClient` for submission and status updates
//! - `Submitter`, which rate limits and coalesces concurrent submissions

pub mod broker;
pub mod client;
pub mod config;
pub mod error;
pub mod memory;
pub mod redis_broker;
pub mod store;
pub mod submit;

pub use broker::{Broker, Delivery, EnqueueOutcome};
pub use client::{QueueClient, SubmitReceipt};
pub use config::{QueueBackend, QueueConfig, JOB_RETENTION, UNIQUE_WINDOW};
pub use error::{QueueError, QueueResult};
pub use memory::{MemoryBroker, MemoryJobStore};
pub use redis_broker::RedisBroker;
pub use store::{JobStore, RedisJobStore};
pub use submit::Submitter;
