//! Broker capability interface.

use std::time::Duration;

use async_trait::async_trait;
use medx_models::{JobId, Lane};

use crate::error::QueueResult;

/// One delivery of a job to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Broker message id, used to acknowledge
    pub message_id: String,
    pub lane: Lane,
    pub job_id: JobId,
}

/// Result of an enqueue with a uniqueness window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued { message_id: String },
    /// An identical submission inside the window already holds the key.
    Duplicate(JobId),
}

/// At-least-once task delivery across priority lanes.
///
/// A delivery stays pending until acknowledged; deliveries whose consumer
/// went away are handed out again by [`Broker::claim_stale`].
#[async_trait]
pub trait Broker: Send + Sync {
    /// Prepare streams and consumer groups.
    async fn init(&self) -> QueueResult<()>;

    /// Enqueue `job_id` on `lane` unless `unique_key` is already held.
    /// The key is held for `window` and records the owning job id.
    async fn enqueue(
        &self,
        lane: Lane,
        job_id: &JobId,
        unique_key: &str,
        window: Duration,
    ) -> QueueResult<EnqueueOutcome>;

    /// Take up to `count` new deliveries from `lane`, waiting at most
    /// `block` for one to arrive (`None` returns immediately).
    async fn dequeue(
        &self,
        lane: Lane,
        consumer: &str,
        count: usize,
        block: Option<Duration>,
    ) -> QueueResult<Vec<Delivery>>;

    /// Acknowledge and drop a delivery.
    async fn ack(&self, delivery: &Delivery) -> QueueResult<()>;

    /// Reassign deliveries idle for at least `min_idle` to `consumer`.
    async fn claim_stale(
        &self,
        lane: Lane,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> QueueResult<Vec<Delivery>>;

    /// Release `unique_key` if `job_id` still holds it.
    async fn release_unique(&self, unique_key: &str, job_id: &JobId) -> QueueResult<bool>;

    /// Deliveries waiting on `lane`, pending ones included.
    async fn len(&self, lane: Lane) -> QueueResult<u64>;

    fn name(&self) -> &str;
}
