//! Rate-limited, coalesced submission front for [`QueueClient`].

use std::sync::Arc;
use std::time::Duration;

use medx_models::ExtractionRequest;
use medx_resilience::{Group, RateLimiter, ResilienceError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::client::{QueueClient, SubmitReceipt};
use crate::error::{QueueError, QueueResult};

/// Cadence of the stale in-flight marker sweep.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Clonable error shared by coalesced callers.
#[derive(Debug, Clone)]
struct SharedError(Arc<QueueError>);

impl From<ResilienceError> for SharedError {
    fn from(err: ResilienceError) -> Self {
        SharedError(Arc::new(err.into()))
    }
}

impl From<SharedError> for QueueError {
    fn from(err: SharedError) -> Self {
        match Arc::try_unwrap(err.0) {
            Ok(inner) => inner,
            Err(shared) => QueueError::Shared(shared),
        }
    }
}

/// Guards submission with a per-client rate limit and folds concurrent
/// identical requests into one call to the queue.
///
/// Coalescing covers truly concurrent calls; the broker's uniqueness
/// window covers later repeats.
pub struct Submitter {
    client: Arc<QueueClient>,
    limiter: Arc<RateLimiter>,
    flights: Group<SubmitReceipt, SharedError>,
}

impl Submitter {
    pub fn new(client: Arc<QueueClient>, limiter: Arc<RateLimiter>) -> Self {
        Self {
            client,
            limiter,
            flights: Group::default(),
        }
    }

    pub fn client(&self) -> &Arc<QueueClient> {
        &self.client
    }

    /// Submissions currently executing.
    pub fn in_flight(&self) -> usize {
        self.flights.in_flight()
    }

    /// Submit on behalf of `client_id`. Callers that joined another
    /// caller's submission get a receipt marked duplicate.
    pub async fn submit(
        &self,
        client_id: &str,
        request: ExtractionRequest,
        token: &CancellationToken,
    ) -> QueueResult<SubmitReceipt> {
        if !self.limiter.allow(client_id) {
            warn!(client = %client_id, "Submission rate limited");
            return Err(QueueError::RateLimited(client_id.to_string()));
        }

        let key = request.dedup_key();
        let client = Arc::clone(&self.client);
        let flight = self
            .flights
            .do_with_cancel(
                &key,
                move || async move { client.submit(request).await.map_err(|e| SharedError(Arc::new(e))) },
                token,
            )
            .await;

        let mut receipt = flight.result.map_err(QueueError::from)?;
        if flight.shared {
            debug!(job_id = %receipt.job_id, "Joined in-flight submission");
            receipt.duplicate = true;
        }
        Ok(receipt)
    }

    /// Sweep stale coalescing markers until `token` fires.
    pub fn spawn_sweeper(&self, token: CancellationToken) -> JoinHandle<()> {
        self.flights.spawn_sweeper(SWEEP_INTERVAL, token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, Delivery, EnqueueOutcome};
    use crate::config::QueueConfig;
    use crate::memory::{MemoryBroker, MemoryJobStore};
    use crate::store::JobStore;
    use async_trait::async_trait;
    use medx_models::{JobId, Lane};
    use medx_resilience::RateLimitConfig;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Counts enqueues and holds each one until released.
    struct SlowBroker {
        inner: MemoryBroker,
        enqueues: AtomicU32,
        release: tokio::sync::watch::Receiver<bool>,
    }

    #[async_trait]
    impl Broker for SlowBroker {
        async fn init(&self) -> QueueResult<()> {
            Ok(())
        }

        async fn enqueue(
            &self,
            lane: Lane,
            job_id: &JobId,
            unique_key: &str,
            window: Duration,
        ) -> QueueResult<EnqueueOutcome> {
            self.enqueues.fetch_add(1, Ordering::SeqCst);
            let mut release = self.release.clone();
            let _ = release.wait_for(|go| *go).await;
            self.inner.enqueue(lane, job_id, unique_key, window).await
        }

        async fn dequeue(
            &self,
            lane: Lane,
            consumer: &str,
            count: usize,
            block: Option<Duration>,
        ) -> QueueResult<Vec<Delivery>> {
            self.inner.dequeue(lane, consumer, count, block).await
        }

        async fn ack(&self, delivery: &Delivery) -> QueueResult<()> {
            self.inner.ack(delivery).await
        }

        async fn claim_stale(
            &self,
            lane: Lane,
            consumer: &str,
            min_idle: Duration,
            count: usize,
        ) -> QueueResult<Vec<Delivery>> {
            self.inner.claim_stale(lane, consumer, min_idle, count).await
        }

        async fn release_unique(&self, unique_key: &str, job_id: &JobId) -> QueueResult<bool> {
            self.inner.release_unique(unique_key, job_id).await
        }

        async fn len(&self, lane: Lane) -> QueueResult<u64> {
            self.inner.len(lane).await
        }

        fn name(&self) -> &str {
            "slow"
        }
    }

    fn limiter(requests: u32) -> Arc<RateLimiter> {
        Arc::new(RateLimiter::new(RateLimitConfig {
            requests,
            window: Duration::from_secs(60),
            idle_windows: 10,
        }))
    }

    fn request() -> ExtractionRequest {
        ExtractionRequest::new("https://youtu.be/abc").with_quality("720p")
    }

    #[tokio::test]
    async fn test_concurrent_identical_submissions_share_one_enqueue() {
        let (release_tx, release_rx) = tokio::sync::watch::channel(false);
        let broker = Arc::new(SlowBroker {
            inner: MemoryBroker::new(),
            enqueues: AtomicU32::new(0),
            release: release_rx,
        });
        let store = Arc::new(MemoryJobStore::default());
        let client = Arc::new(QueueClient::new(
            Arc::clone(&broker) as Arc<dyn Broker>,
            Arc::clone(&store) as Arc<dyn JobStore>,
            QueueConfig::default(),
        ));
        let submitter = Arc::new(Submitter::new(client, limiter(100)));

        let mut handles = Vec::new();
        for i in 0..5 {
            let submitter = Arc::clone(&submitter);
            handles.push(tokio::spawn(async move {
                submitter
                    .submit(&format!("client-{}", i), request(), &CancellationToken::new())
                    .await
            }));
        }
        let key = request().dedup_key();
        while broker.enqueues.load(Ordering::SeqCst) == 0 || submitter.flights.waiters(&key) != Some(4) {
            tokio::task::yield_now().await;
        }
        release_tx.send_replace(true);

        let receipts: Vec<SubmitReceipt> = collect_receipts(handles).await;
        assert_eq!(broker.enqueues.load(Ordering::SeqCst), 1);
        assert!(receipts.iter().all(|r| r.job_id == receipts[0].job_id));
        assert_eq!(receipts.iter().filter(|r| r.duplicate).count(), 4);
        assert_eq!(store.len(), 1);
        assert_eq!(submitter.in_flight(), 0);
    }

    async fn collect_receipts(
        handles: Vec<JoinHandle<QueueResult<SubmitReceipt>>>,
    ) -> Vec<SubmitReceipt> {
        let mut receipts = Vec::new();
        for handle in handles {
            receipts.push(handle.await.unwrap().unwrap());
        }
        receipts
    }

    #[tokio::test]
    async fn test_rate_limit_rejects_before_queueing() {
        let broker = Arc::new(MemoryBroker::new());
        let client = Arc::new(QueueClient::new(
            Arc::clone(&broker) as Arc<dyn Broker>,
            Arc::new(MemoryJobStore::default()),
            QueueConfig::default(),
        ));
        let submitter = Submitter::new(client, limiter(2));
        let token = CancellationToken::new();

        submitter.submit("c", request(), &token).await.unwrap();
        let dup = submitter.submit("c", request(), &token).await.unwrap();
        assert!(dup.duplicate);

        let err = submitter.submit("c", request(), &token).await.unwrap_err();
        assert!(err.is_rejected());
        assert!(submitter.submit("other", request(), &token).await.is_ok());
        assert_eq!(broker.len(Lane::Low).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_errors_keep_their_message() {
        let client = Arc::new(QueueClient::new(
            Arc::new(MemoryBroker::new()),
            Arc::new(MemoryJobStore::default()),
            QueueConfig::default(),
        ));
        let submitter = Submitter::new(client, limiter(10));

        let err = submitter
            .submit("c", ExtractionRequest::new("bogus"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("Invalid request"));
        assert!(!err.is_rejected());
    }
}
