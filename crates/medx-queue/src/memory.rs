//! In-process broker and job store for tests and single-node runs.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use medx_models::{ExtractionJob, JobId, Lane};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::broker::{Broker, Delivery, EnqueueOutcome};
use crate::config::JOB_RETENTION;
use crate::error::QueueResult;

/// Minimum spacing between sweeps of expired uniqueness keys and records.
const PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// Schedule for write-triggered sweeps of expired state.
#[derive(Debug, Default)]
struct PurgeSchedule {
    next: Option<Instant>,
}

impl PurgeSchedule {
    /// Whether a sweep is due at `now`; arms the next one when it is.
    fn due(&mut self, now: Instant) -> bool {
        if self.next.is_some_and(|at| now < at) {
            return false;
        }
        self.next = Some(now + PURGE_INTERVAL);
        true
    }
}

#[derive(Debug)]
struct Pending {
    delivery: Delivery,
    seq: u64,
    consumer: String,
    delivered_at: Instant,
}

#[derive(Debug, Default)]
struct BrokerState {
    next_seq: u64,
    lanes: HashMap<Lane, VecDeque<(u64, JobId)>>,
    pending: HashMap<String, Pending>,
    unique: HashMap<String, (JobId, Instant)>,
    purge: PurgeSchedule,
}

impl BrokerState {
    fn purge_expired_unique(&mut self, now: Instant) {
        if self.purge.due(now) {
            self.unique.retain(|_, (_, expires_at)| *expires_at > now);
        }
    }

    fn take(&mut self, lane: Lane, consumer: &str, count: usize) -> Vec<Delivery> {
        let now = Instant::now();
        let Some(queue) = self.lanes.get_mut(&lane) else {
            return Vec::new();
        };

        let taken: Vec<(u64, JobId)> = (0..count.max(1)).map_while(|_| queue.pop_front()).collect();
        taken
            .into_iter()
            .map(|(seq, job_id)| {
                let delivery = Delivery {
                    message_id: format!("{}-0", seq),
                    lane,
                    job_id,
                };
                self.pending.insert(
                    delivery.message_id.clone(),
                    Pending {
                        delivery: delivery.clone(),
                        seq,
                        consumer: consumer.to_string(),
                        delivered_at: now,
                    },
                );
                delivery
            })
            .collect()
    }
}

/// [`Broker`] keeping lanes, pending deliveries and uniqueness keys in
/// memory. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryBroker {
    state: Mutex<BrokerState>,
    notify: Notify,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliveries handed out and not yet acknowledged.
    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
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
        let now = Instant::now();
        let message_id = {
            let mut state = self.state.lock();
            state.purge_expired_unique(now);
            if let Some((holder, expires_at)) = state.unique.get(unique_key) {
                if *expires_at > now {
                    return Ok(EnqueueOutcome::Duplicate(holder.clone()));
                }
            }
            state
                .unique
                .insert(unique_key.to_string(), (job_id.clone(), now + window));

            state.next_seq += 1;
            let seq = state.next_seq;
            state.lanes.entry(lane).or_default().push_back((seq, job_id.clone()));
            format!("{}-0", seq)
        };

        self.notify.notify_waiters();
        Ok(EnqueueOutcome::Enqueued { message_id })
    }

    async fn dequeue(
        &self,
        lane: Lane,
        consumer: &str,
        count: usize,
        block: Option<Duration>,
    ) -> QueueResult<Vec<Delivery>> {
        let deadline = block.map(|b| Instant::now() + b);

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let taken = self.state.lock().take(lane, consumer, count);
            if !taken.is_empty() {
                return Ok(taken);
            }
            let Some(deadline) = deadline else {
                return Ok(taken);
            };
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> QueueResult<()> {
        self.state.lock().pending.remove(&delivery.message_id);
        Ok(())
    }

    async fn claim_stale(
        &self,
        lane: Lane,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> QueueResult<Vec<Delivery>> {
        let now = Instant::now();
        let mut state = self.state.lock();

        let mut stale: Vec<&mut Pending> = state
            .pending
            .values_mut()
            .filter(|p| p.delivery.lane == lane && now.duration_since(p.delivered_at) >= min_idle)
            .collect();
        stale.sort_by_key(|p| p.seq);

        Ok(stale
            .into_iter()
            .take(count.max(1))
            .map(|p| {
                p.consumer = consumer.to_string();
                p.delivered_at = now;
                p.delivery.clone()
            })
            .collect())
    }

    async fn release_unique(&self, unique_key: &str, job_id: &JobId) -> QueueResult<bool> {
        let mut state = self.state.lock();
        match state.unique.get(unique_key) {
            Some((holder, _)) if holder == job_id => {
                state.unique.remove(unique_key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn len(&self, lane: Lane) -> QueueResult<u64> {
        let state = self.state.lock();
        let queued = state.lanes.get(&lane).map_or(0, VecDeque::len);
        let pending = state.pending.values().filter(|p| p.delivery.lane == lane).count();
        Ok((queued + pending) as u64)
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[derive(Debug, Default)]
struct StoreState {
    jobs: HashMap<JobId, (ExtractionJob, Instant)>,
    purge: PurgeSchedule,
}

/// [`JobStore`](crate::store::JobStore) in a hash map with retention.
/// Expired records are dropped on lookup and swept on write.
#[derive(Debug)]
pub struct MemoryJobStore {
    state: Mutex<StoreState>,
    retention: Duration,
}

impl Default for MemoryJobStore {
    fn default() -> Self {
        Self::new(JOB_RETENTION)
    }
}

impl MemoryJobStore {
    pub fn new(retention: Duration) -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            retention,
        }
    }

    /// Live records.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.state
            .lock()
            .jobs
            .values()
            .filter(|(_, exp)| *exp > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl crate::store::JobStore for MemoryJobStore {
    async fn save(&self, job: &ExtractionJob) -> QueueResult<()> {
        let now = Instant::now();
        let mut state = self.state.lock();
        if state.purge.due(now) {
            state.jobs.retain(|_, (_, expires_at)| *expires_at > now);
        }
        state
            .jobs
            .insert(job.id.clone(), (job.clone(), now + self.retention));
        Ok(())
    }

    async fn get(&self, id: &JobId) -> QueueResult<Option<ExtractionJob>> {
        let now = Instant::now();
        let mut state = self.state.lock();
        match state.jobs.get(id) {
            Some((job, expires_at)) if *expires_at > now => Ok(Some(job.clone())),
            Some(_) => {
                state.jobs.remove(id);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, id: &JobId) -> QueueResult<bool> {
        Ok(self.state.lock().jobs.remove(id).is_some())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::JobStore;
    use medx_models::ExtractionRequest;
    use std::sync::Arc;

    fn enqueued(outcome: EnqueueOutcome) -> String {
        match outcome {
            EnqueueOutcome::Enqueued { message_id } => message_id,
            other => panic!("expected enqueue, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_uniqueness_window() {
        let broker = MemoryBroker::new();
        let first = JobId::from_string("a");
        let second = JobId::from_string("b");
        let window = Duration::from_secs(300);

        enqueued(broker.enqueue(Lane::Default, &first, "k", window).await.unwrap());
        assert_eq!(
            broker.enqueue(Lane::Default, &second, "k", window).await.unwrap(),
            EnqueueOutcome::Duplicate(first.clone())
        );

        tokio::time::advance(window).await;
        enqueued(broker.enqueue(Lane::Default, &second, "k", window).await.unwrap());
        assert!(!broker.release_unique("k", &first).await.unwrap());
        assert!(broker.release_unique("k", &second).await.unwrap());
    }

    #[tokio::test]
    async fn test_lanes_are_independent_and_ack_clears_pending() {
        let broker = MemoryBroker::new();
        let window = Duration::from_secs(60);
        broker.enqueue(Lane::Low, &JobId::from_string("low"), "1", window).await.unwrap();
        broker.enqueue(Lane::Critical, &JobId::from_string("crit"), "2", window).await.unwrap();

        let got = broker.dequeue(Lane::Critical, "w1", 10, None).await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].job_id.as_str(), "crit");
        assert!(broker.dequeue(Lane::Critical, "w1", 10, None).await.unwrap().is_empty());
        assert_eq!(broker.len(Lane::Low).await.unwrap(), 1);

        assert_eq!(broker.pending_count(), 1);
        broker.ack(&got[0]).await.unwrap();
        assert_eq!(broker.pending_count(), 0);
        assert_eq!(broker.len(Lane::Critical).await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocking_dequeue_wakes_on_enqueue() {
        let broker = Arc::new(MemoryBroker::new());

        let waiter = {
            let broker = Arc::clone(&broker);
            tokio::spawn(async move {
                broker
                    .dequeue(Lane::Default, "w", 1, Some(Duration::from_secs(5)))
                    .await
                    .unwrap()
            })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        broker
            .enqueue(Lane::Default, &JobId::from_string("j"), "k", Duration::from_secs(60))
            .await
            .unwrap();

        let got = waiter.await.unwrap();
        assert_eq!(got.len(), 1);

        let empty = broker
            .dequeue(Lane::Default, "w", 1, Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_claim_stale_redelivers_idle_pending() {
        let broker = MemoryBroker::new();
        broker
            .enqueue(Lane::Default, &JobId::from_string("j"), "k", Duration::from_secs(60))
            .await
            .unwrap();
        let first = broker.dequeue(Lane::Default, "dead", 1, None).await.unwrap();

        let min_idle = Duration::from_secs(120);
        assert!(broker.claim_stale(Lane::Default, "alive", min_idle, 10).await.unwrap().is_empty());

        tokio::time::advance(min_idle).await;
        let claimed = broker.claim_stale(Lane::Default, "alive", min_idle, 10).await.unwrap();
        assert_eq!(claimed, first);
        assert!(broker.claim_stale(Lane::Default, "other", min_idle, 10).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_writes_sweep_expired_state() {
        let broker = MemoryBroker::new();
        let store = MemoryJobStore::new(Duration::from_secs(60));
        let window = Duration::from_secs(60);
        for i in 0..100 {
            let job = ExtractionJob::new(ExtractionRequest::new(format!("https://youtu.be/{}", i)));
            store.save(&job).await.unwrap();
            broker
                .enqueue(Lane::Low, &job.id, &format!("k{}", i), window)
                .await
                .unwrap();
        }
        assert_eq!(store.state.lock().jobs.len(), 100);
        assert_eq!(broker.state.lock().unique.len(), 100);

        tokio::time::advance(Duration::from_secs(3600)).await;
        let fresh = ExtractionJob::new(ExtractionRequest::new("https://youtu.be/fresh"));
        store.save(&fresh).await.unwrap();
        broker
            .enqueue(Lane::Low, &fresh.id, "fresh", window)
            .await
            .unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(store.state.lock().jobs.len(), 1);
        assert_eq!(broker.state.lock().unique.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_store_retention() {
        let store = MemoryJobStore::new(Duration::from_secs(60));
        let job = ExtractionJob::new(ExtractionRequest::new("https://youtu.be/x"));
        store.save(&job).await.unwrap();
        assert_eq!(store.get(&job.id).await.unwrap().unwrap().id, job.id);

        tokio::time::advance(Duration::from_secs(45)).await;
        store.save(&job).await.unwrap();
        tokio::time::advance(Duration::from_secs(45)).await;
        assert!(store.get(&job.id).await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(15)).await;
        assert!(store.get(&job.id).await.unwrap().is_none());
        assert!(store.is_empty());
    }
}
