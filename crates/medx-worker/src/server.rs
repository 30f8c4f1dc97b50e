//! Job server: pulls deliveries from the priority lanes and runs them on
//! a bounded worker pool.

use std::sync::Arc;

use medx_models::Lane;
use medx_queue::{Broker, Delivery, QueueClient};
use medx_resilience::{FailureTracker, WorkerPool};
use rand::Rng;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{LaneWeights, WorkerConfig};
use crate::error::WorkerResult;
use crate::handler::JobHandler;

/// Consecutive dequeue failures logged before going quiet.
const MAX_LOGGED_FAILURES: u32 = 3;

/// Deliveries taken per claim round.
const CLAIM_BATCH: usize = 5;

/// Dispatches deliveries to a [`JobHandler`].
///
/// A semaphore sized to the worker count gates dequeueing, so a delivery
/// is only taken from the broker once a worker is free to run it. Each
/// round polls the lanes in a weighted random order: heavier lanes are
/// usually asked first, lighter lanes still get served.
pub struct JobServer {
    config: WorkerConfig,
    client: Arc<QueueClient>,
    handler: Arc<dyn JobHandler>,
    slots: Arc<Semaphore>,
    slot_count: u32,
}

impl JobServer {
    pub fn new(config: WorkerConfig, client: Arc<QueueClient>, handler: Arc<dyn JobHandler>) -> Self {
        let slot_count = config.concurrency.max(1) as u32;
        Self {
            config,
            client,
            handler,
            slots: Arc::new(Semaphore::new(slot_count as usize)),
            slot_count,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Serve until `shutdown` fires, then drain in-flight jobs.
    ///
    /// Jobs get their own token, cancelled only when draining exceeds
    /// the shutdown timeout; their deliveries are then left unacked for
    /// redelivery.
    pub async fn run(&self, shutdown: CancellationToken) -> WorkerResult<()> {
        self.client.broker().init().await?;

        let pool = Arc::new(WorkerPool::new(
            "extraction",
            self.config.concurrency,
            self.config.queue_capacity,
        ));
        let jobs_token = CancellationToken::new();

        info!(
            consumer = %self.config.consumer_name,
            concurrency = self.config.concurrency,
            broker = self.client.broker().name(),
            "Job server started"
        );

        let claim_task = self.spawn_claimer(Arc::clone(&pool), shutdown.clone(), jobs_token.clone());
        self.dispatch_loop(&pool, &shutdown, &jobs_token).await;

        info!("Shutdown signal received, stopping job server");
        claim_task.abort();

        if pool.shutdown_with_timeout(self.config.shutdown_timeout).await.is_err() {
            warn!("In-flight jobs did not finish in time, cancelling them");
            jobs_token.cancel();
            let drained = tokio::time::timeout(
                self.config.shutdown_timeout,
                self.slots.acquire_many(self.slot_count),
            )
            .await;
            if drained.is_err() {
                warn!("Cancelled jobs are still running");
            }
        }

        info!("Job server stopped");
        Ok(())
    }

    async fn dispatch_loop(
        &self,
        pool: &Arc<WorkerPool>,
        shutdown: &CancellationToken,
        jobs_token: &CancellationToken,
    ) {
        let mut failures = FailureTracker::new("dequeue", MAX_LOGGED_FAILURES);

        loop {
            let permit = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return,
                permit = Arc::clone(&self.slots).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return,
                },
            };

            match self.next_delivery(&mut failures).await {
                Some(delivery) => {
                    self.dispatch(pool, delivery, permit, jobs_token, shutdown).await;
                }
                None => {
                    drop(permit);
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
            }
        }
    }

    /// One delivery from the first lane, in weighted order, that has one.
    async fn next_delivery(&self, failures: &mut FailureTracker) -> Option<Delivery> {
        let broker = self.client.broker();
        let mut errored = false;
        let order = lane_order(&self.config.lane_weights, &mut rand::rng());

        for lane in order {
            match broker
                .dequeue(lane, &self.config.consumer_name, 1, None)
                .await
            {
                Ok(mut deliveries) => {
                    if let Some(delivery) = deliveries.pop() {
                        failures.record_success();
                        return Some(delivery);
                    }
                }
                Err(e) => {
                    errored = true;
                    if failures.record_failure() {
                        error!(lane = %lane, "Failed to dequeue: {}", e);
                    }
                }
            }
        }

        if !errored {
            failures.record_success();
        }
        None
    }

    async fn dispatch(
        &self,
        pool: &WorkerPool,
        delivery: Delivery,
        permit: OwnedSemaphorePermit,
        jobs_token: &CancellationToken,
        shutdown: &CancellationToken,
    ) {
        debug!(job_id = %delivery.job_id, lane = %delivery.lane, "Dispatching job");
        let task = process(
            Arc::clone(&self.handler),
            Arc::clone(self.client.broker()),
            delivery.clone(),
            permit,
            jobs_token.clone(),
        );
        if let Err(e) = pool.submit_blocking(task, shutdown).await {
            // Left pending; claim_stale hands it out again.
            warn!(job_id = %delivery.job_id, "Could not dispatch job: {}", e);
        }
    }

    /// Periodically take over deliveries whose consumer stopped
    /// acknowledging them.
    fn spawn_claimer(
        &self,
        pool: Arc<WorkerPool>,
        shutdown: CancellationToken,
        jobs_token: CancellationToken,
    ) -> JoinHandle<()> {
        let broker = Arc::clone(self.client.broker());
        let handler = Arc::clone(&self.handler);
        let slots = Arc::clone(&self.slots);
        let config = self.config.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.claim_interval);
            let mut failures = FailureTracker::new("claim", MAX_LOGGED_FAILURES);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                for lane in Lane::ALL {
                    let available = slots.available_permits().min(CLAIM_BATCH);
                    if available == 0 {
                        break;
                    }
                    let claimed = match broker
                        .claim_stale(lane, &config.consumer_name, config.claim_min_idle, available)
                        .await
                    {
                        Ok(claimed) => {
                            failures.record_success();
                            claimed
                        }
                        Err(e) => {
                            if failures.record_failure() {
                                warn!(lane = %lane, "Failed to claim stale jobs: {}", e);
                            }
                            continue;
                        }
                    };
                    if !claimed.is_empty() {
                        info!(lane = %lane, count = claimed.len(), "Claimed stale jobs");
                    }

                    for delivery in claimed {
                        let Ok(permit) = Arc::clone(&slots).acquire_owned().await else {
                            return;
                        };
                        let task = process(
                            Arc::clone(&handler),
                            Arc::clone(&broker),
                            delivery,
                            permit,
                            jobs_token.clone(),
                        );
                        if pool.submit_blocking(task, &shutdown).await.is_err() {
                            return;
                        }
                    }
                }
            }
        })
    }
}

async fn process(
    handler: Arc<dyn JobHandler>,
    broker: Arc<dyn Broker>,
    delivery: Delivery,
    permit: OwnedSemaphorePermit,
    token: CancellationToken,
) {
    let _permit = permit;
    let outcome = handler.handle(&delivery.job_id, &token).await;
    debug!(job_id = %delivery.job_id, ?outcome, "Job handled");

    if outcome.should_ack() {
        if let Err(e) = broker.ack(&delivery).await {
            error!(job_id = %delivery.job_id, "Failed to ack job: {}", e);
        }
    }
}

/// All lanes, ordered by weighted sampling without replacement.
pub fn lane_order<R: Rng + ?Sized>(weights: &LaneWeights, rng: &mut R) -> Vec<Lane> {
    let mut remaining: Vec<(Lane, u64)> = Lane::ALL
        .iter()
        .map(|&lane| (lane, u64::from(weights.weight(lane).max(1))))
        .collect();
    let mut order = Vec::with_capacity(remaining.len());

    while !remaining.is_empty() {
        let total: u64 = remaining.iter().map(|(_, w)| w).sum();
        let mut pick = rng.random_range(0..total);
        let index = remaining
            .iter()
            .position(|&(_, weight)| {
                if pick < weight {
                    true
                } else {
                    pick -= weight;
                    false
                }
            })
            .unwrap_or(remaining.len() - 1);
        order.push(remaining.remove(index).0);
    }
    order
}
