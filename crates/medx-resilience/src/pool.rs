//! Bounded worker pool.
//!
//! A fixed set of workers pulls boxed futures from a bounded queue.
//! `submit` never blocks; `submit_blocking` waits for queue space.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{ResilienceError, ResilienceResult};

type Task = BoxFuture<'static, ()>;

/// Fixed-size pool of async workers fed by a bounded queue.
pub struct WorkerPool {
    name: String,
    size: usize,
    sender: Mutex<Option<mpsc::Sender<Task>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    active: Arc<AtomicUsize>,
}

struct ActiveGuard(Arc<AtomicUsize>);

impl ActiveGuard {
    fn enter(active: &Arc<AtomicUsize>) -> Self {
        active.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(active))
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl WorkerPool {
    /// Start `size` workers over a queue of `queue_capacity` pending tasks.
    pub fn new(name: impl Into<String>, size: usize, queue_capacity: usize) -> Self {
        let name = name.into();
        let size = size.max(1);
        let (tx, rx) = mpsc::channel::<Task>(queue_capacity.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let active = Arc::new(AtomicUsize::new(0));

        let workers = (0..size)
            .map(|worker_id| {
                let rx = Arc::clone(&rx);
                let active = Arc::clone(&active);
                let pool = name.clone();
                tokio::spawn(async move {
                    loop {
                        let task = {
                            let mut rx = rx.lock().await;
                            rx.recv().await
                        };
                        let Some(task) = task else {
                            debug!(pool = %pool, worker_id, "Worker exiting, queue closed");
                            break;
                        };

                        let _guard = ActiveGuard::enter(&active);
                        if AssertUnwindSafe(task).catch_unwind().await.is_err() {
                            error!(pool = %pool, worker_id, "Task panicked");
                        }
                    }
                })
            })
            .collect();

        info!(pool = %name, size, queue_capacity, "Worker pool started");

        Self {
            name,
            size,
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            active,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Tasks currently executing.
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Queue a task without waiting. Returns `false` if the queue is full
    /// or the pool is shut down.
    pub fn submit<F>(&self, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let guard = self.sender.lock();
        match guard.as_ref() {
            Some(sender) => sender.try_send(task.boxed()).is_ok(),
            None => false,
        }
    }

    /// Queue a task, waiting for space until `token` is cancelled.
    pub async fn submit_blocking<F>(&self, task: F, token: &CancellationToken) -> ResilienceResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let sender = self
            .sender
            .lock()
            .clone()
            .ok_or(ResilienceError::PoolClosed)?;

        tokio::select! {
            biased;
            _ = token.cancelled() => Err(ResilienceError::Cancelled),
            sent = sender.send(task.boxed()) => sent.map_err(|_| ResilienceError::PoolClosed),
        }
    }

    /// Stop accepting tasks and wait for queued and running tasks to finish.
    pub async fn shutdown(&self) {
        self.sender.lock().take();
        let workers: Vec<_> = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if let Err(e) = worker.await {
                warn!(pool = %self.name, "Worker task failed: {}", e);
            }
        }
        info!(pool = %self.name, "Worker pool drained");
    }

    /// [`WorkerPool::shutdown`] bounded by `timeout`. Running work is not
    /// aborted when the deadline passes.
    pub async fn shutdown_with_timeout(&self, timeout: Duration) -> ResilienceResult<()> {
        tokio::time::timeout(timeout, self.shutdown())
            .await
            .map_err(|_| {
                warn!(pool = %self.name, ?timeout, "Worker pool did not drain in time");
                ResilienceError::ShutdownTimeout
            })
    }
}
