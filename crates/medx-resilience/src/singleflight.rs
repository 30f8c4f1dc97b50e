//! Singleflight request coalescing.
//!
//! Concurrent calls sharing a key run the operation once. The operation is
//! driven by its own task, so callers can stop waiting without cancelling
//! work other callers still need.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::ResilienceError;

/// Default maximum lifetime of an in-flight marker.
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(5 * 60);

/// Outcome of a coalesced call.
#[derive(Debug, Clone, PartialEq)]
pub struct Flight<T, E> {
    pub result: Result<T, E>,
    /// The caller joined a call started by someone else.
    pub shared: bool,
}

struct Call<T, E> {
    id: u64,
    started: Instant,
    waiters: AtomicUsize,
    tx: watch::Sender<Option<Result<T, E>>>,
}

type CallMap<T, E> = Arc<Mutex<HashMap<String, Arc<Call<T, E>>>>>;

/// Coalesces concurrent calls by key.
pub struct Group<T, E> {
    calls: CallMap<T, E>,
    next_id: AtomicU64,
    max_age: Duration,
}

impl<T, E> Default for Group<T, E> {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_AGE)
    }
}

impl<T, E> Group<T, E> {
    pub fn new(max_age: Duration) -> Self {
        Self {
            calls: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            max_age,
        }
    }

    /// Number of keys with a call in flight.
    pub fn in_flight(&self) -> usize {
        self.calls.lock().len()
    }

    /// Callers currently attached to `key` besides the one that started it.
    pub fn waiters(&self, key: &str) -> Option<usize> {
        self.calls
            .lock()
            .get(key)
            .map(|call| call.waiters.load(Ordering::Relaxed))
    }

    /// Detach `key` so the next caller starts a fresh call. Callers
    /// already waiting still receive the original result.
    pub fn forget(&self, key: &str) {
        self.calls.lock().remove(key);
    }

    /// Drop markers older than the maximum age.
    pub fn sweep_stale(&self) -> usize {
        sweep(&self.calls, self.max_age)
    }
}

impl<T, E> Group<T, E>
where
    T: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    /// Run [`Group::sweep_stale`] every `interval` until `token` fires.
    pub fn spawn_sweeper(&self, interval: Duration, token: CancellationToken) -> JoinHandle<()> {
        let calls = Arc::clone(&self.calls);
        let max_age = self.max_age;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        sweep(&calls, max_age);
                    }
                }
            }
        })
    }
}

impl<T, E> Group<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + From<ResilienceError> + 'static,
{
    /// Run `operation` for `key`, or join the call already in flight.
    pub async fn do_call<F, Fut>(&self, key: &str, operation: F) -> Flight<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        self.do_with_cancel(key, operation, &CancellationToken::new())
            .await
    }

    /// Like [`Group::do_call`], but stop waiting when `token` is
    /// cancelled. The shared operation keeps running.
    pub async fn do_with_cancel<F, Fut>(
        &self,
        key: &str,
        operation: F,
        token: &CancellationToken,
    ) -> Flight<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let (mut rx, shared) = self.join_or_start(key, operation);

        let result = tokio::select! {
            _ = token.cancelled() => Err(E::from(ResilienceError::Cancelled)),
            value = rx.wait_for(Option::is_some) => match value {
                Ok(value) => match value.as_ref() {
                    Some(result) => result.clone(),
                    None => Err(E::from(ResilienceError::Abandoned)),
                },
                Err(_) => Err(E::from(ResilienceError::Abandoned)),
            },
        };

        Flight { result, shared }
    }

    fn join_or_start<F, Fut>(
        &self,
        key: &str,
        operation: F,
    ) -> (watch::Receiver<Option<Result<T, E>>>, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let mut calls = self.calls.lock();
        if let Some(call) = calls.get(key) {
            call.waiters.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, "Joining in-flight call");
            return (call.tx.subscribe(), true);
        }

        let (tx, rx) = watch::channel(None);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let call = Arc::new(Call {
            id,
            started: Instant::now(),
            waiters: AtomicUsize::new(0),
            tx,
        });
        calls.insert(key.to_string(), Arc::clone(&call));

        let future = operation();
        let registry = Arc::clone(&self.calls);
        let key = key.to_string();
        tokio::spawn(async move {
            let result = future.await;
            {
                let mut calls = registry.lock();
                if calls.get(&key).is_some_and(|current| current.id == id) {
                    calls.remove(&key);
                }
            }
            call.tx.send_replace(Some(result));
        });

        (rx, false)
    }
}

fn sweep<T, E>(calls: &Mutex<HashMap<String, Arc<Call<T, E>>>>, max_age: Duration) -> usize {
    let mut calls = calls.lock();
    let before = calls.len();
    calls.retain(|key, call| {
        let keep = call.started.elapsed() < max_age;
        if !keep {
            warn!(key = %key, "Removing stale in-flight call");
        }
        keep
    });
    before - calls.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    type TestGroup = Group<u32, ResilienceError>;

    #[tokio::test]
    async fn test_concurrent_callers_share_one_execution() {
        let group = Arc::new(TestGroup::default());
        let executions = Arc::new(AtomicU32::new(0));
        let (release_tx, release_rx) = watch::channel(false);

        let mut handles = Vec::new();
        for _ in 0..10 {
            let group = Arc::clone(&group);
            let executions = Arc::clone(&executions);
            let mut release = release_rx.clone();
            handles.push(tokio::spawn(async move {
                group
                    .do_call("key", move || async move {
                        executions.fetch_add(1, Ordering::SeqCst);
                        let _ = release.wait_for(|go| *go).await;
                        Ok(7)
                    })
                    .await
            }));
        }

        while group.waiters("key") != Some(9) {
            tokio::task::yield_now().await;
        }
        release_tx.send_replace(true);

        let mut shared = 0;
        for handle in handles {
            let flight = handle.await.unwrap();
            assert_eq!(flight.result, Ok(7));
            if flight.shared {
                shared += 1;
            }
        }

        assert_eq!(executions.load(Ordering::SeqCst), 1);
        assert_eq!(shared, 9);
        assert_eq!(group.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_errors_are_shared_and_key_reexecutes_after_completion() {
        let group = TestGroup::default();

        let first = group
            .do_call("k", || async { Err(ResilienceError::Abandoned) })
            .await;
        assert_eq!(first.result, Err(ResilienceError::Abandoned));
        assert!(!first.shared);

        let second = group.do_call("k", || async { Ok(1) }).await;
        assert_eq!(second.result, Ok(1));
        assert!(!second.shared);
    }

    #[tokio::test]
    async fn test_cancelled_waiter_does_not_cancel_shared_work() {
        let group = Arc::new(TestGroup::default());
        let (release_tx, release_rx) = watch::channel(false);

        let leader = {
            let group = Arc::clone(&group);
            let mut release = release_rx.clone();
            tokio::spawn(async move {
                group
                    .do_call("k", move || async move {
                        let _ = release.wait_for(|go| *go).await;
                        Ok(5)
                    })
                    .await
            })
        };
        while group.in_flight() == 0 {
            tokio::task::yield_now().await;
        }

        let token = CancellationToken::new();
        token.cancel();
        let impatient = group
            .do_with_cancel("k", || async { Ok(99) }, &token)
            .await;
        assert_eq!(impatient.result, Err(ResilienceError::Cancelled));
        assert!(impatient.shared);

        release_tx.send_replace(true);
        let flight = leader.await.unwrap();
        assert_eq!(flight.result, Ok(5));
    }

    #[tokio::test]
    async fn test_leader_cancel_leaves_operation_running() {
        let group = Arc::new(TestGroup::default());
        let (release_tx, release_rx) = watch::channel(false);
        let token = CancellationToken::new();

        let leader = {
            let group = Arc::clone(&group);
            let token = token.clone();
            let mut release = release_rx.clone();
            tokio::spawn(async move {
                group
                    .do_with_cancel(
                        "k",
                        move || async move {
                            let _ = release.wait_for(|go| *go).await;
                            Ok(3)
                        },
                        &token,
                    )
                    .await
            })
        };
        while group.in_flight() == 0 {
            tokio::task::yield_now().await;
        }

        token.cancel();
        assert_eq!(leader.await.unwrap().result, Err(ResilienceError::Cancelled));
        assert_eq!(group.in_flight(), 1);

        let follower = {
            let group = Arc::clone(&group);
            tokio::spawn(async move { group.do_call("k", || async { Ok(0) }).await })
        };
        while group.waiters("k") != Some(1) {
            tokio::task::yield_now().await;
        }
        release_tx.send_replace(true);

        let flight = follower.await.unwrap();
        assert_eq!(flight.result, Ok(3));
        assert!(flight.shared);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_removes_stale_markers() {
        let group = TestGroup::new(Duration::from_secs(300));
        let stuck = CancellationToken::new();
        stuck.cancel();
        let _ = group
            .do_with_cancel("k", || std::future::pending::<Result<u32, ResilienceError>>(), &stuck)
            .await;
        assert_eq!(group.in_flight(), 1);

        tokio::time::advance(Duration::from_secs(100)).await;
        assert_eq!(group.sweep_stale(), 0);

        tokio::time::advance(Duration::from_secs(201)).await;
        assert_eq!(group.sweep_stale(), 1);
        assert_eq!(group.in_flight(), 0);

        let fresh = group.do_call("k", || async { Ok(2) }).await;
        assert_eq!(fresh.result, Ok(2));
    }

    #[tokio::test]
    async fn test_forget_starts_new_call() {
        let group = Arc::new(TestGroup::default());
        let (_hold, hold_rx) = watch::channel(false);
        let mut hold = hold_rx.clone();

        let token = CancellationToken::new();
        token.cancel();
        let _ = group
            .do_with_cancel(
                "k",
                move || async move {
                    let _ = hold.wait_for(|go| *go).await;
                    Ok(1)
                },
                &token,
            )
            .await;
        assert_eq!(group.in_flight(), 1);

        group.forget("k");
        let fresh = group.do_call("k", || async { Ok(2) }).await;
        assert_eq!(fresh.result, Ok(2));
        assert!(!fresh.shared);
    }
}
