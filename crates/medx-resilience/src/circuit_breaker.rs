//! Circuit breaker for unreliable dependencies.
//!
//! Every admitted call is tagged with the breaker generation current at
//! admission. A state change starts a new generation, and results that
//! arrive for an older generation are discarded, so a slow call that
//! started before a trip cannot close or reopen the circuit afterwards.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{ResilienceError, ResilienceResult};

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BreakerState {
    /// Normal operation, all calls admitted
    Closed,
    /// Failing fast, no calls admitted
    Open,
    /// Admitting a bounded number of probe calls
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }

    /// Numeric form for gauges.
    pub fn as_gauge(&self) -> f64 {
        match self {
            BreakerState::Closed => 0.0,
            BreakerState::HalfOpen => 1.0,
            BreakerState::Open => 2.0,
        }
    }
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request counters for the current generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counts {
    pub requests: u32,
    pub total_successes: u32,
    pub total_failures: u32,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
}

impl Counts {
    pub fn failure_ratio(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            self.total_failures as f64 / self.requests as f64
        }
    }

    fn on_request(&mut self) {
        self.requests = self.requests.saturating_add(1);
    }

    fn on_abandoned(&mut self) {
        self.requests = self.requests.saturating_sub(1);
    }

    fn on_success(&mut self) {
        self.total_successes = self.total_successes.saturating_add(1);
        self.consecutive_successes = self.consecutive_successes.saturating_add(1);
        self.consecutive_failures = 0;
    }

    fn on_failure(&mut self) {
        self.total_failures = self.total_failures.saturating_add(1);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.consecutive_successes = 0;
    }
}

/// Observer invoked with `(name, from, to)` on every state change.
pub type StateObserver = Arc<dyn Fn(&str, BreakerState, BreakerState) + Send + Sync>;

/// Circuit breaker configuration.
#[derive(Debug, Clone)]
pub struct BreakerSettings {
    /// Dependency name used in logs and errors
    pub name: String,
    /// Probe calls admitted while half-open, and consecutive probe
    /// successes needed to close
    pub max_requests: u32,
    /// Counting window while closed; zero never resets the counts
    pub interval: Duration,
    /// Time spent open before probing
    pub timeout: Duration,
    /// Consecutive failures that trip the circuit
    pub consecutive_failures: u32,
    /// Minimum requests before the failure ratio is considered
    pub min_requests: u32,
    /// Failure ratio that trips the circuit once `min_requests` is reached
    pub failure_ratio: f64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            max_requests: 1,
            interval: Duration::from_secs(60),
            timeout: Duration::from_secs(60),
            consecutive_failures: 5,
            min_requests: 10,
            failure_ratio: 0.5,
        }
    }
}

impl BreakerSettings {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_max_requests(mut self, max_requests: u32) -> Self {
        self.max_requests = max_requests.max(1);
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_consecutive_failures(mut self, threshold: u32) -> Self {
        self.consecutive_failures = threshold.max(1);
        self
    }

    pub fn with_failure_ratio(mut self, min_requests: u32, ratio: f64) -> Self {
        self.min_requests = min_requests;
        self.failure_ratio = ratio.clamp(0.0, 1.0);
        self
    }

    fn ready_to_trip(&self, counts: &Counts) -> bool {
        counts.consecutive_failures >= self.consecutive_failures
            || (counts.requests >= self.min_requests
                && counts.failure_ratio() >= self.failure_ratio)
    }
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    generation: u64,
    counts: Counts,
    expiry: Option<Instant>,
    half_open_admitted: u32,
}

type Transition = (BreakerState, BreakerState);

/// Circuit breaker guarding a single dependency.
pub struct CircuitBreaker {
    settings: BreakerSettings,
    inner: Mutex<Inner>,
    observer: Option<StateObserver>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("settings", &self.settings)
            .field("inner", &*self.inner.lock())
            .finish()
    }
}

impl CircuitBreaker {
    /// Create a closed breaker.
    pub fn new(settings: BreakerSettings) -> Self {
        let expiry = (!settings.interval.is_zero()).then(|| Instant::now() + settings.interval);
        Self {
            settings,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                generation: 0,
                counts: Counts::default(),
                expiry,
                half_open_admitted: 0,
            }),
            observer: None,
        }
    }

    /// Attach a state-change observer.
    pub fn with_observer(mut self, observer: StateObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    /// Current state, applying any time-based transition that is due.
    pub fn state(&self) -> BreakerState {
        let mut transitions = Vec::new();
        let state = {
            let mut inner = self.inner.lock();
            self.current_state(&mut inner, Instant::now(), &mut transitions)
        };
        self.notify(transitions);
        state
    }

    pub fn counts(&self) -> Counts {
        self.inner.lock().counts
    }

    pub fn generation(&self) -> u64 {
        self.inner.lock().generation
    }

    /// Force the breaker closed and clear its counts.
    pub fn reset(&self) {
        let mut transitions = Vec::new();
        {
            let mut inner = self.inner.lock();
            let now = Instant::now();
            if inner.state == BreakerState::Closed {
                self.new_generation(&mut inner, now);
            } else {
                self.set_state(&mut inner, BreakerState::Closed, now, &mut transitions);
            }
        }
        self.notify(transitions);
    }

    /// Ask for admission. The returned permit is resolved with
    /// [`Permit::record`]; one cancelled or dropped unresolved gives its
    /// slot back without counting either way.
    pub fn allow(&self) -> ResilienceResult<Permit<'_>> {
        let generation = self.before_request()?;
        Ok(Permit {
            breaker: self,
            generation,
            resolved: false,
        })
    }

    /// Run `operation` if admitted. Every error counts as a failure.
    pub async fn call<F, Fut, T, E>(&self, operation: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<ResilienceError>,
    {
        self.call_with(operation, |_| true).await
    }

    /// Run `operation` if admitted, counting only errors for which
    /// `is_failure` holds against the dependency.
    pub async fn call_with<F, Fut, T, E, P>(&self, operation: F, is_failure: P) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<ResilienceError>,
        P: FnOnce(&E) -> bool,
    {
        let permit = self.allow().map_err(E::from)?;
        let result = operation().await;
        let success = match &result {
            Ok(_) => true,
            Err(e) => !is_failure(e),
        };
        permit.record(success);
        result
    }

    fn before_request(&self) -> ResilienceResult<u64> {
        let mut transitions = Vec::new();
        let admitted = {
            let mut inner = self.inner.lock();
            let state = self.current_state(&mut inner, Instant::now(), &mut transitions);

            match state {
                BreakerState::Open => Err(ResilienceError::CircuitOpen(self.settings.name.clone())),
                BreakerState::HalfOpen
                    if inner.half_open_admitted >= self.settings.max_requests =>
                {
                    Err(ResilienceError::TooManyRequests(self.settings.name.clone()))
                }
                state => {
                    if state == BreakerState::HalfOpen {
                        inner.half_open_admitted += 1;
                    }
                    inner.counts.on_request();
                    Ok(inner.generation)
                }
            }
        };
        self.notify(transitions);
        admitted
    }

    fn after_request(&self, generation: u64, success: bool) {
        let mut transitions = Vec::new();
        {
            let mut inner = self.inner.lock();
            let now = Instant::now();
            let state = self.current_state(&mut inner, now, &mut transitions);

            if generation != inner.generation {
                debug!(
                    breaker = %self.settings.name,
                    "Discarding result from stale generation {} (current {})",
                    generation, inner.generation
                );
            } else if success {
                inner.counts.on_success();
                if state == BreakerState::HalfOpen
                    && inner.counts.consecutive_successes >= self.settings.max_requests
                {
                    self.set_state(&mut inner, BreakerState::Closed, now, &mut transitions);
                }
            } else {
                match state {
                    BreakerState::Closed => {
                        inner.counts.on_failure();
                        if self.settings.ready_to_trip(&inner.counts) {
                            self.set_state(&mut inner, BreakerState::Open, now, &mut transitions);
                        }
                    }
                    BreakerState::HalfOpen => {
                        self.set_state(&mut inner, BreakerState::Open, now, &mut transitions);
                    }
                    BreakerState::Open => {}
                }
            }
        }
        self.notify(transitions);
    }

    fn release(&self, generation: u64) {
        let mut transitions = Vec::new();
        {
            let mut inner = self.inner.lock();
            let state = self.current_state(&mut inner, Instant::now(), &mut transitions);
            if generation == inner.generation {
                inner.counts.on_abandoned();
                if state == BreakerState::HalfOpen {
                    inner.half_open_admitted = inner.half_open_admitted.saturating_sub(1);
                }
            }
        }
        self.notify(transitions);
    }

    fn current_state(
        &self,
        inner: &mut Inner,
        now: Instant,
        transitions: &mut Vec<Transition>,
    ) -> BreakerState {
        let expired = inner.expiry.is_some_and(|expiry| expiry <= now);
        match inner.state {
            BreakerState::Closed if expired => self.new_generation(inner, now),
            BreakerState::Open if expired => {
                self.set_state(inner, BreakerState::HalfOpen, now, transitions)
            }
            _ => {}
        }
        inner.state
    }

    fn set_state(
        &self,
        inner: &mut Inner,
        state: BreakerState,
        now: Instant,
        transitions: &mut Vec<Transition>,
    ) {
        if inner.state == state {
            return;
        }
        let previous = inner.state;
        inner.state = state;
        self.new_generation(inner, now);
        transitions.push((previous, state));
    }

    fn new_generation(&self, inner: &mut Inner, now: Instant) {
        inner.generation += 1;
        inner.counts = Counts::default();
        inner.half_open_admitted = 0;
        inner.expiry = match inner.state {
            BreakerState::Closed => {
                (!self.settings.interval.is_zero()).then(|| now + self.settings.interval)
            }
            BreakerState::Open => Some(now + self.settings.timeout),
            BreakerState::HalfOpen => None,
        };
    }

    fn notify(&self, transitions: Vec<Transition>) {
        for (from, to) in transitions {
            warn!(
                breaker = %self.settings.name,
                from = %from,
                to = %to,
                "Circuit breaker state changed"
            );
            if let Some(observer) = &self.observer {
                observer(&self.settings.name, from, to);
            }
        }
    }
}

/// Admission ticket for one call under a specific generation.
#[must_use = "a permit should be resolved with record() or cancel()"]
pub struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    resolved: bool,
}

impl Permit<'_> {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Report the outcome of the admitted call.
    pub fn record(mut self, success: bool) {
        self.resolved = true;
        self.breaker.after_request(self.generation, success);
    }

    /// Give the slot back without an outcome, for calls abandoned before
    /// the dependency answered.
    pub fn cancel(mut self) {
        self.resolved = true;
        self.breaker.release(self.generation);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.resolved {
            self.breaker.release(self.generation);
        }
    }
}
