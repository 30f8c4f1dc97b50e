//! Retry with exponential backoff and jitter.
//!
//! Provides the retry executor used around calls to unreliable external
//! tools, and the substring classifier that decides which of their
//! errors are worth retrying.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::ResilienceError;

/// How an error should be treated by the retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Timeouts, connection problems, 5xx, rate limiting
    Transient,
    /// Bad input the dependency will never accept
    Permanent,
    /// Refused before reaching the dependency (circuit open, queue full)
    Rejected,
}

impl ErrorClass {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorClass::Transient)
    }
}

/// Errors that know their own retry class.
pub trait Classify {
    fn classify(&self) -> ErrorClass;
}

impl Classify for ResilienceError {
    fn classify(&self) -> ErrorClass {
        if self.is_rejected() {
            ErrorClass::Rejected
        } else {
            ErrorClass::Permanent
        }
    }
}

const TRANSIENT_PATTERNS: &[&str] = &[
    "timeout",
    "timed out",
    "connection reset",
    "connection refused",
    "temporary failure",
    "500",
    "502",
    "503",
    "504",
    "network",
    "dns",
    "429",
    "too many requests",
    "rate limit",
    "rate-limit",
    "ratelimit",
];

const PERMANENT_PATTERNS: &[&str] = &[
    "404",
    "not found",
    "403",
    "forbidden",
    "401",
    "unauthorized",
    "unsupported",
    "private",
    "copyright",
    "unavailable",
    "removed",
    "invalid",
    "malformed",
];

/// Classify an opaque error message from an external tool.
///
/// Transient patterns win over permanent ones; anything unrecognised is
/// treated as transient.
pub fn classify_message(message: &str) -> ErrorClass {
    let message = message.to_lowercase();

    if TRANSIENT_PATTERNS.iter().any(|p| message.contains(p)) {
        return ErrorClass::Transient;
    }
    if PERMANENT_PATTERNS.iter().any(|p| message.contains(p)) {
        return ErrorClass::Permanent;
    }
    ErrorClass::Transient
}

/// Context handed to the retry hook before each backoff sleep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryAttempt {
    /// Attempt that just failed, starting at 1
    pub attempt: u32,
    /// Sleep before the next attempt
    pub delay: Duration,
    /// Total sleep so far, including `delay`
    pub cumulative_delay: Duration,
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Cap on the un-jittered delay.
    pub max_delay: Duration,
    /// Growth factor between retries.
    pub multiplier: f64,
    /// Fraction in [0, 1] of the delay used as uniform +/- noise.
    pub jitter: f64,
    /// Operation name for logging.
    pub operation_name: String,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: 0.3,
            operation_name: "operation".to_string(),
        }
    }
}

impl RetryPolicy {
    /// Create a new policy with the given operation name.
    pub fn new(operation_name: impl Into<String>) -> Self {
        Self {
            operation_name: operation_name.into(),
            ..Default::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier.max(1.0);
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Un-jittered delay after failed attempt `attempt` (1-based):
    /// `min(max_delay, initial_delay * multiplier^(attempt - 1))`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = secs.min(self.max_delay.as_secs_f64());
        if capped.is_finite() && capped > 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            Duration::ZERO
        }
    }

    /// Base delay perturbed by a uniform offset in `[-jitter, +jitter]`
    /// of itself.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt).as_secs_f64();
        let spread = self.jitter.clamp(0.0, 1.0) * base;
        let offset = rand::random::<f64>() * 2.0 * spread - spread;
        Duration::from_secs_f64((base + offset).max(0.0))
    }

    /// Run `operation` until it succeeds, fails permanently, attempts run
    /// out or `token` is cancelled.
    ///
    /// The last error is returned as-is. Cancellation, during an attempt
    /// or a backoff sleep, yields `ResilienceError::Cancelled`.
    pub async fn run<F, Fut, T, E, C>(
        &self,
        token: &CancellationToken,
        classify: C,
        operation: F,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<ResilienceError> + Display,
        C: Fn(&E) -> ErrorClass,
    {
        self.run_observed(token, classify, |_, _| {}, operation).await
    }

    /// Like [`RetryPolicy::run`], calling `on_retry` before every backoff.
    pub async fn run_observed<F, Fut, T, E, C, H>(
        &self,
        token: &CancellationToken,
        classify: C,
        mut on_retry: H,
        mut operation: F,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<ResilienceError> + Display,
        C: Fn(&E) -> ErrorClass,
        H: FnMut(&RetryAttempt, &E),
    {
        let mut attempt = 0u32;
        let mut cumulative_delay = Duration::ZERO;

        loop {
            if token.is_cancelled() {
                return Err(ResilienceError::Cancelled.into());
            }
            attempt += 1;

            let result = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(ResilienceError::Cancelled.into()),
                result = operation() => result,
            };

            let error = match result {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(
                            "{} succeeded on attempt {}",
                            self.operation_name, attempt
                        );
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };

            let class = classify(&error);
            if !class.is_retryable() {
                debug!(
                    "{} failed with {:?} error, not retrying: {}",
                    self.operation_name, class, error
                );
                return Err(error);
            }
            if attempt >= self.max_attempts {
                warn!(
                    "{} failed after {} attempts: {}",
                    self.operation_name, attempt, error
                );
                return Err(error);
            }

            let delay = self.delay_for(attempt);
            cumulative_delay += delay;
            let context = RetryAttempt {
                attempt,
                delay,
                cumulative_delay,
            };
            on_retry(&context, &error);
            warn!(
                "{} attempt {}/{} failed, retrying in {:?}: {}",
                self.operation_name, attempt, self.max_attempts, delay, error
            );

            tokio::select! {
                _ = token.cancelled() => return Err(ResilienceError::Cancelled.into()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, Clone, PartialEq)]
    enum TestError {
        Message(String),
        Resilience(ResilienceError),
    }

    impl Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                TestError::Message(m) => f.write_str(m),
                TestError::Resilience(e) => write!(f, "{}", e),
            }
        }
    }

    impl From<ResilienceError> for TestError {
        fn from(e: ResilienceError) -> Self {
            TestError::Resilience(e)
        }
    }

    fn classify(e: &TestError) -> ErrorClass {
        match e {
            TestError::Message(m) => classify_message(m),
            TestError::Resilience(r) => r.classify(),
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy::new("test")
            .with_max_attempts(4)
            .with_initial_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(250))
    }

    #[test]
    fn test_classify_message() {
        assert_eq!(classify_message("Connection reset by peer"), ErrorClass::Transient);
        assert_eq!(classify_message("HTTP Error 503"), ErrorClass::Transient);
        assert_eq!(classify_message("HTTP Error 429: Too Many Requests"), ErrorClass::Transient);
        assert_eq!(classify_message("HTTP Error 404: Not Found"), ErrorClass::Permanent);
        assert_eq!(classify_message("Private video. Sign in"), ErrorClass::Permanent);
        assert_eq!(classify_message("Unsupported URL"), ErrorClass::Permanent);
        assert_eq!(classify_message("something odd happened"), ErrorClass::Transient);
    }

    #[test]
    fn test_base_delay_growth_and_cap() {
        let policy = policy();
        assert_eq!(policy.base_delay(1), Duration::from_millis(100));
        assert_eq!(policy.base_delay(2), Duration::from_millis(200));
        assert_eq!(policy.base_delay(3), Duration::from_millis(250));
        assert_eq!(policy.base_delay(60), Duration::from_millis(250));

        let mut previous = Duration::ZERO;
        for attempt in 1..10 {
            let delay = policy.base_delay(attempt);
            assert!(delay >= previous);
            previous = delay;
        }
    }

    #[test]
    fn test_jittered_delay_bounds() {
        let policy = policy().with_jitter(0.3);
        let ceiling = Duration::from_millis(250).mul_f64(1.3);
        for attempt in 1..8 {
            for _ in 0..50 {
                let delay = policy.delay_for(attempt);
                assert!(delay <= ceiling, "{:?} exceeds {:?}", delay, ceiling);
                assert!(delay >= policy.base_delay(attempt).mul_f64(0.69));
            }
        }
    }

    #[test]
    fn test_jitter_clamped() {
        assert_eq!(RetryPolicy::new("x").with_jitter(4.0).jitter, 1.0);
        assert_eq!(RetryPolicy::new("x").with_jitter(-1.0).jitter, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_single_attempt() {
        let calls = AtomicU32::new(0);
        let token = CancellationToken::new();

        let result: Result<(), TestError> = policy()
            .run(&token, classify, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(TestError::Message("HTTP Error 404".into())) }
            })
            .await;

        assert_eq!(result, Err(TestError::Message("HTTP Error 404".into())));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_error_not_retried() {
        let calls = AtomicU32::new(0);
        let token = CancellationToken::new();

        let result: Result<(), TestError> = policy()
            .run(&token, classify, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ResilienceError::CircuitOpen("yt-dlp".into()).into()) }
            })
            .await;

        assert!(matches!(
            result,
            Err(TestError::Resilience(ResilienceError::CircuitOpen(_)))
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_error_exhausts_attempts_and_returns_last() {
        let calls = AtomicU32::new(0);
        let token = CancellationToken::new();
        let mut seen = Vec::new();

        let result: Result<(), TestError> = policy()
            .with_jitter(0.0)
            .run_observed(
                &token,
                classify,
                |attempt, _| seen.push(*attempt),
                || {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    async move { Err(TestError::Message(format!("timeout #{}", n))) }
                },
            )
            .await;

        assert_eq!(result, Err(TestError::Message("timeout #4".into())));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0].delay, Duration::from_millis(100));
        assert_eq!(seen[1].delay, Duration::from_millis(200));
        assert_eq!(seen[2].delay, Duration::from_millis(250));
        assert_eq!(seen[2].cumulative_delay, Duration::from_millis(550));
    }

    #[tokio::test(start_paused = true)]
    async fn test_eventual_success() {
        let calls = AtomicU32::new(0);
        let token = CancellationToken::new();

        let result: Result<u32, TestError> = policy()
            .run(&token, classify, || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(TestError::Message("connection refused".into()))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_during_backoff() {
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let result: Result<(), TestError> = policy()
            .with_initial_delay(Duration::from_secs(5))
            .with_max_delay(Duration::from_secs(5))
            .run(&token, classify, || async {
                Err(TestError::Message("timeout".into()))
            })
            .await;

        assert_eq!(result, Err(TestError::Resilience(ResilienceError::Cancelled)));
    }

    #[tokio::test]
    async fn test_already_cancelled_makes_no_attempt() {
        let token = CancellationToken::new();
        token.cancel();
        let calls = AtomicU32::new(0);

        let result: Result<(), TestError> = policy()
            .run(&token, classify, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;

        assert_eq!(result, Err(TestError::Resilience(ResilienceError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
