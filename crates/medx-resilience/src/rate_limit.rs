//! Fixed-window per-client rate limiting.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Rate limiter settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Requests allowed per client per window.
    pub requests: u32,
    pub window: Duration,
    /// Buckets idle for this many windows are purged.
    pub idle_windows: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests: 100,
            window: Duration::from_secs(60),
            idle_windows: 10,
        }
    }
}

impl RateLimitConfig {
    /// Load from `RATE_LIMIT_REQUESTS`, `RATE_LIMIT_WINDOW_SECS` and
    /// `RATE_LIMIT_IDLE_WINDOWS`, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            requests: std::env::var("RATE_LIMIT_REQUESTS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.requests),
            window: std::env::var("RATE_LIMIT_WINDOW_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.window),
            idle_windows: std::env::var("RATE_LIMIT_IDLE_WINDOWS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.idle_windows),
        }
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: u32,
    last_refill: Instant,
    last_seen: Instant,
}

/// Per-client token buckets refilled to capacity once per window.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Take one token for `client`. Returns `false` when the window's
    /// budget is spent.
    pub fn allow(&self, client: &str) -> bool {
        let now = Instant::now();
        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry(client.to_string()).or_insert_with(|| Bucket {
            tokens: self.config.requests,
            last_refill: now,
            last_seen: now,
        });

        if now.duration_since(bucket.last_refill) >= self.config.window {
            bucket.tokens = self.config.requests;
            bucket.last_refill = now;
        }
        bucket.last_seen = now;

        if bucket.tokens == 0 {
            return false;
        }
        bucket.tokens -= 1;
        true
    }

    /// Tokens left for `client` in the current window.
    pub fn remaining(&self, client: &str) -> u32 {
        let now = Instant::now();
        match self.buckets.lock().get(client) {
            Some(bucket) if now.duration_since(bucket.last_refill) < self.config.window => {
                bucket.tokens
            }
            _ => self.config.requests,
        }
    }

    pub fn tracked_clients(&self) -> usize {
        self.buckets.lock().len()
    }

    /// Drop buckets that have been idle for `idle_windows` windows.
    pub fn purge_idle(&self) -> usize {
        let now = Instant::now();
        let max_idle = self.config.window * self.config.idle_windows;
        let mut buckets = self.buckets.lock();
        let before = buckets.len();
        buckets.retain(|_, bucket| now.duration_since(bucket.last_seen) < max_idle);
        let purged = before - buckets.len();
        if purged > 0 {
            debug!(purged, remaining = buckets.len(), "Purged idle rate limit buckets");
        }
        purged
    }

    /// Purge idle buckets every `interval` until `token` fires or the
    /// limiter is dropped.
    pub fn spawn_cleanup(self: &Arc<Self>, interval: Duration, token: CancellationToken) -> JoinHandle<()> {
        let limiter: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(limiter) = limiter.upgrade() else { break };
                        limiter.purge_idle();
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(requests: u32) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            requests,
            window: Duration::from_secs(60),
            idle_windows: 2,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_is_per_client_and_refills_after_window() {
        let limiter = limiter(3);

        assert!(limiter.allow("a"));
        assert!(limiter.allow("a"));
        assert!(limiter.allow("a"));
        assert!(!limiter.allow("a"));
        assert_eq!(limiter.remaining("a"), 0);

        assert!(limiter.allow("b"));
        assert_eq!(limiter.remaining("b"), 2);

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(!limiter.allow("a"));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(limiter.allow("a"));
        assert_eq!(limiter.remaining("a"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_idle_buckets() {
        let limiter = limiter(1);
        limiter.allow("old");

        tokio::time::advance(Duration::from_secs(90)).await;
        limiter.allow("recent");
        assert_eq!(limiter.purge_idle(), 0);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(limiter.purge_idle(), 1);
        assert_eq!(limiter.tracked_clients(), 1);
        assert_eq!(limiter.remaining("old"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_task_stops_on_cancel() {
        let limiter = Arc::new(limiter(1));
        limiter.allow("client");

        let token = CancellationToken::new();
        let handle = limiter.spawn_cleanup(Duration::from_secs(30), token.clone());

        tokio::time::sleep(Duration::from_secs(150)).await;
        assert_eq!(limiter.tracked_clients(), 0);

        token.cancel();
        handle.await.unwrap();
    }
}
