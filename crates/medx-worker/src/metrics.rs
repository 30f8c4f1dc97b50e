//! Worker metrics.
//!
//! [`WorkerMetrics`] is built by the binary and handed to the server and
//! handler. It keeps its own counters for health reporting and tests and
//! mirrors every event to the `metrics` facade, which is a no-op until a
//! recorder is installed.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use medx_resilience::BreakerState;

use crate::error::{WorkerError, WorkerResult};

/// Metric names as constants for consistency.
pub mod names {
    pub const JOBS_STARTED_TOTAL: &str = "medx_jobs_started_total";
    pub const JOBS_COMPLETED_TOTAL: &str = "medx_jobs_completed_total";
    pub const JOBS_FAILED_TOTAL: &str = "medx_jobs_failed_total";
    pub const JOB_DURATION_SECONDS: &str = "medx_job_duration_seconds";
    pub const OUTPUT_SIZE_BYTES: &str = "medx_output_size_bytes";
    pub const ACTIVE_JOBS: &str = "medx_active_jobs";

    pub const BREAKER_STATE: &str = "medx_circuit_breaker_state";

    pub const CACHE_HITS_TOTAL: &str = "medx_cache_hits_total";
    pub const CACHE_MISSES_TOTAL: &str = "medx_cache_misses_total";

    pub const WEBHOOKS_DELIVERED_TOTAL: &str = "medx_webhooks_delivered_total";
    pub const WEBHOOKS_FAILED_TOTAL: &str = "medx_webhooks_failed_total";
}

/// Install the Prometheus recorder with an HTTP listener on `addr`.
pub fn init_prometheus(addr: SocketAddr) -> WorkerResult<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| WorkerError::config_error(format!("metrics exporter: {}", e)))
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub jobs_started: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub active_jobs: i64,
    pub bytes_uploaded: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub webhooks_delivered: u64,
    pub webhooks_failed: u64,
}

#[derive(Debug, Default)]
pub struct WorkerMetrics {
    jobs_started: AtomicU64,
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,
    active_jobs: AtomicI64,
    bytes_uploaded: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    webhooks_delivered: AtomicU64,
    webhooks_failed: AtomicU64,
}

impl WorkerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            jobs_started: self.jobs_started.load(Ordering::Relaxed),
            jobs_completed: self.jobs_completed.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            active_jobs: self.active_jobs.load(Ordering::Relaxed),
            bytes_uploaded: self.bytes_uploaded.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            webhooks_delivered: self.webhooks_delivered.load(Ordering::Relaxed),
            webhooks_failed: self.webhooks_failed.load(Ordering::Relaxed),
        }
    }

    pub fn job_started(&self, platform: &str) {
        self.jobs_started.fetch_add(1, Ordering::Relaxed);
        let active = self.active_jobs.fetch_add(1, Ordering::Relaxed) + 1;
        counter!(names::JOBS_STARTED_TOTAL, "platform" => platform.to_string()).increment(1);
        gauge!(names::ACTIVE_JOBS).set(active as f64);
    }

    pub fn job_completed(&self, platform: &str, duration: Duration, size_bytes: u64) {
        self.jobs_completed.fetch_add(1, Ordering::Relaxed);
        self.bytes_uploaded.fetch_add(size_bytes, Ordering::Relaxed);
        self.job_finished(platform, duration);
        counter!(names::JOBS_COMPLETED_TOTAL, "platform" => platform.to_string()).increment(1);
        histogram!(names::OUTPUT_SIZE_BYTES, "platform" => platform.to_string())
            .record(size_bytes as f64);
    }

    pub fn job_failed(&self, platform: &str, duration: Duration) {
        self.jobs_failed.fetch_add(1, Ordering::Relaxed);
        self.job_finished(platform, duration);
        counter!(names::JOBS_FAILED_TOTAL, "platform" => platform.to_string()).increment(1);
    }

    /// A started job stopped without reaching a terminal state.
    pub fn job_abandoned(&self) {
        let active = self.active_jobs.fetch_sub(1, Ordering::Relaxed) - 1;
        gauge!(names::ACTIVE_JOBS).set(active as f64);
    }

    fn job_finished(&self, platform: &str, duration: Duration) {
        let active = self.active_jobs.fetch_sub(1, Ordering::Relaxed) - 1;
        gauge!(names::ACTIVE_JOBS).set(active as f64);
        histogram!(names::JOB_DURATION_SECONDS, "platform" => platform.to_string())
            .record(duration.as_secs_f64());
    }

    pub fn cache_lookup(&self, hit: bool) {
        if hit {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            counter!(names::CACHE_HITS_TOTAL).increment(1);
        } else {
            self.cache_misses.fetch_add(1, Ordering::Relaxed);
            counter!(names::CACHE_MISSES_TOTAL).increment(1);
        }
    }

    pub fn breaker_state(&self, dependency: &str, state: BreakerState) {
        gauge!(names::BREAKER_STATE, "dependency" => dependency.to_string()).set(state.as_gauge());
    }

    pub fn webhook(&self, delivered: bool) {
        if delivered {
            self.webhooks_delivered.fetch_add(1, Ordering::Relaxed);
            counter!(names::WEBHOOKS_DELIVERED_TOTAL).increment(1);
        } else {
            self.webhooks_failed.fetch_add(1, Ordering::Relaxed);
            counter!(names::WEBHOOKS_FAILED_TOTAL).increment(1);
        }
    }
}
