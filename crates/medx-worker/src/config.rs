//! Worker configuration.

use std::path::PathBuf;
use std::time::Duration;

use medx_models::Lane;
use tracing::warn;
use uuid::Uuid;

use crate::error::{WorkerError, WorkerResult};

/// Largest accepted lane weight.
pub const MAX_LANE_WEIGHT: u32 = 1000;

/// Share of dispatches each lane receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaneWeights {
    pub critical: u32,
    pub default: u32,
    pub low: u32,
}

impl Default for LaneWeights {
    fn default() -> Self {
        Self {
            critical: Lane::Critical.default_weight(),
            default: Lane::Default.default_weight(),
            low: Lane::Low.default_weight(),
        }
    }
}

impl LaneWeights {
    /// Parse `critical=6,default=3,low=1`. Lanes left out keep their
    /// default weight; weights are clamped to `1..=MAX_LANE_WEIGHT` so no
    /// lane starves.
    pub fn parse(raw: &str) -> WorkerResult<Self> {
        let mut weights = Self::default();
        for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (lane, weight) = pair
                .split_once('=')
                .ok_or_else(|| WorkerError::config_error(format!("bad lane weight '{}'", pair)))?;
            let lane: Lane = lane
                .trim()
                .parse()
                .map_err(|_| WorkerError::config_error(format!("unknown lane '{}'", lane.trim())))?;
            let weight: u32 = weight
                .trim()
                .parse()
                .map_err(|_| WorkerError::config_error(format!("bad weight in '{}'", pair)))?;
            let weight = weight.clamp(1, MAX_LANE_WEIGHT);
            match lane {
                Lane::Critical => weights.critical = weight,
                Lane::Default => weights.default = weight,
                Lane::Low => weights.low = weight,
            }
        }
        Ok(weights)
    }

    pub fn weight(&self, lane: Lane) -> u32 {
        match lane {
            Lane::Critical => self.critical,
            Lane::Default => self.default,
            Lane::Low => self.low,
        }
    }
}

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Jobs processed at once
    pub concurrency: usize,
    /// Pool intake queue size
    pub queue_capacity: usize,
    pub lane_weights: LaneWeights,
    /// Scratch space for downloads
    pub work_dir: PathBuf,
    /// Pause between dequeue rounds that found nothing
    pub poll_interval: Duration,
    /// How often to look for deliveries abandoned by dead consumers
    pub claim_interval: Duration,
    /// Idle time before a pending delivery can be claimed. Must exceed
    /// the longest job, or a slow job can be picked up twice.
    pub claim_min_idle: Duration,
    pub shutdown_timeout: Duration,
    /// Scratch files older than this are swept
    pub temp_max_age: Duration,
    pub temp_sweep_interval: Duration,
    /// Consumer name inside the broker's consumer group
    pub consumer_name: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 8,
            queue_capacity: 16,
            lane_weights: LaneWeights::default(),
            work_dir: PathBuf::from("/tmp/medx"),
            poll_interval: Duration::from_millis(500),
            claim_interval: Duration::from_secs(30),
            claim_min_idle: Duration::from_secs(30 * 60),
            shutdown_timeout: Duration::from_secs(30),
            temp_max_age: Duration::from_secs(60 * 60),
            temp_sweep_interval: Duration::from_secs(30 * 60),
            consumer_name: format!("worker-{}", Uuid::new_v4()),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

impl WorkerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let concurrency = env_parse::<usize>("WORKER_CONCURRENCY")
            .unwrap_or(defaults.concurrency)
            .max(1);

        let lane_weights = match std::env::var("WORKER_LANE_WEIGHTS") {
            Ok(raw) => LaneWeights::parse(&raw).unwrap_or_else(|e| {
                warn!("Ignoring WORKER_LANE_WEIGHTS: {}", e);
                LaneWeights::default()
            }),
            Err(_) => LaneWeights::default(),
        };

        Self {
            concurrency,
            queue_capacity: env_parse("WORKER_QUEUE_CAPACITY").unwrap_or(concurrency * 2),
            lane_weights,
            work_dir: std::env::var("WORKER_WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.work_dir),
            poll_interval: env_parse("WORKER_POLL_INTERVAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
            claim_interval: env_parse("WORKER_CLAIM_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.claim_interval),
            claim_min_idle: env_parse("WORKER_CLAIM_MIN_IDLE_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.claim_min_idle),
            shutdown_timeout: env_parse("WORKER_SHUTDOWN_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.shutdown_timeout),
            temp_max_age: env_parse("WORKER_TEMP_MAX_AGE_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.temp_max_age),
            temp_sweep_interval: env_parse("WORKER_TEMP_SWEEP_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.temp_sweep_interval),
            consumer_name: std::env::var("WORKER_CONSUMER_NAME").unwrap_or(defaults.consumer_name),
        }
    }
}

/// Webhook delivery settings.
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub max_attempts: u32,
    /// Per-attempt request timeout
    pub timeout: Duration,
    /// Attempt `n` waits `n * backoff` before the next one
    pub backoff: Duration,
    pub user_agent: String,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            timeout: Duration::from_secs(10),
            backoff: Duration::from_secs(1),
            user_agent: "MediaExtraction-Webhook/1.0".to_string(),
        }
    }
}

impl WebhookConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_attempts: env_parse::<u32>("WEBHOOK_MAX_ATTEMPTS")
                .unwrap_or(defaults.max_attempts)
                .max(1),
            timeout: env_parse("WEBHOOK_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            backoff: env_parse("WEBHOOK_BACKOFF_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.backoff),
            user_agent: std::env::var("WEBHOOK_USER_AGENT").unwrap_or(defaults.user_agent),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lane_weights_parse() {
        let weights = LaneWeights::parse("critical=10, low=0").unwrap();
        assert_eq!(weights.weight(Lane::Critical), 10);
        assert_eq!(weights.weight(Lane::Default), 3);
        assert_eq!(weights.weight(Lane::Low), 1);

        assert!(LaneWeights::parse("urgent=1").is_err());
        assert!(LaneWeights::parse("critical").is_err());
        assert!(LaneWeights::parse("low=x").is_err());
        assert_eq!(LaneWeights::parse("").unwrap(), LaneWeights::default());
    }

    #[test]
    fn test_lane_weights_are_capped() {
        let weights = LaneWeights::parse("critical=4294967295,default=5000").unwrap();
        assert_eq!(weights.weight(Lane::Critical), MAX_LANE_WEIGHT);
        assert_eq!(weights.weight(Lane::Default), MAX_LANE_WEIGHT);
        assert!(LaneWeights::parse("critical=4294967296").is_err());
    }

    #[test]
    fn test_defaults() {
        let config = WorkerConfig::default();
        assert_eq!(config.concurrency, 8);
        assert_eq!(config.queue_capacity, 16);
        assert!(config.consumer_name.starts_with("worker-"));
        assert_eq!(WebhookConfig::default().user_agent, "MediaExtraction-Webhook/1.0");
    }
}
