//! Extractor configuration.

use std::path::PathBuf;
use std::time::Duration;

use medx_resilience::{BreakerSettings, RetryPolicy};

/// Tool locations, timeouts and resilience knobs for extraction.
#[derive(Debug, Clone)]
pub struct ExtractorConfig {
    pub ytdlp_path: PathBuf,
    pub ffmpeg_path: PathBuf,
    /// Set when `FFMPEG_PATH` is given explicitly, passed on to yt-dlp.
    pub ffmpeg_location: Option<PathBuf>,
    /// Wall-clock limit for a single tool invocation
    pub timeout: Duration,

    pub retry_max_attempts: u32,
    pub retry_initial_delay: Duration,
    pub retry_max_delay: Duration,

    pub breaker_max_requests: u32,
    pub breaker_interval: Duration,
    pub breaker_timeout: Duration,
    pub breaker_consecutive_failures: u32,
    pub breaker_min_requests: u32,
    pub breaker_failure_ratio: f64,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            ytdlp_path: PathBuf::from("yt-dlp"),
            ffmpeg_path: PathBuf::from("ffmpeg"),
            ffmpeg_location: None,
            timeout: Duration::from_secs(600),
            retry_max_attempts: 3,
            retry_initial_delay: Duration::from_millis(500),
            retry_max_delay: Duration::from_secs(10),
            breaker_max_requests: 3,
            breaker_interval: Duration::from_secs(60),
            breaker_timeout: Duration::from_secs(30),
            breaker_consecutive_failures: 5,
            breaker_min_requests: 10,
            breaker_failure_ratio: 0.6,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

impl ExtractorConfig {
    /// Load from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let ffmpeg_location = std::env::var("FFMPEG_PATH")
            .ok()
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);

        Self {
            ytdlp_path: std::env::var("YTDLP_PATH")
                .ok()
                .filter(|s| !s.is_empty())
                .map(PathBuf::from)
                .unwrap_or(defaults.ytdlp_path),
            ffmpeg_path: ffmpeg_location.clone().unwrap_or(defaults.ffmpeg_path),
            ffmpeg_location,
            timeout: env_parse("EXTRACTOR_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            retry_max_attempts: env_parse("YTDLP_RETRY_MAX_ATTEMPTS")
                .unwrap_or(defaults.retry_max_attempts),
            retry_initial_delay: env_parse("YTDLP_RETRY_INITIAL_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_initial_delay),
            retry_max_delay: env_parse("YTDLP_RETRY_MAX_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_max_delay),
            breaker_max_requests: env_parse("YTDLP_BREAKER_MAX_REQUESTS")
                .unwrap_or(defaults.breaker_max_requests),
            breaker_interval: env_parse("YTDLP_BREAKER_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.breaker_interval),
            breaker_timeout: env_parse("YTDLP_BREAKER_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.breaker_timeout),
            breaker_consecutive_failures: env_parse("YTDLP_BREAKER_CONSECUTIVE_FAILURES")
                .unwrap_or(defaults.breaker_consecutive_failures),
            breaker_min_requests: env_parse("YTDLP_BREAKER_MIN_REQUESTS")
                .unwrap_or(defaults.breaker_min_requests),
            breaker_failure_ratio: env_parse("YTDLP_BREAKER_FAILURE_RATIO")
                .unwrap_or(defaults.breaker_failure_ratio),
        }
    }

    /// Circuit breaker settings for the yt-dlp dependency.
    pub fn breaker_settings(&self) -> BreakerSettings {
        BreakerSettings::new("yt-dlp")
            .with_max_requests(self.breaker_max_requests)
            .with_interval(self.breaker_interval)
            .with_timeout(self.breaker_timeout)
            .with_consecutive_failures(self.breaker_consecutive_failures)
            .with_failure_ratio(self.breaker_min_requests, self.breaker_failure_ratio)
    }

    /// Retry policy wrapped around breaker-guarded calls.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new("yt-dlp")
            .with_max_attempts(self.retry_max_attempts)
            .with_initial_delay(self.retry_initial_delay)
            .with_max_delay(self.retry_max_delay)
    }
}
