//! Cache configuration.

use std::time::Duration;

/// Cache configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Redis URL
    pub redis_url: String,
    /// Namespace prepended to every key
    pub prefix: String,
    /// TTL for URL metadata entries
    pub metadata_ttl: Duration,
    /// SCAN page size, also used as the DEL batch size
    pub scan_count: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            prefix: "cache:".to_string(),
            metadata_ttl: Duration::from_secs(24 * 60 * 60),
            scan_count: 100,
        }
    }
}

impl CacheConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            redis_url: std::env::var("REDIS_URL").unwrap_or(defaults.redis_url),
            prefix: std::env::var("CACHE_PREFIX").unwrap_or(defaults.prefix),
            metadata_ttl: std::env::var("CACHE_METADATA_TTL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.metadata_ttl),
            scan_count: std::env::var("CACHE_SCAN_COUNT")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.scan_count),
        }
    }
}
