//! Typed, namespaced cache over a [`CacheBackend`].
//!
//! Reads never fail: a backend error or an undecodable value is logged
//! and reported as a miss. Writes surface errors so callers can decide
//! whether they matter.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::backend::CacheBackend;
use crate::config::CacheConfig;
use crate::error::CacheResult;
use crate::memory::MemoryCacheBackend;
use crate::redis_backend::RedisCacheBackend;

/// Hit/miss counters.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Namespaced JSON cache.
pub struct DistributedCache {
    backend: Arc<dyn CacheBackend>,
    config: CacheConfig,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl DistributedCache {
    pub fn new(backend: Arc<dyn CacheBackend>, config: CacheConfig) -> Self {
        Self {
            backend,
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Cache backed by Redis at `config.redis_url`.
    pub fn redis(config: CacheConfig) -> CacheResult<Self> {
        let backend = RedisCacheBackend::new(&config.redis_url)?;
        info!(prefix = %config.prefix, "Using Redis cache backend");
        Ok(Self::new(Arc::new(backend), config))
    }

    /// Cache kept in process memory.
    pub fn in_memory(config: CacheConfig) -> Self {
        Self::new(Arc::new(MemoryCacheBackend::new()), config)
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.config.prefix, key)
    }

    fn record(&self, hit: bool) {
        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn decode<T: DeserializeOwned>(&self, key: &str, raw: &str) -> Option<T> {
        match serde_json::from_str(raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key = %key, error = %e, "Undecodable cache entry, treating as miss");
                None
            }
        }
    }

    /// Fetch and decode `key`. Absent, expired, undecodable and
    /// unreachable all read as `None`.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let full_key = self.full_key(key);
        let value = match self.backend.get(&full_key).await {
            Ok(Some(raw)) => self.decode(&full_key, &raw),
            Ok(None) => None,
            Err(e) => {
                warn!(key = %full_key, error = %e, "Cache read failed, treating as miss");
                None
            }
        };
        self.record(value.is_some());
        value
    }

    pub async fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) -> CacheResult<()> {
        let raw = serde_json::to_string(value)?;
        self.backend.set(&self.full_key(key), &raw, ttl).await
    }

    pub async fn delete(&self, key: &str) -> CacheResult<bool> {
        self.backend.delete(&self.full_key(key)).await
    }

    pub async fn exists(&self, key: &str) -> CacheResult<bool> {
        self.backend.exists(&self.full_key(key)).await
    }

    pub async fn ttl(&self, key: &str) -> CacheResult<Option<Duration>> {
        self.backend.ttl(&self.full_key(key)).await
    }

    /// Fetch many keys in one round trip. Only present entries appear in
    /// the returned map, keyed by the caller's (unprefixed) key.
    pub async fn get_batch<T: DeserializeOwned>(&self, keys: &[String]) -> HashMap<String, T> {
        if keys.is_empty() {
            return HashMap::new();
        }
        let full_keys: Vec<String> = keys.iter().map(|k| self.full_key(k)).collect();
        let values = match self.backend.get_many(&full_keys).await {
            Ok(values) => values,
            Err(e) => {
                warn!(count = keys.len(), error = %e, "Batch cache read failed, treating as misses");
                self.misses.fetch_add(keys.len() as u64, Ordering::Relaxed);
                return HashMap::new();
            }
        };

        let mut found = HashMap::with_capacity(keys.len());
        for ((key, full_key), raw) in keys.iter().zip(&full_keys).zip(values) {
            let value = raw.and_then(|raw| self.decode::<T>(full_key, &raw));
            self.record(value.is_some());
            if let Some(value) = value {
                found.insert(key.clone(), value);
            }
        }
        found
    }

    /// Store many entries in one round trip.
    pub async fn set_batch<T: Serialize>(
        &self,
        entries: &[(String, T)],
        ttl: Duration,
    ) -> CacheResult<()> {
        let encoded = entries
            .iter()
            .map(|(key, value)| Ok((self.full_key(key), serde_json::to_string(value)?)))
            .collect::<CacheResult<Vec<_>>>()?;
        self.backend.set_many(&encoded, ttl).await
    }

    /// Remove many keys in one round trip. Returns the number removed.
    pub async fn invalidate_batch(&self, keys: &[String]) -> CacheResult<u64> {
        let full_keys: Vec<String> = keys.iter().map(|k| self.full_key(k)).collect();
        self.backend.delete_many(&full_keys).await
    }

    /// Delete every key under the prefix matching `pattern`, scanning
    /// incrementally and deleting page by page.
    pub async fn delete_pattern(&self, pattern: &str) -> CacheResult<u64> {
        let full_pattern = self.full_key(pattern);
        let mut cursor = 0u64;
        let mut deleted = 0u64;

        loop {
            let (next, keys) = self
                .backend
                .scan_page(cursor, &full_pattern, self.config.scan_count)
                .await?;
            for batch in keys.chunks(self.config.scan_count.max(1)) {
                deleted += self.backend.delete_many(batch).await?;
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }

        debug!(pattern = %full_pattern, deleted, "Deleted cache keys by pattern");
        Ok(deleted)
    }

    /// Number of keys under the prefix.
    pub async fn count(&self) -> CacheResult<u64> {
        self.count_matching("*").await
    }

    /// Number of keys under the prefix matching `pattern`.
    pub async fn count_matching(&self, pattern: &str) -> CacheResult<u64> {
        let full_pattern = self.full_key(pattern);
        let mut cursor = 0u64;
        let mut total = 0u64;

        loop {
            let (next, keys) = self
                .backend
                .scan_page(cursor, &full_pattern, self.config.scan_count)
                .await?;
            total += keys.len() as u64;
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(total)
    }
}
