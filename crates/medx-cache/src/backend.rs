//! Storage seam for the cache.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::CacheResult;

/// Raw string key/value store with expiry.
///
/// Keys arrive fully prefixed; the backend knows nothing about
/// namespacing or value encoding.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> CacheResult<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<()>;

    /// Returns whether the key existed.
    async fn delete(&self, key: &str) -> CacheResult<bool>;

    async fn exists(&self, key: &str) -> CacheResult<bool>;

    /// Remaining lifetime, `None` if the key is missing or never expires.
    async fn ttl(&self, key: &str) -> CacheResult<Option<Duration>>;

    /// Values in key order, in one round trip.
    async fn get_many(&self, keys: &[String]) -> CacheResult<Vec<Option<String>>>;

    /// Store all entries with the same TTL in one round trip.
    async fn set_many(&self, entries: &[(String, String)], ttl: Duration) -> CacheResult<()>;

    /// Returns the number of keys removed.
    async fn delete_many(&self, keys: &[String]) -> CacheResult<u64>;

    /// One page of a cursor-based key scan. A returned cursor of 0 ends
    /// the iteration.
    async fn scan_page(&self, cursor: u64, pattern: &str, count: usize)
        -> CacheResult<(u64, Vec<String>)>;

    /// Human-readable backend name for logs.
    fn name(&self) -> &'static str;
}
