//! In-process cache backend.
//!
//! Used by tests and single-node development setups. Expiry follows the
//! tokio clock so paused-time tests can drive it.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use regex::Regex;
use tokio::time::Instant;

use crate::backend::CacheBackend;
use crate::error::{CacheError, CacheResult};

/// Minimum spacing between sweeps of expired entries on write.
const PURGE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Instant,
    /// Insertion order; scan cursors point into this sequence.
    seq: u64,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

#[derive(Debug, Default)]
struct State {
    entries: HashMap<String, Entry>,
    next_seq: u64,
    next_purge: Option<Instant>,
}

impl State {
    /// Drop expired entries, at most once per [`PURGE_INTERVAL`].
    fn purge_expired(&mut self, now: Instant) {
        if self.next_purge.is_some_and(|at| now < at) {
            return;
        }
        self.entries.retain(|_, entry| entry.is_live(now));
        self.next_purge = Some(now + PURGE_INTERVAL);
    }

    fn insert(&mut self, key: &str, value: &str, expires_at: Instant) {
        let seq = match self.entries.get(key) {
            Some(existing) => existing.seq,
            None => {
                self.next_seq += 1;
                self.next_seq
            }
        };
        self.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at,
                seq,
            },
        );
    }
}

/// Cache backend kept in a mutex-guarded map.
#[derive(Debug, Default)]
pub struct MemoryCacheBackend {
    state: Mutex<State>,
}

impl MemoryCacheBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live entries, after dropping expired ones.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.entries.retain(|_, entry| entry.is_live(now));
        state.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn live_value(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        let mut state = self.state.lock();
        match state.entries.get(key) {
            Some(entry) if entry.is_live(now) => Some(entry.value.clone()),
            Some(_) => {
                state.entries.remove(key);
                None
            }
            None => None,
        }
    }
}

/// Translate a Redis glob (`*`, `?`, `[...]`) into an anchored regex.
fn glob_to_regex(pattern: &str) -> CacheResult<Regex> {
    let mut expr = String::with_capacity(pattern.len() + 8);
    expr.push('^');
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        match c {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            '[' => {
                expr.push('[');
                for inner in chars.by_ref() {
                    if inner == ']' {
                        break;
                    }
                    if inner == '\\' {
                        expr.push_str("\\\\");
                    } else {
                        expr.push(inner);
                    }
                }
                expr.push(']');
            }
            '\\' => {
                if let Some(escaped) = chars.next() {
                    expr.push_str(&regex::escape(&escaped.to_string()));
                }
            }
            other => expr.push_str(&regex::escape(&other.to_string())),
        }
    }
    expr.push('$');
    Regex::new(&expr).map_err(|e| CacheError::InvalidPattern(format!("{}: {}", pattern, e)))
}

#[async_trait]
impl CacheBackend for MemoryCacheBackend {
    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        Ok(self.live_value(key))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<()> {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.purge_expired(now);
        state.insert(key, value, now + ttl);
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        let now = Instant::now();
        Ok(self
            .state
            .lock()
            .entries
            .remove(key)
            .is_some_and(|entry| entry.is_live(now)))
    }

    async fn exists(&self, key: &str) -> CacheResult<bool> {
        Ok(self.live_value(key).is_some())
    }

    async fn ttl(&self, key: &str) -> CacheResult<Option<Duration>> {
        let now = Instant::now();
        Ok(self
            .state
            .lock()
            .entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.expires_at.duration_since(now)))
    }

    async fn get_many(&self, keys: &[String]) -> CacheResult<Vec<Option<String>>> {
        Ok(keys.iter().map(|key| self.live_value(key)).collect())
    }

    async fn set_many(&self, entries: &[(String, String)], ttl: Duration) -> CacheResult<()> {
        let now = Instant::now();
        let expires_at = now + ttl;
        let mut state = self.state.lock();
        state.purge_expired(now);
        for (key, value) in entries {
            state.insert(key, value, expires_at);
        }
        Ok(())
    }

    async fn delete_many(&self, keys: &[String]) -> CacheResult<u64> {
        let now = Instant::now();
        let mut state = self.state.lock();
        let removed = keys
            .iter()
            .filter_map(|key| state.entries.remove(key))
            .filter(|entry| entry.is_live(now))
            .count();
        Ok(removed as u64)
    }

    /// Pages over keys in insertion order; the cursor is the sequence
    /// number to resume from, so deleting scanned keys skips nothing.
    async fn scan_page(
        &self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> CacheResult<(u64, Vec<String>)> {
        let matcher = glob_to_regex(pattern)?;
        let now = Instant::now();
        let state = self.state.lock();

        let mut remaining: Vec<(&String, &Entry)> = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.seq >= cursor)
            .collect();
        remaining.sort_by_key(|(_, entry)| entry.seq);

        let count = count.max(1);
        let next = match remaining.get(count) {
            Some((_, entry)) => entry.seq,
            None => 0,
        };

        let keys = remaining
            .into_iter()
            .take(count)
            .filter(|(key, entry)| entry.is_live(now) && matcher.is_match(key))
            .map(|(key, _)| key.clone())
            .collect();
        Ok((next, keys))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_to_regex() {
        let re = glob_to_regex("cache:url:meta:*").unwrap();
        assert!(re.is_match("cache:url:meta:abc"));
        assert!(!re.is_match("cache:other"));

        let re = glob_to_regex("k?y.[ab]").unwrap();
        assert!(re.is_match("key.a"));
        assert!(!re.is_match("key.c"));
        assert!(!re.is_match("keyxa"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire() {
        let backend = MemoryCacheBackend::new();
        backend.set("k", "v", Duration::from_secs(10)).await.unwrap();
        assert_eq!(backend.ttl("k").await.unwrap(), Some(Duration::from_secs(10)));

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(backend.get("k").await.unwrap(), None);
        assert!(!backend.exists("k").await.unwrap());
        assert!(backend.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_writes_purge_expired_entries() {
        let backend = MemoryCacheBackend::new();
        for i in 0..100 {
            backend
                .set(&format!("old:{}", i), "v", Duration::from_secs(60))
                .await
                .unwrap();
        }
        assert_eq!(backend.state.lock().entries.len(), 100);

        tokio::time::advance(Duration::from_secs(3600)).await;
        backend.set("fresh", "v", Duration::from_secs(60)).await.unwrap();

        let state = backend.state.lock();
        assert_eq!(state.entries.len(), 1);
        assert!(state.entries.contains_key("fresh"));
    }

    #[tokio::test]
    async fn test_scan_pages_cover_all_keys() {
        let backend = MemoryCacheBackend::new();
        for i in 0..25 {
            backend
                .set(&format!("p:{:02}", i), "v", Duration::from_secs(60))
                .await
                .unwrap();
        }
        backend.set("other", "v", Duration::from_secs(60)).await.unwrap();

        let mut cursor = 0;
        let mut seen = Vec::new();
        let mut pages = 0;
        loop {
            let (next, keys) = backend.scan_page(cursor, "p:*", 10).await.unwrap();
            seen.extend(keys);
            pages += 1;
            if next == 0 {
                break;
            }
            cursor = next;
        }
        assert_eq!(seen.len(), 25);
        assert_eq!(pages, 3);
    }
}
