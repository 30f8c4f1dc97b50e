//! URL metadata cache.
//!
//! Keys are `url:meta:{sha256(canonical url)}` so arbitrary external URLs
//! never end up in storage keys and equivalent URLs share an entry.

use std::collections::HashMap;
use std::sync::Arc;

use medx_models::{canonical_url, sha256_hex, UrlMetadata};
use tracing::debug;

use crate::cache::DistributedCache;
use crate::error::CacheResult;

pub const METADATA_KEY_PREFIX: &str = "url:meta:";

/// Cache key for the metadata of `url`.
pub fn metadata_key(url: &str) -> String {
    format!("{}{}", METADATA_KEY_PREFIX, sha256_hex(&canonical_url(url)))
}

/// Metadata lookups in front of the extractor.
#[derive(Clone)]
pub struct UrlMetadataCache {
    cache: Arc<DistributedCache>,
}

impl UrlMetadataCache {
    pub fn new(cache: Arc<DistributedCache>) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &DistributedCache {
        &self.cache
    }

    pub async fn get(&self, url: &str) -> Option<UrlMetadata> {
        let metadata = self.cache.get::<UrlMetadata>(&metadata_key(url)).await;
        debug!(url = %url, hit = metadata.is_some(), "URL metadata lookup");
        metadata
    }

    pub async fn set(&self, metadata: &UrlMetadata) -> CacheResult<()> {
        self.cache
            .set(
                &metadata_key(&metadata.url),
                metadata,
                self.cache.config().metadata_ttl,
            )
            .await
    }

    /// Entries for the given URLs, keyed by the URL as passed in. URLs
    /// without a cached entry are absent from the map.
    pub async fn get_batch(&self, urls: &[String]) -> HashMap<String, UrlMetadata> {
        let keys: Vec<String> = urls.iter().map(|u| metadata_key(u)).collect();
        let mut found = self.cache.get_batch::<UrlMetadata>(&keys).await;
        urls.iter()
            .zip(&keys)
            .filter_map(|(url, key)| found.remove(key).map(|m| (url.clone(), m)))
            .collect()
    }

    pub async fn set_batch(&self, entries: &[UrlMetadata]) -> CacheResult<()> {
        let keyed: Vec<(String, &UrlMetadata)> = entries
            .iter()
            .map(|m| (metadata_key(&m.url), m))
            .collect();
        self.cache
            .set_batch(&keyed, self.cache.config().metadata_ttl)
            .await
    }

    pub async fn invalidate(&self, url: &str) -> CacheResult<bool> {
        self.cache.delete(&metadata_key(url)).await
    }

    pub async fn invalidate_batch(&self, urls: &[String]) -> CacheResult<u64> {
        let keys: Vec<String> = urls.iter().map(|u| metadata_key(u)).collect();
        self.cache.invalidate_batch(&keys).await
    }

    /// Drop every cached metadata entry.
    pub async fn clear(&self) -> CacheResult<u64> {
        self.cache
            .delete_pattern(&format!("{}*", METADATA_KEY_PREFIX))
            .await
    }

    pub async fn count(&self) -> CacheResult<u64> {
        self.cache
            .count_matching(&format!("{}*", METADATA_KEY_PREFIX))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use std::time::Duration;

    fn metadata(url: &str, title: &str) -> UrlMetadata {
        UrlMetadata {
            url: url.to_string(),
            title: title.to_string(),
            duration: 60,
            file_size: 1024,
            format: "mp4".to_string(),
            platform: "youtube".to_string(),
            thumbnail: String::new(),
            cached_at: chrono::Utc::now(),
            download_url: None,
        }
    }

    fn metadata_cache() -> UrlMetadataCache {
        UrlMetadataCache::new(Arc::new(DistributedCache::in_memory(CacheConfig {
            metadata_ttl: Duration::from_secs(60),
            ..CacheConfig::default()
        })))
    }

    #[test]
    fn test_metadata_key_hashes_canonical_url() {
        let key = metadata_key("https://youtu.be/abc#t=10");
        assert!(key.starts_with(METADATA_KEY_PREFIX));
        assert_eq!(key.len(), METADATA_KEY_PREFIX.len() + 64);
        assert!(!key.contains("youtu"));
        assert_eq!(key, metadata_key(" https://youtu.be/abc "));
        assert_ne!(key, metadata_key("https://youtu.be/abd"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_metadata_round_trip_and_expiry() {
        let cache = metadata_cache();
        cache.set(&metadata("https://youtu.be/abc", "Clip")).await.unwrap();

        let hit = cache.get("https://youtu.be/abc#frag").await.unwrap();
        assert_eq!(hit.title, "Clip");

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(cache.get("https://youtu.be/abc").await.is_none());
    }

    #[tokio::test]
    async fn test_batch_helpers() {
        let cache = metadata_cache();
        cache
            .set_batch(&[
                metadata("https://a.example/1", "one"),
                metadata("https://a.example/2", "two"),
            ])
            .await
            .unwrap();

        let urls = vec![
            "https://a.example/1".to_string(),
            "https://a.example/3".to_string(),
            "https://a.example/2".to_string(),
        ];
        let found = cache.get_batch(&urls).await;
        assert_eq!(found.len(), 2);
        assert_eq!(found["https://a.example/2"].title, "two");

        assert_eq!(cache.count().await.unwrap(), 2);
        assert_eq!(cache.invalidate_batch(&urls[..1]).await.unwrap(), 1);
        assert_eq!(cache.clear().await.unwrap(), 1);
        assert_eq!(cache.count().await.unwrap(), 0);
    }
}
