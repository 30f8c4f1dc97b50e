//! Redis-backed cache tests.
//!
//! Run with `cargo test -p medx-cache -- --ignored` against a live Redis.

use std::collections::HashMap;
use std::time::Duration;

use medx_cache::{CacheConfig, DistributedCache};

fn test_config() -> CacheConfig {
    dotenvy::dotenv().ok();
    CacheConfig {
        prefix: format!("medx-test:{}:", std::process::id()),
        ..CacheConfig::from_env()
    }
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_redis_set_get_and_batch() {
    let cache = DistributedCache::redis(test_config()).expect("Failed to create cache");

    cache
        .set("single", &"value".to_string(), Duration::from_secs(30))
        .await
        .expect("Failed to set");
    assert_eq!(cache.get::<String>("single").await.as_deref(), Some("value"));

    cache
        .set_batch(
            &[("b1".to_string(), 1u32), ("b2".to_string(), 2u32)],
            Duration::from_secs(30),
        )
        .await
        .expect("Failed to set batch");
    let found: HashMap<String, u32> = cache
        .get_batch(&["b1".to_string(), "missing".to_string(), "b2".to_string()])
        .await;
    assert_eq!(found.len(), 2);
    assert_eq!(found["b2"], 2);

    let ttl = cache.ttl("b1").await.expect("Failed to read ttl");
    assert!(ttl.is_some_and(|t| t <= Duration::from_secs(30)));

    assert_eq!(cache.delete_pattern("*").await.expect("Failed to delete"), 3);
    assert_eq!(cache.count().await.expect("Failed to count"), 0);
}
