//! Distributed cache.
//!
//! This crate provides:
//! - A `CacheBackend` trait with Redis and in-memory implementations
//! - `DistributedCache`, a prefixed, typed JSON cache with batch and
//!   cursor-based administrative operations
//! - URL metadata caching keyed by the hash of the canonical URL

pub mod backend;
pub mod cache;
pub mod config;
pub mod error;
pub mod memory;
pub mod metadata;
pub mod redis_backend;

pub use backend::CacheBackend;
pub use cache::{CacheStats, DistributedCache};
pub use config::CacheConfig;
pub use error::{CacheError, CacheResult};
pub use memory::MemoryCacheBackend;
pub use metadata::{metadata_key, UrlMetadataCache, METADATA_KEY_PREFIX};
pub use redis_backend::RedisCacheBackend;
