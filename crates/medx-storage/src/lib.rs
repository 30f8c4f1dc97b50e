//! Object storage for extraction outputs.
//!
//! This crate provides:
//! - The `Storage` capability trait (upload, presigned URL, delete)
//! - An S3-compatible backend (AWS S3, Cloudflare R2, MinIO)
//! - A local filesystem backend
//! - A factory selecting the backend from configuration

pub mod config;
pub mod error;
pub mod keys;
pub mod local;
pub mod s3;
pub mod storage;

pub use config::{create_storage, StorageBackend, StorageConfig};
pub use error::{StorageError, StorageResult};
pub use keys::{content_type_for, generate_key};
pub use local::LocalStorage;
pub use s3::S3Storage;
pub use storage::Storage;
