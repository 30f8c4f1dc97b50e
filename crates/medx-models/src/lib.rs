//! Shared data models for the media extraction backend.
//!
//! This crate provides Serde-serializable types for:
//! - Jobs, their status machine and priority lanes
//! - Extraction requests and results
//! - Media and cached URL metadata
//! - URL canonicalisation and platform detection

pub mod error;
pub mod job;
pub mod lane;
pub mod media;
pub mod request;
pub mod utils;

pub use error::{ModelError, ModelResult};
pub use job::{ExtractionJob, JobId, JobStatus, JobSummary};
pub use lane::Lane;
pub use media::{ExtractionResult, FormatEntry, MediaMetadata, UrlMetadata};
pub use request::ExtractionRequest;
pub use utils::{canonical_url, sha256_hex, Platform};
