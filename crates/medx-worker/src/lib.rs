//! Media extraction worker.
//!
//! This crate provides:
//! - The job server pulling work from weighted priority lanes
//! - The extraction pipeline (metadata, download, post-processing, upload)
//! - Monotonic progress mapping and webhook notification
//! - Injected metrics and temp-file housekeeping

pub mod cleanup;
pub mod config;
pub mod error;
pub mod handler;
pub mod logging;
pub mod metrics;
pub mod progress;
pub mod server;
pub mod webhook;

pub use cleanup::{spawn_temp_sweeper, sweep_temp_dir};
pub use config::{LaneWeights, WebhookConfig, WorkerConfig, MAX_LANE_WEIGHT};
pub use error::{WorkerError, WorkerResult};
pub use handler::{ExtractionHandler, JobHandler, JobOutcome};
pub use logging::JobLogger;
pub use metrics::{init_prometheus, MetricsSnapshot, WorkerMetrics};
pub use progress::{ProgressPhase, ProgressTracker};
pub use server::{lane_order, JobServer};
pub use webhook::WebhookNotifier;
