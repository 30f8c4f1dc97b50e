//! Structured per-job logging.

use std::time::Duration;

use medx_models::{ExtractionJob, Lane};
use tracing::{error, info, warn, Span};

/// Logs one job's lifecycle with the same `job_id`, `lane` and
/// `platform` fields on every line.
#[derive(Debug, Clone)]
pub struct JobLogger {
    job_id: String,
    lane: Lane,
    platform: String,
}

impl JobLogger {
    pub fn new(job: &ExtractionJob, platform: &str) -> Self {
        Self {
            job_id: job.id.to_string(),
            lane: job.request.lane(),
            platform: platform.to_string(),
        }
    }

    pub fn log_start(&self, url: &str) {
        info!(
            job_id = %self.job_id,
            lane = %self.lane,
            platform = %self.platform,
            url = %url,
            "Job started"
        );
    }

    pub fn log_progress(&self, phase: &str, progress: u8) {
        info!(
            job_id = %self.job_id,
            lane = %self.lane,
            phase,
            progress,
            "Job progress"
        );
    }

    pub fn log_warning(&self, message: &str) {
        warn!(
            job_id = %self.job_id,
            lane = %self.lane,
            "Job warning: {}", message
        );
    }

    pub fn log_failure(&self, message: &str, elapsed: Duration) {
        error!(
            job_id = %self.job_id,
            lane = %self.lane,
            platform = %self.platform,
            elapsed_ms = elapsed.as_millis() as u64,
            "Job failed: {}", message
        );
    }

    pub fn log_completion(&self, filename: &str, size_bytes: u64, elapsed: Duration) {
        info!(
            job_id = %self.job_id,
            lane = %self.lane,
            platform = %self.platform,
            filename = %filename,
            size_bytes,
            elapsed_ms = elapsed.as_millis() as u64,
            "Job completed"
        );
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn lane(&self) -> Lane {
        self.lane
    }

    /// Span wrapping the whole pipeline run.
    pub fn create_span(&self) -> Span {
        tracing::info_span!(
            "job",
            job_id = %self.job_id,
            lane = %self.lane,
            platform = %self.platform
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use medx_models::ExtractionRequest;

    #[test]
    fn test_job_logger_fields() {
        let job = ExtractionJob::new(
            ExtractionRequest::new("https://youtu.be/abc").with_quality("4k"),
        );
        let logger = JobLogger::new(&job, "youtube");

        assert_eq!(logger.job_id(), job.id.as_str());
        assert_eq!(logger.lane(), Lane::Critical);
    }
}
