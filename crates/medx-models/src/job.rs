//! Job definitions and the job status machine.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::{ModelError, ModelResult};
use crate::media::{ExtractionResult, MediaMetadata};
use crate::request::ExtractionRequest;

/// Unique identifier for a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    /// Generate a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Job lifecycle status.
///
/// Legal transitions are `Pending -> Processing -> {Completed | Failed}`.
/// `Processing -> Processing` is allowed for progress writes and for
/// at-least-once redelivery. Nothing leaves a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Job is waiting in its lane
    #[default]
    Pending,
    /// Job is owned by a worker
    Processing,
    /// Job finished and has a result
    Completed,
    /// Job finished with an error
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Whether a write moving the job from `self` to `next` is legal.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Processing, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A media extraction job as persisted in the job store.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ExtractionJob {
    pub id: JobId,
    pub request: ExtractionRequest,
    pub status: JobStatus,
    /// 0-100, never decreases while processing
    pub progress: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MediaMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ExtractionResult>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExtractionJob {
    /// Create a pending job with a fresh id.
    pub fn new(request: ExtractionRequest) -> Self {
        Self::with_id(JobId::new(), request)
    }

    pub fn with_id(id: JobId, request: ExtractionRequest) -> Self {
        let now = Utc::now();
        Self {
            id,
            request,
            status: JobStatus::Pending,
            progress: 0,
            error: None,
            metadata: None,
            result: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Apply a status write.
    ///
    /// Progress is clamped to 100 and never moves backwards. An error
    /// message is only kept when the job fails.
    pub fn apply_status(
        &mut self,
        status: JobStatus,
        progress: u8,
        error: Option<String>,
    ) -> ModelResult<()> {
        self.check_transition(status)?;

        self.status = status;
        self.progress = self.progress.max(progress.min(100));
        self.error = match status {
            JobStatus::Failed => error.or_else(|| Some("unknown error".to_string())),
            _ => None,
        };
        self.touch();
        Ok(())
    }

    /// Record partial metadata while the job is still running.
    pub fn apply_metadata(&mut self, metadata: MediaMetadata) -> ModelResult<()> {
        if self.is_terminal() {
            return Err(ModelError::InvalidTransition {
                from: self.status,
                to: self.status,
            });
        }
        self.metadata = Some(metadata);
        self.touch();
        Ok(())
    }

    /// Mark the job completed with its result.
    pub fn complete(
        &mut self,
        result: ExtractionResult,
        metadata: Option<MediaMetadata>,
    ) -> ModelResult<()> {
        self.check_transition(JobStatus::Completed)?;

        self.status = JobStatus::Completed;
        self.progress = 100;
        self.error = None;
        self.result = Some(result);
        if metadata.is_some() {
            self.metadata = metadata;
        }
        self.touch();
        Ok(())
    }

    fn check_transition(&self, next: JobStatus) -> ModelResult<()> {
        if self.status.can_transition_to(next) {
            Ok(())
        } else {
            Err(ModelError::InvalidTransition {
                from: self.status,
                to: next,
            })
        }
    }

    fn touch(&mut self) {
        let now = Utc::now();
        // updated_at never goes backwards even if the wall clock does
        if now > self.updated_at {
            self.updated_at = now;
        }
    }
}

/// JSON summary of a job sent to webhooks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobSummary {
    pub job_id: String,
    pub status: JobStatus,
    pub url: String,
    pub format: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
}

impl From<&ExtractionJob> for JobSummary {
    fn from(job: &ExtractionJob) -> Self {
        let result = job.result.as_ref();
        let metadata = job.metadata.as_ref();
        Self {
            job_id: job.id.to_string(),
            status: job.status,
            url: job.request.url.clone(),
            format: job.request.format.clone(),
            error: job.error.clone(),
            created_at: job.created_at,
            updated_at: job.updated_at,
            download_url: result.map(|r| r.download_url.clone()),
            size_bytes: result.map(|r| r.size_bytes),
            filename: result.map(|r| r.filename.clone()),
            expires_at: result.map(|r| r.expires_at),
            title: metadata.map(|m| m.title.clone()),
            duration: metadata.map(|m| m.duration),
            platform: metadata.map(|m| m.platform.clone()),
        }
    }
}
