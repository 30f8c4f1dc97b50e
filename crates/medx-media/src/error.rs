//! Error types for media operations.

use std::path::PathBuf;

use medx_resilience::{classify_message, Classify, ErrorClass, ResilienceError};
use thiserror::Error;

/// Result type for media operations.
pub type MediaResult<T> = Result<T, MediaError>;

/// Errors that can occur during extraction and transcoding.
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("FFmpeg not found: {0}")]
    FfmpegNotFound(String),

    #[error("yt-dlp not found: {0}")]
    YtDlpNotFound(String),

    #[error("Metadata extraction failed: {message}")]
    ExtractionFailed { message: String },

    #[error("Download failed: {message}")]
    DownloadFailed { message: String },

    #[error("FFmpeg command failed: {message}")]
    FfmpegFailed {
        message: String,
        stderr: Option<String>,
        exit_code: Option<i32>,
    },

    #[error("Downloaded file not found for {0}")]
    OutputNotFound(PathBuf),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Refused before the tool ran (circuit open, probe budget spent)
    #[error("{0}")]
    Rejected(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Operation timed out after {0} seconds")]
    Timeout(u64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl MediaError {
    pub fn extraction_failed(message: impl Into<String>) -> Self {
        Self::ExtractionFailed {
            message: message.into(),
        }
    }

    pub fn download_failed(message: impl Into<String>) -> Self {
        Self::DownloadFailed {
            message: message.into(),
        }
    }

    pub fn ffmpeg_failed(
        message: impl Into<String>,
        stderr: Option<String>,
        exit_code: Option<i32>,
    ) -> Self {
        Self::FfmpegFailed {
            message: message.into(),
            stderr,
            exit_code,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }
}

impl From<ResilienceError> for MediaError {
    fn from(err: ResilienceError) -> Self {
        match err {
            ResilienceError::Cancelled => MediaError::Cancelled,
            e if e.is_rejected() => MediaError::Rejected(e.to_string()),
            e => MediaError::Internal(e.to_string()),
        }
    }
}

impl Classify for MediaError {
    fn classify(&self) -> ErrorClass {
        match self {
            MediaError::Rejected(_) => ErrorClass::Rejected,
            MediaError::Timeout(_) => ErrorClass::Transient,
            MediaError::Cancelled
            | MediaError::FfmpegNotFound(_)
            | MediaError::YtDlpNotFound(_)
            | MediaError::InvalidInput(_)
            | MediaError::OutputNotFound(_) => ErrorClass::Permanent,
            MediaError::FfmpegFailed {
                message, stderr, ..
            } => classify_message(&format!("{} {}", message, stderr.as_deref().unwrap_or(""))),
            other => classify_message(&other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert_eq!(
            MediaError::download_failed("HTTP Error 503: Service Unavailable").classify(),
            ErrorClass::Transient
        );
        assert_eq!(
            MediaError::extraction_failed("ERROR: Private video. Sign in").classify(),
            ErrorClass::Permanent
        );
        assert_eq!(
            MediaError::download_failed("something odd happened").classify(),
            ErrorClass::Transient
        );
        assert_eq!(MediaError::Timeout(600).classify(), ErrorClass::Transient);
        assert_eq!(MediaError::Cancelled.classify(), ErrorClass::Permanent);
    }

    #[test]
    fn test_resilience_errors_map_to_rejection() {
        let err = MediaError::from(ResilienceError::CircuitOpen("yt-dlp".to_string()));
        assert!(matches!(err, MediaError::Rejected(_)));
        assert_eq!(err.classify(), ErrorClass::Rejected);
        assert!(err.to_string().contains("open"));

        assert!(matches!(
            MediaError::from(ResilienceError::Cancelled),
            MediaError::Cancelled
        ));
    }
}
