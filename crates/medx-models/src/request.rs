//! Extraction request parameters.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::lane::Lane;
use crate::utils::canonical_url;

/// Parameters of a media extraction job. Immutable once a job exists.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Validate)]
pub struct ExtractionRequest {
    #[validate(url)]
    pub url: String,
    /// 4k, 1080p, 720p, 480p, best
    #[serde(default)]
    pub quality: String,
    /// mp4, mkv, webm, ...
    #[serde(default)]
    pub format: String,
    #[serde(default)]
    pub extract_audio: bool,
    /// mp3, aac, flac, ...
    #[serde(default)]
    pub audio_format: String,
    /// 128k, 192k, 320k
    #[serde(default)]
    pub audio_bitrate: String,
    #[serde(default)]
    #[validate(length(max = 16))]
    pub subtitles: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cookies_base64: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(url)]
    pub proxy_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(url)]
    pub webhook_url: Option<String>,
}

impl ExtractionRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn with_quality(mut self, quality: impl Into<String>) -> Self {
        self.quality = quality.into();
        self
    }

    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = format.into();
        self
    }

    pub fn with_audio(mut self, audio_format: impl Into<String>) -> Self {
        self.extract_audio = true;
        self.audio_format = audio_format.into();
        self
    }

    pub fn with_webhook(mut self, webhook_url: impl Into<String>) -> Self {
        self.webhook_url = Some(webhook_url.into());
        self
    }

    /// Priority lane for this request.
    pub fn lane(&self) -> Lane {
        Lane::from_quality(&self.quality)
    }

    /// Key identifying requests that must share one execution.
    ///
    /// Built from the canonical URL and the output parameters only, so
    /// requests that differ in cookies, user agent, proxy or webhook
    /// still collide.
    pub fn dedup_key(&self) -> String {
        format!(
            "{}:{}:{}:{}:{}",
            canonical_url(&self.url),
            self.format.to_ascii_lowercase(),
            self.extract_audio,
            self.audio_format.to_ascii_lowercase(),
            self.quality.to_ascii_lowercase(),
        )
    }
}
