//! Media metadata and extraction results.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Metadata reported by the extractor for a media URL.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct MediaMetadata {
    pub title: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    /// Seconds
    #[serde(default)]
    pub duration: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uploader: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub upload_date: String,
    #[serde(default)]
    pub view_count: u64,
    #[serde(default)]
    pub like_count: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub thumbnail: String,
    pub platform: String,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
    #[serde(default)]
    pub fps: f64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub video_codec: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub audio_codec: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub formats: Vec<FormatEntry>,
}

/// One format offered by the source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct FormatEntry {
    pub format_id: String,
    pub ext: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub quality: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resolution: String,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
    #[serde(default)]
    pub filesize: u64,
    /// kbit/s
    #[serde(default)]
    pub bitrate: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub vcodec: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub acodec: String,
}

/// Output of a successful extraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ExtractionResult {
    /// Presigned download URL
    pub download_url: String,
    pub filename: String,
    pub size_bytes: u64,
    pub format: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subtitle_urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
    /// When the presigned URL stops working
    pub expires_at: DateTime<Utc>,
}

/// Cached metadata for a URL, keyed by the hash of its canonical form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UrlMetadata {
    pub url: String,
    pub title: String,
    pub duration: u64,
    #[serde(default)]
    pub file_size: u64,
    #[serde(default)]
    pub format: String,
    pub platform: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub thumbnail: String,
    pub cached_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
}

impl UrlMetadata {
    pub fn from_media(url: impl Into<String>, metadata: &MediaMetadata) -> Self {
        let file_size = metadata
            .formats
            .iter()
            .map(|f| f.filesize)
            .max()
            .unwrap_or(0);

        Self {
            url: url.into(),
            title: metadata.title.clone(),
            duration: metadata.duration,
            file_size,
            format: String::new(),
            platform: metadata.platform.clone(),
            thumbnail: metadata.thumbnail.clone(),
            cached_at: Utc::now(),
            download_url: None,
        }
    }

    /// Rebuild the subset of media metadata the pipeline needs.
    pub fn to_media(&self) -> MediaMetadata {
        MediaMetadata {
            title: self.title.clone(),
            duration: self.duration,
            thumbnail: self.thumbnail.clone(),
            platform: self.platform.clone(),
            ..Default::default()
        }
    }
}
