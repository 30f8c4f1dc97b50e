//! Extractor capability interface.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use medx_models::{ExtractionRequest, MediaMetadata};
use tokio_util::sync::CancellationToken;

use crate::error::MediaResult;

/// Download progress callback, called with 0-100.
pub type ProgressFn = Arc<dyn Fn(u8) + Send + Sync>;

/// Options for a single download.
#[derive(Clone, Default)]
pub struct DownloadOptions {
    pub quality: String,
    pub format: String,
    pub extract_audio: bool,
    pub audio_format: String,
    pub audio_bitrate: String,
    pub subtitles: Vec<String>,
    pub cookies_file: Option<PathBuf>,
    pub user_agent: Option<String>,
    pub proxy_url: Option<String>,
    pub progress: Option<ProgressFn>,
}

impl DownloadOptions {
    /// Options mirroring the output parameters of `request`.
    pub fn from_request(request: &ExtractionRequest) -> Self {
        Self {
            quality: request.quality.clone(),
            format: request.format.clone(),
            extract_audio: request.extract_audio,
            audio_format: request.audio_format.clone(),
            audio_bitrate: request.audio_bitrate.clone(),
            subtitles: request.subtitles.clone(),
            cookies_file: None,
            user_agent: request.user_agent.clone(),
            proxy_url: request.proxy_url.clone(),
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_cookies_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.cookies_file = Some(path.into());
        self
    }

    pub(crate) fn report(&self, percent: u8) {
        if let Some(progress) = &self.progress {
            progress(percent.min(100));
        }
    }
}

impl fmt::Debug for DownloadOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadOptions")
            .field("quality", &self.quality)
            .field("format", &self.format)
            .field("extract_audio", &self.extract_audio)
            .field("audio_format", &self.audio_format)
            .field("subtitles", &self.subtitles)
            .field("cookies_file", &self.cookies_file)
            .field("proxy_url", &self.proxy_url.as_ref().map(|_| "<set>"))
            .finish_non_exhaustive()
    }
}

/// Something that can inspect and download media URLs.
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Fetch metadata without downloading.
    async fn extract_metadata(
        &self,
        url: &str,
        token: &CancellationToken,
    ) -> MediaResult<MediaMetadata>;

    /// Download `url` to the `output` template. Returns metadata when the
    /// tool reports it alongside the download.
    async fn download(
        &self,
        url: &str,
        output: &Path,
        options: &DownloadOptions,
        token: &CancellationToken,
    ) -> MediaResult<Option<MediaMetadata>>;

    fn name(&self) -> &str;
}
