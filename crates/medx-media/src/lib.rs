//! Media extraction and transcoding.
//!
//! This crate provides:
//! - The `Extractor` capability trait and its yt-dlp implementation
//! - FFmpeg format conversion with progress and cancellation
//! - `ResilientExtractor`, applying retry around a circuit breaker
//! - Cookie files, output discovery and tool availability checks

pub mod config;
pub mod cookies;
pub mod error;
pub mod extractor;
pub mod ffmpeg;
pub mod files;
pub(crate) mod process;
pub mod resilient;
pub mod tools;
pub mod ytdlp;

pub use config::ExtractorConfig;
pub use cookies::{write_cookies_file, CookieFile};
pub use error::{MediaError, MediaResult};
pub use extractor::{DownloadOptions, Extractor, ProgressFn};
pub use ffmpeg::{audio_codec_for, can_remux, FfmpegCommand, FfmpegProgress, FfmpegTranscoder, Transcoder};
pub use files::{cleanup_file, find_downloaded_file};
pub use resilient::ResilientExtractor;
pub use tools::{check_ffmpeg, check_tool, check_ytdlp};
pub use ytdlp::YtDlpExtractor;
