//! External tool availability checks.

use std::path::{Path, PathBuf};

use crate::error::{MediaError, MediaResult};

/// Resolve `binary` on `PATH` (or as a path) to an executable.
pub fn check_tool(binary: &Path) -> Option<PathBuf> {
    which::which(binary).ok()
}

/// Check if yt-dlp is available.
pub fn check_ytdlp(binary: &Path) -> MediaResult<PathBuf> {
    check_tool(binary).ok_or_else(|| MediaError::YtDlpNotFound(binary.display().to_string()))
}

/// Check if FFmpeg is available.
pub fn check_ffmpeg(binary: &Path) -> MediaResult<PathBuf> {
    check_tool(binary).ok_or_else(|| MediaError::FfmpegNotFound(binary.display().to_string()))
}
