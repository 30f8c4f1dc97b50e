//! Locating and removing downloaded files.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{MediaError, MediaResult};

/// Extensions checked first, in order, for `{id}.{ext}`.
const PREFERRED_EXTENSIONS: &[&str] = &["mp4", "mkv", "webm", "mp3", "m4a"];

/// Partial downloads and sidecar files that are never the primary output.
const IGNORED_EXTENSIONS: &[&str] = &["part", "ytdl", "json", "srt", "vtt", "ass", "lrc"];

/// Find the file yt-dlp produced for `id` in `dir`.
///
/// The final extension depends on merge and post-processing, so a fixed
/// preference list is tried before falling back to the largest `{id}.*`.
pub async fn find_downloaded_file(dir: &Path, id: &str) -> MediaResult<PathBuf> {
    for ext in PREFERRED_EXTENSIONS {
        let candidate = dir.join(format!("{}.{}", id, ext));
        if tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
            return Ok(candidate);
        }
    }

    let prefix = format!("{}.", id);
    let mut best: Option<(u64, PathBuf)> = None;
    let mut entries = tokio::fs::read_dir(dir).await?;

    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.starts_with(&prefix) {
            continue;
        }

        let path = entry.path();
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        if IGNORED_EXTENSIONS.contains(&ext.as_str()) {
            continue;
        }

        let metadata = entry.metadata().await?;
        if !metadata.is_file() {
            continue;
        }
        if best.as_ref().map_or(true, |(size, _)| metadata.len() > *size) {
            best = Some((metadata.len(), path));
        }
    }

    match best {
        Some((size, path)) => {
            debug!(path = %path.display(), size, "Found downloaded file");
            Ok(path)
        }
        None => Err(MediaError::OutputNotFound(dir.join(prefix))),
    }
}

/// Remove a file, ignoring one that is already gone.
pub async fn cleanup_file(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "Removed file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), "Failed to remove file: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_prefers_known_extensions() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("job1.webm"), vec![0u8; 100]).unwrap();
        std::fs::write(dir.path().join("job1.mp4"), b"x").unwrap();

        let found = find_downloaded_file(dir.path(), "job1").await.unwrap();
        assert_eq!(found, dir.path().join("job1.mp4"));
    }

    #[tokio::test]
    async fn test_falls_back_to_largest_non_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("job2.flac"), vec![0u8; 10]).unwrap();
        std::fs::write(dir.path().join("job2.opus"), vec![0u8; 50]).unwrap();
        std::fs::write(dir.path().join("job2.en.vtt"), vec![0u8; 500]).unwrap();
        std::fs::write(dir.path().join("job2.mkv.part"), vec![0u8; 900]).unwrap();
        std::fs::write(dir.path().join("other.avi"), vec![0u8; 900]).unwrap();

        let found = find_downloaded_file(dir.path(), "job2").await.unwrap();
        assert_eq!(found, dir.path().join("job2.opus"));
    }

    #[tokio::test]
    async fn test_missing_output() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("job3.info.json"), b"{}").unwrap();

        let err = find_downloaded_file(dir.path(), "job3").await.unwrap_err();
        assert!(matches!(err, MediaError::OutputNotFound(_)));
    }

    #[tokio::test]
    async fn test_cleanup_file_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.mp4");
        std::fs::write(&path, b"x").unwrap();

        cleanup_file(&path).await;
        assert!(!path.exists());
        cleanup_file(&path).await;
    }
}
