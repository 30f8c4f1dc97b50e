//! Scratch directory sweeper.
//!
//! Job directories are removed when a job ends; this catches whatever a
//! crashed or killed worker left behind.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::WorkerResult;

/// Remove entries directly under `dir` last modified more than `max_age`
/// ago. Returns how many were removed.
pub async fn sweep_temp_dir(dir: &Path, max_age: Duration) -> WorkerResult<usize> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    let now = SystemTime::now();
    let mut removed = 0;
    while let Some(entry) = entries.next_entry().await? {
        let metadata = match entry.metadata().await {
            Ok(metadata) => metadata,
            Err(e) => {
                debug!(path = %entry.path().display(), "Skipping unreadable entry: {}", e);
                continue;
            }
        };
        let age = metadata
            .modified()
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .unwrap_or_default();
        if age < max_age {
            continue;
        }

        let path = entry.path();
        let result = if metadata.is_dir() {
            tokio::fs::remove_dir_all(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };
        match result {
            Ok(()) => removed += 1,
            Err(e) => warn!(path = %path.display(), "Failed to remove stale temp entry: {}", e),
        }
    }

    if removed > 0 {
        info!(dir = %dir.display(), removed, "Swept stale temp files");
    }
    Ok(removed)
}

/// Sweep `dir` every `interval` until `token` fires.
pub fn spawn_temp_sweeper(
    dir: PathBuf,
    interval: Duration,
    max_age: Duration,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = sweep_temp_dir(&dir, max_age).await {
                        warn!(dir = %dir.display(), "Temp sweep failed: {}", e);
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sweep_respects_max_age() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("a.part"), b"x").await.unwrap();
        tokio::fs::create_dir(dir.path().join("job-1")).await.unwrap();
        tokio::fs::write(dir.path().join("job-1").join("v.mp4"), b"x").await.unwrap();

        assert_eq!(sweep_temp_dir(dir.path(), Duration::from_secs(3600)).await.unwrap(), 0);
        assert_eq!(sweep_temp_dir(dir.path(), Duration::ZERO).await.unwrap(), 2);
        assert!(!dir.path().join("job-1").exists());
    }

    #[tokio::test]
    async fn test_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert_eq!(sweep_temp_dir(&missing, Duration::ZERO).await.unwrap(), 0);
    }
}
