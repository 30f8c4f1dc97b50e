//! Per-job cookie files for yt-dlp.

use std::io::Write;
use std::path::Path;

use base64::Engine;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::error::{MediaError, MediaResult};

/// A cookie file on disk, removed when dropped.
#[derive(Debug)]
pub struct CookieFile {
    file: NamedTempFile,
}

impl CookieFile {
    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

/// Check that content looks like a Netscape cookie jar.
fn is_valid_netscape_cookies(content: &str) -> bool {
    if content.starts_with("# Netscape HTTP Cookie File") || content.starts_with("# HTTP Cookie File") {
        return true;
    }

    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .any(|line| line.split('\t').count() >= 6)
}

/// Decode `cookies` (base64, or raw Netscape text) and write them to a
/// private file under `dir`.
pub fn write_cookies_file(dir: &Path, cookies: &str) -> MediaResult<CookieFile> {
    let trimmed = cookies.trim();
    let content = match base64::engine::general_purpose::STANDARD.decode(trimmed) {
        Ok(bytes) => String::from_utf8(bytes)
            .map_err(|_| MediaError::InvalidInput("cookies are not valid UTF-8".to_string()))?,
        Err(_) => {
            debug!("Cookies are not base64, using raw content");
            trimmed.to_string()
        }
    };

    if !is_valid_netscape_cookies(&content) {
        warn!("Cookies are not in Netscape format");
        return Err(MediaError::InvalidInput(
            "cookies must be in Netscape cookie file format".to_string(),
        ));
    }

    let mut file = tempfile::Builder::new()
        .prefix("cookies-")
        .suffix(".txt")
        .tempfile_in(dir)?;
    file.write_all(content.as_bytes())?;
    if !content.ends_with('\n') {
        file.write_all(b"\n")?;
    }
    file.flush()?;

    debug!(path = %file.path().display(), "Wrote cookies file");
    Ok(CookieFile { file })
}

#[cfg(test)]
mod tests {
    use super::*;

    const JAR: &str = "# Netscape HTTP Cookie File\n.youtube.com\tTRUE\t/\tTRUE\t0\tSID\tabc\n";

    #[test]
    fn test_netscape_detection() {
        assert!(is_valid_netscape_cookies(JAR));
        assert!(is_valid_netscape_cookies(".x.com\tTRUE\t/\tFALSE\t0\tname\tvalue"));
        assert!(!is_valid_netscape_cookies("session=abc; other=def"));
        assert!(!is_valid_netscape_cookies(""));
    }

    #[test]
    fn test_writes_base64_and_removes_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let encoded = base64::engine::general_purpose::STANDARD.encode(JAR);

        let cookies = write_cookies_file(dir.path(), &encoded).unwrap();
        let path = cookies.path().to_path_buf();
        assert!(path.starts_with(dir.path()));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), JAR);

        drop(cookies);
        assert!(!path.exists());
    }

    #[test]
    fn test_raw_content_accepted_and_garbage_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cookies = write_cookies_file(dir.path(), JAR).unwrap();
        assert!(std::fs::read_to_string(cookies.path()).unwrap().contains("SID"));

        let err = write_cookies_file(dir.path(), "not cookies").unwrap_err();
        assert!(matches!(err, MediaError::InvalidInput(_)));
    }
}
