//! Utility functions for URL handling.
//!
//! Shared by the cache (key derivation), the queue (dedup keys) and the
//! worker (platform labels).

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use url::Url;

/// Canonical form of a media URL.
///
/// Scheme and host are lowercased, default ports and fragments dropped,
/// and an empty query removed. Unparseable input is returned trimmed.
pub fn canonical_url(raw: &str) -> String {
    let raw = raw.trim();
    match Url::parse(raw) {
        Ok(mut url) => {
            url.set_fragment(None);
            if url.query() == Some("") {
                url.set_query(None);
            }
            url.to_string()
        }
        Err(_) => raw.to_string(),
    }
}

/// Lowercase hex SHA-256 digest.
pub fn sha256_hex(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    format!("{:x}", digest)
}

/// Source platform of a media URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Youtube,
    Instagram,
    Tiktok,
    Twitter,
    Facebook,
    Vimeo,
    Other,
}

impl Platform {
    /// Detect the platform from the URL host.
    pub fn detect(url: &str) -> Self {
        let host = Url::parse(url.trim())
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
            .unwrap_or_default();
        let host = host.trim_start_matches("www.").trim_start_matches("m.");

        let matches = |domain: &str| host == domain || host.ends_with(&format!(".{}", domain));

        if matches("youtube.com") || matches("youtu.be") {
            Platform::Youtube
        } else if matches("instagram.com") {
            Platform::Instagram
        } else if matches("tiktok.com") {
            Platform::Tiktok
        } else if matches("twitter.com") || matches("x.com") {
            Platform::Twitter
        } else if matches("facebook.com") || matches("fb.watch") {
            Platform::Facebook
        } else if matches("vimeo.com") {
            Platform::Vimeo
        } else {
            Platform::Other
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Youtube => "youtube",
            Platform::Instagram => "instagram",
            Platform::Tiktok => "tiktok",
            Platform::Twitter => "twitter",
            Platform::Facebook => "facebook",
            Platform::Vimeo => "vimeo",
            Platform::Other => "other",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
