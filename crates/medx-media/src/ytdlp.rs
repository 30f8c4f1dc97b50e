//! yt-dlp subprocess extractor.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use medx_models::{FormatEntry, MediaMetadata, Platform};
use parking_lot::Mutex;
use regex::Regex;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ExtractorConfig;
use crate::error::{MediaError, MediaResult};
use crate::extractor::{DownloadOptions, Extractor};
use crate::process::{tail, wait_child};

const YOUTUBE_EXTRACTOR_ARGS: &str = "youtube:player_client=android_vr,web";
const METADATA_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";
const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                                  (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
const MP4_POSTPROCESSOR_ARGS: &str = "ffmpeg:-c:v copy -c:a aac -b:a 192k -movflags +faststart";

/// Lines of stderr kept in error messages.
const ERROR_TAIL_LINES: usize = 20;

static PROGRESS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[download\]\s+(\d+(?:\.\d+)?)%").unwrap());

/// [`Extractor`] that shells out to yt-dlp.
#[derive(Debug, Clone)]
pub struct YtDlpExtractor {
    binary: PathBuf,
    ffmpeg_location: Option<PathBuf>,
    timeout: Duration,
}

impl YtDlpExtractor {
    pub fn new(config: &ExtractorConfig) -> Self {
        Self {
            binary: config.ytdlp_path.clone(),
            ffmpeg_location: config.ffmpeg_location.clone(),
            timeout: config.timeout,
        }
    }

    fn metadata_args(url: &str) -> Vec<String> {
        let mut args: Vec<String> = ["--no-playlist", "--no-warnings", "--skip-download", "--print-json"]
            .into_iter()
            .map(String::from)
            .collect();

        if Platform::detect(url) == Platform::Youtube {
            args.extend([
                "--user-agent".to_string(),
                METADATA_USER_AGENT.to_string(),
                "--extractor-args".to_string(),
                YOUTUBE_EXTRACTOR_ARGS.to_string(),
            ]);
        }

        args.push(url.to_string());
        args
    }

    fn download_args(&self, url: &str, output: &Path, options: &DownloadOptions) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "--no-playlist".into(),
            "--no-warnings".into(),
            "--progress".into(),
            "--newline".into(),
            "--print-json".into(),
            "-o".into(),
            output.to_string_lossy().to_string(),
        ];

        if let Some(location) = &self.ffmpeg_location {
            args.push("--ffmpeg-location".into());
            args.push(location.to_string_lossy().to_string());
        }

        if options.extract_audio {
            args.push("-x".into());
            let audio_format = if options.audio_format.is_empty() {
                "mp3"
            } else {
                options.audio_format.as_str()
            };
            args.push("--audio-format".into());
            args.push(audio_format.to_string());
            if !options.audio_bitrate.is_empty() {
                args.push("--audio-quality".into());
                args.push(options.audio_bitrate.clone());
            }
        } else {
            let format = options.format.to_ascii_lowercase();
            args.push("-f".into());
            args.push(format_selector(&options.quality, &format));

            if format.is_empty() || format == "mp4" {
                args.push("--postprocessor-args".into());
                args.push(MP4_POSTPROCESSOR_ARGS.into());
            }
            match format.as_str() {
                "" => {}
                "mp4" | "webm" => {
                    args.push("--merge-output-format".into());
                    args.push(format);
                }
                _ => {
                    args.push("--recode-video".into());
                    args.push(format);
                }
            }
        }

        if !options.subtitles.is_empty() {
            args.extend([
                "--write-subs".to_string(),
                "--write-auto-subs".to_string(),
                "--sub-langs".to_string(),
                options.subtitles.join(","),
                "--convert-subs".to_string(),
                "srt".to_string(),
            ]);
        }

        if let Some(cookies) = &options.cookies_file {
            args.push("--cookies".into());
            args.push(cookies.to_string_lossy().to_string());
        }

        args.push("--user-agent".into());
        args.push(
            options
                .user_agent
                .clone()
                .filter(|ua| !ua.is_empty())
                .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
        );

        if let Some(proxy) = options.proxy_url.as_ref().filter(|p| !p.is_empty()) {
            args.push("--proxy".into());
            args.push(proxy.clone());
        }

        args.push("--extractor-args".into());
        args.push(YOUTUBE_EXTRACTOR_ARGS.into());
        args.push(url.to_string());
        args
    }

    fn spawn(&self, args: &[String]) -> MediaResult<tokio::process::Child> {
        Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => MediaError::YtDlpNotFound(self.binary.display().to_string()),
                _ => MediaError::Io(e),
            })
    }
}

/// yt-dlp `-f` selector for a quality label and target container.
pub(crate) fn format_selector(quality: &str, format: &str) -> String {
    let prefer_h264 = format.is_empty() || format == "mp4";
    match quality_height(quality) {
        Some(h) if prefer_h264 => format!(
            "bestvideo[height<={h}][vcodec^=avc1]+bestaudio[acodec=aac]/bestvideo[height<={h}]+bestaudio/best[height<={h}]/best"
        ),
        Some(h) => format!("bestvideo[height<={h}]+bestaudio/best[height<={h}]/best"),
        None if prefer_h264 => "bestvideo[vcodec^=avc1]+bestaudio[acodec=aac]/bestvideo+bestaudio[acodec=aac]/bestvideo+bestaudio/best".to_string(),
        None => "bestvideo+bestaudio/best".to_string(),
    }
}

fn quality_height(quality: &str) -> Option<u32> {
    match quality.to_ascii_lowercase().as_str() {
        "4k" | "2160p" => Some(2160),
        "1440p" => Some(1440),
        "1080p" => Some(1080),
        "720p" => Some(720),
        "480p" => Some(480),
        "360p" => Some(360),
        _ => None,
    }
}

/// Download percentage from a yt-dlp progress line.
pub(crate) fn parse_progress(line: &str) -> Option<u8> {
    let captures = PROGRESS_RE.captures(line)?;
    let percent: f64 = captures.get(1)?.as_str().parse().ok()?;
    Some(percent.clamp(0.0, 100.0) as u8)
}

/// Last line of `output` that parses as a JSON object.
pub(crate) fn extract_json_object(output: &str) -> Option<Value> {
    output
        .lines()
        .rev()
        .map(str::trim)
        .filter(|line| line.starts_with('{') && line.ends_with('}'))
        .find_map(|line| serde_json::from_str::<Value>(line).ok().filter(Value::is_object))
}

fn str_field(data: &Value, key: &str) -> String {
    data.get(key).and_then(Value::as_str).unwrap_or_default().to_string()
}

fn num_field(data: &Value, key: &str) -> f64 {
    data.get(key).and_then(Value::as_f64).unwrap_or_default()
}

/// Convert yt-dlp info JSON to [`MediaMetadata`]. Missing or mistyped
/// fields are left at their defaults.
pub(crate) fn parse_metadata(data: &Value) -> MediaMetadata {
    let formats = data
        .get("formats")
        .and_then(Value::as_array)
        .map(|formats| formats.iter().map(parse_format).collect())
        .unwrap_or_default();

    MediaMetadata {
        title: str_field(data, "title"),
        description: str_field(data, "description"),
        duration: num_field(data, "duration") as u64,
        uploader: str_field(data, "uploader"),
        upload_date: str_field(data, "upload_date"),
        view_count: num_field(data, "view_count") as u64,
        like_count: num_field(data, "like_count") as u64,
        thumbnail: str_field(data, "thumbnail"),
        platform: str_field(data, "extractor").to_lowercase(),
        width: num_field(data, "width") as u32,
        height: num_field(data, "height") as u32,
        fps: num_field(data, "fps"),
        video_codec: str_field(data, "vcodec"),
        audio_codec: str_field(data, "acodec"),
        formats,
    }
}

fn parse_format(data: &Value) -> FormatEntry {
    let height = num_field(data, "height") as u32;
    let quality = match data.get("quality").and_then(Value::as_str) {
        Some(quality) => quality.to_string(),
        None if height > 0 => format!("{}p", height),
        None => String::new(),
    };

    FormatEntry {
        format_id: str_field(data, "format_id"),
        ext: str_field(data, "ext"),
        quality,
        resolution: str_field(data, "resolution"),
        width: num_field(data, "width") as u32,
        height,
        filesize: num_field(data, "filesize") as u64,
        bitrate: num_field(data, "tbr") as u32,
        vcodec: str_field(data, "vcodec"),
        acodec: str_field(data, "acodec"),
    }
}

/// Feed every line of `stream` to `on_line` until EOF.
async fn read_lines<R, F>(stream: R, mut on_line: F)
where
    R: AsyncRead + Unpin,
    F: FnMut(&str),
{
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => on_line(&line),
            Ok(None) => break,
            Err(e) => {
                debug!("Stopped reading yt-dlp output: {}", e);
                break;
            }
        }
    }
}

#[async_trait]
impl Extractor for YtDlpExtractor {
    async fn extract_metadata(
        &self,
        url: &str,
        token: &CancellationToken,
    ) -> MediaResult<MediaMetadata> {
        let args = Self::metadata_args(url);
        debug!(url = %url, "Extracting metadata");

        let mut child = self.spawn(&args)?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| MediaError::internal("yt-dlp stdout not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| MediaError::internal("yt-dlp stderr not captured"))?;

        let out_task = tokio::spawn(async move {
            let mut buf = String::new();
            read_lines(stdout, |line| {
                buf.push_str(line);
                buf.push('\n');
            })
            .await;
            buf
        });
        let err_task = tokio::spawn(async move {
            let mut buf = String::new();
            read_lines(stderr, |line| {
                buf.push_str(line);
                buf.push('\n');
            })
            .await;
            buf
        });

        let status = wait_child(&mut child, "yt-dlp", self.timeout, token).await;
        let stdout = out_task.await.unwrap_or_default();
        let stderr = err_task.await.unwrap_or_default();
        let status = status?;

        if !status.success() {
            return Err(MediaError::extraction_failed(format!(
                "yt-dlp exited with {}: {}",
                status,
                tail(&stderr, ERROR_TAIL_LINES)
            )));
        }

        let data = extract_json_object(&stdout)
            .ok_or_else(|| MediaError::extraction_failed("no JSON object found in yt-dlp output"))?;
        Ok(parse_metadata(&data))
    }

    async fn download(
        &self,
        url: &str,
        output: &Path,
        options: &DownloadOptions,
        token: &CancellationToken,
    ) -> MediaResult<Option<MediaMetadata>> {
        let args = self.download_args(url, output, options);
        info!(url = %url, output = %output.display(), "Starting download");
        debug!("Running yt-dlp: {}", args.join(" "));

        let mut child = self.spawn(&args)?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| MediaError::internal("yt-dlp stdout not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| MediaError::internal("yt-dlp stderr not captured"))?;

        let metadata_json = Arc::new(Mutex::new(None::<String>));

        let out_task = {
            let options = options.clone();
            let metadata_json = Arc::clone(&metadata_json);
            tokio::spawn(async move {
                read_lines(stdout, |line| {
                    if let Some(percent) = parse_progress(line) {
                        options.report(percent);
                    }
                    let trimmed = line.trim();
                    if trimmed.starts_with('{') && trimmed.ends_with('}') {
                        *metadata_json.lock() = Some(trimmed.to_string());
                    }
                })
                .await;
            })
        };
        let err_task = {
            let options = options.clone();
            tokio::spawn(async move {
                let mut buf = String::new();
                read_lines(stderr, |line| {
                    if let Some(percent) = parse_progress(line) {
                        options.report(percent);
                    }
                    buf.push_str(line);
                    buf.push('\n');
                })
                .await;
                buf
            })
        };

        let status = wait_child(&mut child, "yt-dlp", self.timeout, token).await;
        let _ = out_task.await;
        let stderr = err_task.await.unwrap_or_default();
        let status = status?;

        if !status.success() {
            let message = tail(&stderr, ERROR_TAIL_LINES);
            warn!(url = %url, "yt-dlp failed: {}", message);
            return Err(MediaError::download_failed(format!(
                "yt-dlp exited with {}: {}",
                status, message
            )));
        }

        let json = metadata_json.lock().take();
        Ok(json
            .and_then(|json| extract_json_object(&json))
            .map(|data| parse_metadata(&data)))
    }

    fn name(&self) -> &str {
        "yt-dlp"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn extractor() -> YtDlpExtractor {
        YtDlpExtractor::new(&ExtractorConfig::default())
    }

    fn pair(args: &[String], flag: &str) -> Option<String> {
        args.iter()
            .position(|a| a == flag)
            .and_then(|i| args.get(i + 1).cloned())
    }

    #[test]
    fn test_metadata_args() {
        let args = YtDlpExtractor::metadata_args("https://youtu.be/abc");
        assert!(args.contains(&"--skip-download".to_string()));
        assert_eq!(pair(&args, "--extractor-args").as_deref(), Some(YOUTUBE_EXTRACTOR_ARGS));
        assert_eq!(args.last().unwrap(), "https://youtu.be/abc");

        let args = YtDlpExtractor::metadata_args("https://vimeo.com/1");
        assert!(!args.contains(&"--user-agent".to_string()));
    }

    #[test]
    fn test_video_download_args() {
        let options = DownloadOptions {
            quality: "720p".into(),
            format: "mkv".into(),
            subtitles: vec!["en".into(), "de".into()],
            proxy_url: Some("http://proxy:8080".into()),
            ..Default::default()
        }
        .with_cookies_file("/tmp/c.txt");

        let args = extractor().download_args("https://x.com/v", Path::new("/w/j.%(ext)s"), &options);
        assert_eq!(pair(&args, "-o").as_deref(), Some("/w/j.%(ext)s"));
        assert_eq!(
            pair(&args, "-f").as_deref(),
            Some("bestvideo[height<=720]+bestaudio/best[height<=720]/best")
        );
        assert_eq!(pair(&args, "--recode-video").as_deref(), Some("mkv"));
        assert!(!args.contains(&"--postprocessor-args".to_string()));
        assert_eq!(pair(&args, "--sub-langs").as_deref(), Some("en,de"));
        assert_eq!(pair(&args, "--cookies").as_deref(), Some("/tmp/c.txt"));
        assert_eq!(pair(&args, "--user-agent").as_deref(), Some(DEFAULT_USER_AGENT));
        assert_eq!(pair(&args, "--proxy").as_deref(), Some("http://proxy:8080"));
        assert!(!args.contains(&"--ffmpeg-location".to_string()));
        assert_eq!(args.last().unwrap(), "https://x.com/v");
    }

    #[test]
    fn test_mp4_and_audio_download_args() {
        let options = DownloadOptions {
            format: "mp4".into(),
            ..Default::default()
        };
        let args = extractor().download_args("u", Path::new("o"), &options);
        assert_eq!(pair(&args, "--merge-output-format").as_deref(), Some("mp4"));
        assert_eq!(pair(&args, "--postprocessor-args").as_deref(), Some(MP4_POSTPROCESSOR_ARGS));

        let options = DownloadOptions {
            extract_audio: true,
            audio_format: "opus".into(),
            audio_bitrate: "128K".into(),
            ..Default::default()
        };
        let args = extractor().download_args("u", Path::new("o"), &options);
        assert!(args.contains(&"-x".to_string()));
        assert!(!args.contains(&"-f".to_string()));
        assert_eq!(pair(&args, "--audio-format").as_deref(), Some("opus"));
        assert_eq!(pair(&args, "--audio-quality").as_deref(), Some("128K"));
    }

    #[test]
    fn test_format_selector() {
        assert_eq!(
            format_selector("1080p", ""),
            "bestvideo[height<=1080][vcodec^=avc1]+bestaudio[acodec=aac]/bestvideo[height<=1080]+bestaudio/best[height<=1080]/best"
        );
        assert_eq!(
            format_selector("4k", "webm"),
            "bestvideo[height<=2160]+bestaudio/best[height<=2160]/best"
        );
        assert_eq!(format_selector("best", "webm"), "bestvideo+bestaudio/best");
        assert!(format_selector("", "mp4").starts_with("bestvideo[vcodec^=avc1]"));
    }

    #[test]
    fn test_parse_progress() {
        assert_eq!(parse_progress("[download]  42.7% of 10.00MiB at 1.00MiB/s"), Some(42));
        assert_eq!(parse_progress("[download] 100% of 10.00MiB"), Some(100));
        assert_eq!(parse_progress("[download] Destination: x.mp4"), None);
        assert_eq!(parse_progress("[ffmpeg] Merging formats"), None);
    }

    #[test]
    fn test_extract_json_object_takes_last_object() {
        let output = "WARNING: something\n{\"title\": \"first\"}\n[info] done\n{\"title\": \"second\"}\n{broken}\n";
        let data = extract_json_object(output).unwrap();
        assert_eq!(data["title"], "second");
        assert!(extract_json_object("no json here\n[1, 2]\n").is_none());
    }

    #[test]
    fn test_parse_metadata() {
        let data = json!({
            "title": "Clip",
            "duration": 212.5,
            "uploader": "someone",
            "view_count": 1000,
            "like_count": null,
            "extractor": "Youtube",
            "width": 1920,
            "height": 1080,
            "fps": 29.97,
            "vcodec": "avc1.640028",
            "formats": [
                {"format_id": "137", "ext": "mp4", "height": 1080, "width": 1920, "tbr": 4400.5, "filesize": 1234},
                {"format_id": "140", "ext": "m4a", "quality": 3, "acodec": "mp4a.40.2"},
                {"format_id": "sb0", "ext": "mhtml", "quality": "storyboard"}
            ]
        });

        let metadata = parse_metadata(&data);
        assert_eq!(metadata.title, "Clip");
        assert_eq!(metadata.duration, 212);
        assert_eq!(metadata.view_count, 1000);
        assert_eq!(metadata.like_count, 0);
        assert_eq!(metadata.platform, "youtube");
        assert_eq!((metadata.width, metadata.height), (1920, 1080));
        assert_eq!(metadata.formats.len(), 3);
        assert_eq!(metadata.formats[0].quality, "1080p");
        assert_eq!(metadata.formats[0].bitrate, 4400);
        assert_eq!(metadata.formats[0].filesize, 1234);
        assert_eq!(metadata.formats[1].quality, "");
        assert_eq!(metadata.formats[2].quality, "storyboard");
    }

    #[tokio::test]
    async fn test_missing_binary() {
        let config = ExtractorConfig {
            ytdlp_path: PathBuf::from("no-such-ytdlp-91c2"),
            ..Default::default()
        };
        let err = YtDlpExtractor::new(&config)
            .extract_metadata("https://youtu.be/x", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, MediaError::YtDlpNotFound(_)));
    }
}
