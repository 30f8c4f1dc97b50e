//! FFmpeg command builder and transcoder.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{MediaError, MediaResult};
use crate::process::{tail, wait_child};

/// Builder for FFmpeg commands.
#[derive(Debug, Clone)]
pub struct FfmpegCommand {
    input: PathBuf,
    output: PathBuf,
    /// Arguments placed after `-i`
    output_args: Vec<String>,
    log_level: String,
}

impl FfmpegCommand {
    pub fn new(input: impl AsRef<Path>, output: impl AsRef<Path>) -> Self {
        Self {
            input: input.as_ref().to_path_buf(),
            output: output.as_ref().to_path_buf(),
            output_args: Vec::new(),
            log_level: "error".to_string(),
        }
    }

    pub fn output_arg(mut self, arg: impl Into<String>) -> Self {
        self.output_args.push(arg.into());
        self
    }

    pub fn no_video(self) -> Self {
        self.output_arg("-vn")
    }

    pub fn video_codec(self, codec: impl Into<String>) -> Self {
        self.output_arg("-c:v").output_arg(codec)
    }

    pub fn video_bitrate(self, bitrate: impl Into<String>) -> Self {
        self.output_arg("-b:v").output_arg(bitrate)
    }

    pub fn audio_codec(self, codec: impl Into<String>) -> Self {
        self.output_arg("-c:a").output_arg(codec)
    }

    pub fn audio_bitrate(self, bitrate: impl Into<String>) -> Self {
        self.output_arg("-b:a").output_arg(bitrate)
    }

    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    pub fn output(&self) -> &Path {
        &self.output
    }

    /// Build the command arguments.
    pub fn build_args(&self) -> Vec<String> {
        let mut args = vec![
            "-y".to_string(),
            "-v".to_string(),
            self.log_level.clone(),
            // Progress output to stderr
            "-progress".to_string(),
            "pipe:2".to_string(),
            "-i".to_string(),
            self.input.to_string_lossy().to_string(),
        ];
        args.extend(self.output_args.iter().cloned());
        args.push(self.output.to_string_lossy().to_string());
        args
    }

    /// Run with `binary`, killing FFmpeg on cancellation or timeout.
    pub async fn run(
        &self,
        binary: &Path,
        timeout: Duration,
        token: &CancellationToken,
    ) -> MediaResult<()> {
        let args = self.build_args();
        debug!("Running FFmpeg: {} {}", binary.display(), args.join(" "));

        let mut child = Command::new(binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => MediaError::FfmpegNotFound(binary.display().to_string()),
                _ => MediaError::Io(e),
            })?;

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| MediaError::internal("ffmpeg stderr not captured"))?;

        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            let mut progress = FfmpegProgress::default();
            let mut errors = String::new();
            while let Ok(Some(line)) = lines.next_line().await {
                match parse_progress_line(&line, &mut progress) {
                    Some(update) => debug!(
                        out_time_ms = update.out_time_ms,
                        speed = update.speed,
                        "FFmpeg progress"
                    ),
                    None if !line.contains('=') => {
                        errors.push_str(&line);
                        errors.push('\n');
                    }
                    None => {}
                }
            }
            errors
        });

        let status = wait_child(&mut child, "ffmpeg", timeout, token).await;
        let errors = reader.await.unwrap_or_default();
        let status = status?;

        if status.success() {
            Ok(())
        } else {
            let stderr = tail(&errors, 20);
            Err(MediaError::ffmpeg_failed(
                "FFmpeg exited with non-zero status",
                (!stderr.is_empty()).then_some(stderr),
                status.code(),
            ))
        }
    }
}

/// Progress information from FFmpeg's `-progress` output.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FfmpegProgress {
    pub out_time_ms: i64,
    pub speed: f64,
    pub is_complete: bool,
}

/// Parse one `key=value` progress line. Returns a snapshot at the end of
/// each progress block.
fn parse_progress_line(line: &str, current: &mut FfmpegProgress) -> Option<FfmpegProgress> {
    let (key, value) = line.trim().split_once('=')?;
    match key {
        "out_time_us" => {
            if let Ok(us) = value.parse::<i64>() {
                current.out_time_ms = us / 1000;
            }
        }
        "speed" => {
            if let Some(speed) = value.strip_suffix('x').and_then(|s| s.trim().parse().ok()) {
                current.speed = speed;
            }
        }
        "progress" => {
            current.is_complete = value == "end";
            return Some(current.clone());
        }
        _ => {}
    }
    None
}

/// FFmpeg audio encoder for an audio format; unknown formats copy.
pub fn audio_codec_for(format: &str) -> &'static str {
    match format.to_ascii_lowercase().as_str() {
        "mp3" => "libmp3lame",
        "aac" => "aac",
        "flac" => "flac",
        "opus" => "libopus",
        "wav" => "pcm_s16le",
        _ => "copy",
    }
}

/// Whether streams can move from the `from` container to `to` without
/// re-encoding. Extensions include the leading dot.
pub fn can_remux(from: &str, to: &str) -> bool {
    let to = to.to_ascii_lowercase();
    let targets: &[&str] = match from.to_ascii_lowercase().as_str() {
        ".mp4" => &[".mkv", ".avi", ".mov"],
        ".mkv" => &[".mp4", ".avi", ".mov"],
        ".avi" => &[".mp4", ".mkv"],
        ".mov" => &[".mp4", ".mkv"],
        ".webm" => &[".mkv"],
        _ => &[],
    };
    targets.contains(&to.as_str())
}

fn dotted(format: &str) -> String {
    if format.starts_with('.') {
        format.to_ascii_lowercase()
    } else {
        format!(".{}", format.to_ascii_lowercase())
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let stem = path.file_stem().map(|s| s.to_string_lossy()).unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{}{}.{}", stem, suffix, ext.to_string_lossy()),
        None => format!("{}{}", stem, suffix),
    };
    path.with_file_name(name)
}

/// Output path for converting `input` to `ext`. Never returns `input`
/// itself since FFmpeg cannot edit in place.
fn conversion_output(input: &Path, ext: &str) -> PathBuf {
    let current = input
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy().to_ascii_lowercase()))
        .unwrap_or_default();
    if current == ext {
        return with_suffix(input, "_converted");
    }
    input.with_extension(ext.trim_start_matches('.'))
}

/// Container and audio transcoding.
#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Convert `input` to the `format` container using video `codec`.
    async fn convert_format(
        &self,
        input: &Path,
        format: &str,
        codec: &str,
        bitrate: Option<&str>,
        token: &CancellationToken,
    ) -> MediaResult<PathBuf>;

    /// Extract the audio track of `input` as `format`.
    async fn extract_audio(
        &self,
        input: &Path,
        format: &str,
        bitrate: Option<&str>,
        token: &CancellationToken,
    ) -> MediaResult<PathBuf>;
}

/// [`Transcoder`] backed by the FFmpeg binary.
#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    binary: PathBuf,
    timeout: Duration,
}

impl FfmpegTranscoder {
    pub fn new(binary: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    fn conversion_command(
        input: &Path,
        format: &str,
        codec: &str,
        bitrate: Option<&str>,
    ) -> MediaResult<FfmpegCommand> {
        if format.trim().is_empty() {
            return Err(MediaError::InvalidInput("output format is required".to_string()));
        }
        let output = conversion_output(input, &dotted(format.trim()));
        let mut cmd = FfmpegCommand::new(input, output).video_codec(codec);
        if let Some(bitrate) = bitrate.filter(|b| !b.is_empty()) {
            cmd = cmd.video_bitrate(bitrate);
        }
        Ok(cmd.audio_codec("copy"))
    }

    fn audio_command(input: &Path, format: &str, bitrate: Option<&str>) -> MediaResult<FfmpegCommand> {
        if format.trim().is_empty() {
            return Err(MediaError::InvalidInput("audio format is required".to_string()));
        }
        let output = conversion_output(input, &dotted(format.trim()));
        let mut cmd = FfmpegCommand::new(input, output)
            .no_video()
            .audio_codec(audio_codec_for(format.trim()));
        if let Some(bitrate) = bitrate.filter(|b| !b.is_empty()) {
            cmd = cmd.audio_bitrate(bitrate);
        }
        Ok(cmd)
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn convert_format(
        &self,
        input: &Path,
        format: &str,
        codec: &str,
        bitrate: Option<&str>,
        token: &CancellationToken,
    ) -> MediaResult<PathBuf> {
        let cmd = Self::conversion_command(input, format, codec, bitrate)?;
        info!(
            input = %input.display(),
            output = %cmd.output().display(),
            codec,
            "Converting format"
        );
        cmd.run(&self.binary, self.timeout, token).await?;
        Ok(cmd.output().to_path_buf())
    }

    async fn extract_audio(
        &self,
        input: &Path,
        format: &str,
        bitrate: Option<&str>,
        token: &CancellationToken,
    ) -> MediaResult<PathBuf> {
        let cmd = Self::audio_command(input, format, bitrate)?;
        info!(
            input = %input.display(),
            output = %cmd.output().display(),
            format,
            "Extracting audio"
        );
        cmd.run(&self.binary, self.timeout, token).await?;
        Ok(cmd.output().to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_builder() {
        let args = FfmpegCommand::new("in.webm", "out.mp4")
            .video_codec("libx264")
            .video_bitrate("2M")
            .audio_codec("copy")
            .build_args();

        assert_eq!(&args[..3], &["-y", "-v", "error"]);
        let input = args.iter().position(|a| a == "-i").unwrap();
        assert_eq!(args[input + 1], "in.webm");
        assert_eq!(args[input + 2..input + 4], ["-c:v", "libx264"]);
        assert_eq!(args.last().unwrap(), "out.mp4");
    }

    #[test]
    fn test_progress_parsing() {
        let mut progress = FfmpegProgress::default();

        assert!(parse_progress_line("out_time_us=5000000", &mut progress).is_none());
        assert_eq!(progress.out_time_ms, 5000);

        parse_progress_line("speed=1.5x", &mut progress);
        parse_progress_line("speed=N/A", &mut progress);
        assert!((progress.speed - 1.5).abs() < 0.01);

        let snapshot = parse_progress_line("progress=end", &mut progress).unwrap();
        assert!(snapshot.is_complete);
        assert!(parse_progress_line("Error opening input", &mut progress).is_none());
    }

    #[test]
    fn test_audio_codecs() {
        assert_eq!(audio_codec_for("mp3"), "libmp3lame");
        assert_eq!(audio_codec_for("OPUS"), "libopus");
        assert_eq!(audio_codec_for("wav"), "pcm_s16le");
        assert_eq!(audio_codec_for("m4a"), "copy");
    }

    #[test]
    fn test_remux_table() {
        assert!(can_remux(".mp4", ".mkv"));
        assert!(can_remux(".MOV", ".mp4"));
        assert!(can_remux(".webm", ".mkv"));
        assert!(!can_remux(".webm", ".mp4"));
        assert!(!can_remux(".avi", ".mov"));
        assert!(!can_remux(".flv", ".mp4"));
    }

    #[test]
    fn test_output_never_overwrites_input() {
        assert_eq!(
            conversion_output(Path::new("/w/abc.webm"), ".mp4"),
            PathBuf::from("/w/abc.mp4")
        );
        assert_eq!(
            conversion_output(Path::new("/w/abc.mp4"), ".mp4"),
            PathBuf::from("/w/abc_converted.mp4")
        );
        assert_eq!(
            conversion_output(Path::new("/w/abc.MP4"), ".mp4"),
            PathBuf::from("/w/abc_converted.MP4")
        );
    }

    #[test]
    fn test_conversion_and_audio_commands() {
        let cmd = FfmpegTranscoder::conversion_command(Path::new("a.webm"), "mkv", "copy", None).unwrap();
        let args = cmd.build_args();
        assert!(args.windows(2).any(|w| w == ["-c:a", "copy"]));
        assert!(!args.contains(&"-b:v".to_string()));
        assert_eq!(cmd.output(), Path::new("a.mkv"));

        let cmd = FfmpegTranscoder::audio_command(Path::new("a.webm"), "mp3", Some("192k")).unwrap();
        let args = cmd.build_args();
        assert!(args.contains(&"-vn".to_string()));
        assert!(args.windows(2).any(|w| w == ["-c:a", "libmp3lame"]));
        assert!(args.windows(2).any(|w| w == ["-b:a", "192k"]));

        assert!(FfmpegTranscoder::conversion_command(Path::new("a.webm"), " ", "copy", None).is_err());
    }

    #[tokio::test]
    async fn test_missing_binary() {
        let transcoder = FfmpegTranscoder::new("no-such-ffmpeg-4b1d", Duration::from_secs(5));
        let err = transcoder
            .extract_audio(Path::new("in.mp4"), "mp3", None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, MediaError::FfmpegNotFound(_)));
    }
}
