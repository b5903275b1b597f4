//! FFmpeg Runner Module
//!
//! Executes FFmpeg/FFprobe as child processes.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use super::{detect_ffmpeg, FFmpegError, FFmpegInfo, FFmpegResult, MediaAssembler};
use crate::core::TimeSec;

/// Media information extracted by FFprobe
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct MediaInfo {
    /// Duration in seconds
    pub duration_sec: f64,
    /// Whether a video stream is present
    pub has_video: bool,
    /// Whether an audio stream is present
    pub has_audio: bool,
}

/// FFmpeg Runner for executing media commands
#[derive(Clone)]
pub struct FFmpegRunner {
    info: Arc<FFmpegInfo>,
}

impl FFmpegRunner {
    /// Create a new FFmpegRunner from detected FFmpeg installation
    pub fn new(info: FFmpegInfo) -> Self {
        Self {
            info: Arc::new(info),
        }
    }

    /// Copy the first audio track of `input` into `output` as AAC
    pub async fn extract_audio(&self, input: &Path, output: &Path) -> FFmpegResult<()> {
        ensure_input(input)?;
        ensure_output_dir(output)?;

        let args = vec![
            "-i".to_string(),
            input.to_string_lossy().to_string(),
            "-vn".to_string(),
            "-map".to_string(),
            "0:a:0".to_string(),
            "-c:a".to_string(),
            "aac".to_string(),
            "-b:a".to_string(),
            "192k".to_string(),
            "-y".to_string(),
            output.to_string_lossy().to_string(),
        ];

        self.run_ffmpeg(&args, "Audio extraction").await
    }

    /// Mux the video stream of `video` with the audio of `audio` into `output`
    pub async fn merge_audio(&self, video: &Path, audio: &Path, output: &Path) -> FFmpegResult<()> {
        ensure_input(video)?;
        ensure_input(audio)?;
        ensure_output_dir(output)?;

        let video_info = self.probe(video).await?;
        if !video_info.has_video {
            return Err(FFmpegError::InvalidInput(format!(
                "No video track found in {}",
                video.display()
            )));
        }

        let args = build_merge_args(video, audio, output, video_info.duration_sec);
        self.run_ffmpeg(&args, "Audio merge").await
    }

    /// Get media information using FFprobe
    pub async fn probe(&self, input: &Path) -> FFmpegResult<MediaInfo> {
        ensure_input(input)?;

        let output = tokio::process::Command::new(&self.info.ffprobe_path)
            .args([
                "-v",
                "quiet",
                "-print_format",
                "json",
                "-show_format",
                "-show_streams",
                &input.to_string_lossy(),
            ])
            .output()
            .await
            .map_err(FFmpegError::ProcessError)?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(FFmpegError::ProbeError(format!("FFprobe failed: {}", stderr)));
        }

        let json_str = String::from_utf8_lossy(&output.stdout);
        parse_probe_output(&json_str)
    }

    async fn run_ffmpeg(&self, args: &[String], label: &str) -> FFmpegResult<()> {
        tracing::debug!("{}: ffmpeg {}", label, args.join(" "));

        let output = tokio::process::Command::new(&self.info.ffmpeg_path)
            .arg("-hide_banner")
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(FFmpegError::ProcessError)?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(FFmpegError::ExecutionFailed(format!(
                "{} failed: {}",
                label,
                last_lines(&stderr, 5)
            )));
        }

        Ok(())
    }
}

fn ensure_input(input: &Path) -> FFmpegResult<()> {
    if !input.exists() {
        return Err(FFmpegError::InvalidInput(format!(
            "Input file does not exist: {}",
            input.display()
        )));
    }
    Ok(())
}

fn ensure_output_dir(output: &Path) -> FFmpegResult<()> {
    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            FFmpegError::OutputError(format!("Failed to create output directory: {}", e))
        })?;
    }
    Ok(())
}

/// Builds the remux command.
///
/// The video stream is copied so its rotation metadata survives; the new audio
/// is optional (`1:a:0?`) and cut to the video's length.
fn build_merge_args(video: &Path, audio: &Path, output: &Path, duration_sec: f64) -> Vec<String> {
    let mut args = vec![
        "-i".to_string(),
        video.to_string_lossy().to_string(),
        "-i".to_string(),
        audio.to_string_lossy().to_string(),
        "-map".to_string(),
        "0:v:0".to_string(),
        "-map".to_string(),
        "1:a:0?".to_string(),
        "-c:v".to_string(),
        "copy".to_string(),
        "-c:a".to_string(),
        "aac".to_string(),
        "-b:a".to_string(),
        "192k".to_string(),
        "-map_metadata".to_string(),
        "0".to_string(),
    ];

    if duration_sec > 0.0 {
        args.push("-t".to_string());
        args.push(format!("{:.3}", duration_sec));
    }

    args.extend([
        "-movflags".to_string(),
        "+faststart".to_string(),
        "-y".to_string(),
        output.to_string_lossy().to_string(),
    ]);
    args
}

/// Parse FFprobe JSON output
fn parse_probe_output(json_str: &str) -> FFmpegResult<MediaInfo> {
    let json: serde_json::Value = serde_json::from_str(json_str)
        .map_err(|e| FFmpegError::ParseError(format!("Failed to parse FFprobe output: {}", e)))?;

    let format = json
        .get("format")
        .ok_or_else(|| FFmpegError::ParseError("Missing format info".to_string()))?;

    let duration_sec = format
        .get("duration")
        .and_then(|d| d.as_str())
        .and_then(|s| s.parse::<f64>().ok())
        .unwrap_or(0.0);

    let streams = json
        .get("streams")
        .and_then(|s| s.as_array())
        .cloned()
        .unwrap_or_default();

    let has_codec_type = |kind: &str| {
        streams
            .iter()
            .any(|s| s.get("codec_type").and_then(|c| c.as_str()) == Some(kind))
    };

    Ok(MediaInfo {
        duration_sec,
        has_video: has_codec_type("video"),
        has_audio: has_codec_type("audio"),
    })
}

fn last_lines(text: &str, count: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(count);
    lines[start..].join("\n")
}

// =============================================================================
// MediaAssembler
// =============================================================================

/// [`MediaAssembler`] backed by FFmpeg.
///
/// Constructed even when FFmpeg is missing so audio-only flows keep working;
/// every operation then fails with [`FFmpegError::NotFound`].
#[derive(Clone)]
pub struct FfmpegAssembler {
    runner: Option<FFmpegRunner>,
}

impl FfmpegAssembler {
    /// Detects FFmpeg, honoring explicitly configured binaries
    pub fn detect(ffmpeg_path: Option<&Path>, ffprobe_path: Option<&Path>) -> Self {
        match detect_ffmpeg(ffmpeg_path, ffprobe_path) {
            Ok(info) => {
                tracing::info!(
                    "Using FFmpeg {} at {}",
                    info.version,
                    info.ffmpeg_path.display()
                );
                Self {
                    runner: Some(FFmpegRunner::new(info)),
                }
            }
            Err(e) => {
                tracing::warn!("FFmpeg unavailable, video jobs will fail: {}", e);
                Self { runner: None }
            }
        }
    }

    pub fn is_available(&self) -> bool {
        self.runner.is_some()
    }

    fn runner(&self) -> FFmpegResult<&FFmpegRunner> {
        self.runner.as_ref().ok_or(FFmpegError::NotFound)
    }
}

fn unique_output(out_dir: &Path, extension: &str) -> PathBuf {
    out_dir.join(format!("{}.{}", uuid::Uuid::new_v4(), extension))
}

#[async_trait]
impl MediaAssembler for FfmpegAssembler {
    async fn extract_audio(&self, video: &Path, out_dir: &Path) -> FFmpegResult<PathBuf> {
        let output = unique_output(out_dir, "m4a");
        self.runner()?.extract_audio(video, &output).await?;
        Ok(output)
    }

    async fn merge_audio(
        &self,
        video: &Path,
        audio: &Path,
        out_dir: &Path,
    ) -> FFmpegResult<PathBuf> {
        let output = unique_output(out_dir, "mp4");
        if let Err(e) = self.runner()?.merge_audio(video, audio, &output).await {
            let _ = tokio::fs::remove_file(&output).await;
            return Err(e);
        }
        Ok(output)
    }

    async fn probe_duration(&self, input: &Path) -> FFmpegResult<TimeSec> {
        Ok(self.runner()?.probe(input).await?.duration_sec)
    }
}
