//! FFmpeg Integration Module
//!
//! Local media work around remote jobs:
//! - extracting the audio track of a video before upload
//! - merging a server-generated audio track back into the original video
//! - probing durations
//!
//! Uses system-installed FFmpeg/FFprobe, or explicit binaries from settings.

mod detection;
mod runner;

pub use detection::*;
pub use runner::{FFmpegRunner, FfmpegAssembler, MediaInfo};

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::core::TimeSec;

/// FFmpeg-related error types
#[derive(Debug, thiserror::Error)]
pub enum FFmpegError {
    #[error("FFmpeg not found. Please install FFmpeg or configure its path in settings.")]
    NotFound,

    #[error("FFmpeg execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Invalid input file: {0}")]
    InvalidInput(String),

    #[error("Output path error: {0}")]
    OutputError(String),

    #[error("FFprobe error: {0}")]
    ProbeError(String),

    #[error("Process error: {0}")]
    ProcessError(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    ParseError(String),
}

pub type FFmpegResult<T> = Result<T, FFmpegError>;

/// Local media operations the engine needs around a remote job.
///
/// Every output lands in a freshly named file inside `out_dir`; callers move
/// it to its canonical location.
#[async_trait]
pub trait MediaAssembler: Send + Sync {
    /// Extracts the first audio track of `video` into an `.m4a` file
    async fn extract_audio(&self, video: &Path, out_dir: &Path) -> FFmpegResult<PathBuf>;

    /// Replaces the audio of `video` with `audio`, keeping the video stream
    /// (and its orientation) untouched. The result is an `.mp4` trimmed to the
    /// video's duration.
    async fn merge_audio(&self, video: &Path, audio: &Path, out_dir: &Path)
        -> FFmpegResult<PathBuf>;

    /// Container duration in seconds
    async fn probe_duration(&self, input: &Path) -> FFmpegResult<TimeSec>;
}
