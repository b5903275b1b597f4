//! Job Model Module
//!
//! The durable record of a remote media job and its status lifecycle.

mod store;

pub use store::*;

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{CoreError, CoreResult, JobId, MediaKind, Operation, TimeSec};

// =============================================================================
// Job Status
// =============================================================================

/// Job status as reported by the remote processor
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Accepted by the server, not yet running
    Queued,
    /// Being processed server-side
    Started,
    /// Server gave up on the job
    Failed,
    /// Result is available
    Finished,
}

impl JobStatus {
    /// Stable storage name
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Started => "started",
            JobStatus::Failed => "failed",
            JobStatus::Finished => "finished",
        }
    }

    /// Parses a stored name
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(JobStatus::Queued),
            "started" => Some(JobStatus::Started),
            "failed" => Some(JobStatus::Failed),
            "finished" => Some(JobStatus::Finished),
            _ => None,
        }
    }

    /// True for `finished` and `failed`
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Finished | JobStatus::Failed)
    }

    /// Whether a record in this state may move to `next`.
    ///
    /// Same-state updates are always allowed. `finished` may only fall back to
    /// `failed` when the local materialization of its result fails.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        if self == next {
            return true;
        }
        match self {
            JobStatus::Queued => true,
            JobStatus::Started => next != JobStatus::Queued,
            JobStatus::Finished => next == JobStatus::Failed,
            JobStatus::Failed => false,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Result Metadata
// =============================================================================

/// One speaker-attributed span of the transcript
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptSegment {
    pub speaker_label: String,
    pub text: String,
    pub start_seconds: TimeSec,
    pub end_seconds: TimeSec,
}

/// A titled chapter boundary
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChapterMark {
    pub start_seconds: TimeSec,
    pub title: String,
}

// =============================================================================
// Job
// =============================================================================

/// Job record
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /// Remote job id
    pub id: JobId,
    /// Which artifact pipeline applies
    pub media_kind: MediaKind,
    /// Enhance or transcribe
    pub operation: Operation,
    /// Current status
    pub status: JobStatus,
    /// Duration captured at submission (advisory)
    pub duration_seconds: Option<TimeSec>,
    /// Canonical local media file
    pub local_artifact_path: Option<PathBuf>,
    /// Remote result URL, present once finished
    pub result_payload: Option<String>,
    /// Transcript written with the finished transition
    pub transcript_segments: Vec<TranscriptSegment>,
    /// Chapters written with the finished transition
    pub chapter_marks: Vec<ChapterMark>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// User-facing name
    pub display_name: Option<String>,
    /// Set on listing when the artifact is gone and cannot be reconstructed
    #[serde(default, skip_deserializing)]
    pub broken: bool,
}

impl Job {
    /// Creates a queued job
    pub fn new(id: impl Into<JobId>, media_kind: MediaKind, operation: Operation) -> Self {
        Self {
            id: id.into(),
            media_kind,
            operation,
            status: JobStatus::Queued,
            duration_seconds: None,
            local_artifact_path: None,
            result_payload: None,
            transcript_segments: Vec::new(),
            chapter_marks: Vec::new(),
            created_at: Utc::now(),
            display_name: None,
            broken: false,
        }
    }

    /// Sets the local artifact and derives the display name from its file name
    pub fn with_artifact(mut self, path: PathBuf) -> Self {
        self.display_name = file_name_of(&path);
        self.local_artifact_path = Some(path);
        self
    }

    /// Sets the advisory duration
    pub fn with_duration(mut self, duration_seconds: Option<TimeSec>) -> Self {
        self.duration_seconds = duration_seconds;
        self
    }

    /// Checks if the server is still working on the job
    pub fn is_unfinished(&self) -> bool {
        !self.status.is_terminal()
    }

    /// Moves to `next`, rejecting regressions.
    pub fn transition_to(&mut self, next: JobStatus) -> CoreResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(CoreError::InvalidStatusTransition {
                id: self.id.clone(),
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Points the job at a new canonical artifact and renames it after the file
    pub fn set_artifact(&mut self, path: PathBuf) {
        self.display_name = file_name_of(&path);
        self.local_artifact_path = Some(path);
    }
}

fn file_name_of(path: &std::path::Path) -> Option<String> {
    path.file_name().map(|n| n.to_string_lossy().to_string())
}
