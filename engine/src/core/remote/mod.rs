//! Remote Job Processor Module
//!
//! Wire types and the client interface for the server that runs enhancement
//! and transcription jobs.

mod http;

pub use http::*;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::jobs::{ChapterMark, JobStatus, TranscriptSegment};
use crate::core::{CoreResult, JobId};

// =============================================================================
// Status
// =============================================================================

/// Status string reported by the server
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RemoteStatus {
    Queued,
    Started,
    Failed,
    Finished,
    /// Anything the engine does not understand; logged and ignored
    Unknown(String),
}

impl RemoteStatus {
    /// The job status this maps onto, if any
    pub fn job_status(&self) -> Option<JobStatus> {
        match self {
            RemoteStatus::Queued => Some(JobStatus::Queued),
            RemoteStatus::Started => Some(JobStatus::Started),
            RemoteStatus::Failed => Some(JobStatus::Failed),
            RemoteStatus::Finished => Some(JobStatus::Finished),
            RemoteStatus::Unknown(_) => None,
        }
    }

    /// True for `finished` and `failed`
    pub fn is_terminal(&self) -> bool {
        matches!(self, RemoteStatus::Finished | RemoteStatus::Failed)
    }
}

impl From<String> for RemoteStatus {
    fn from(value: String) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "queued" => RemoteStatus::Queued,
            "started" => RemoteStatus::Started,
            "failed" => RemoteStatus::Failed,
            "finished" => RemoteStatus::Finished,
            _ => RemoteStatus::Unknown(value),
        }
    }
}

impl From<RemoteStatus> for String {
    fn from(value: RemoteStatus) -> Self {
        match value {
            RemoteStatus::Queued => "queued".to_string(),
            RemoteStatus::Started => "started".to_string(),
            RemoteStatus::Failed => "failed".to_string(),
            RemoteStatus::Finished => "finished".to_string(),
            RemoteStatus::Unknown(other) => other,
        }
    }
}

impl std::fmt::Display for RemoteStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RemoteStatus::Unknown(other) => f.write_str(other),
            known => f.write_str(&String::from(known.clone())),
        }
    }
}

// =============================================================================
// Responses
// =============================================================================

/// One transcript entry as sent by the server
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RemoteTranscription {
    pub speaker: String,
    pub text: String,
    pub start: f64,
    pub end: f64,
}

/// One chapter as sent by the server
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RemoteChapter {
    pub start: f64,
    pub title: String,
}

/// Body of `GET /task/{id}` (and of `POST /task`)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub id: JobId,
    pub status: RemoteStatus,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub transcriptions: Option<Vec<RemoteTranscription>>,
    #[serde(default)]
    pub summaries: Option<Vec<String>>,
    #[serde(default, alias = "summaryChapters")]
    pub summary_chapters: Option<Vec<RemoteChapter>>,
    #[serde(default)]
    pub error: Option<String>,
}

impl StatusResponse {
    pub fn new(id: impl Into<JobId>, status: RemoteStatus) -> Self {
        Self {
            id: id.into(),
            status,
            result: None,
            transcriptions: None,
            summaries: None,
            summary_chapters: None,
            error: None,
        }
    }

    pub fn with_result(mut self, result: impl Into<String>) -> Self {
        self.result = Some(result.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Transcript in the engine's model
    pub fn transcript_segments(&self) -> Vec<TranscriptSegment> {
        self.transcriptions
            .iter()
            .flatten()
            .map(|t| TranscriptSegment {
                speaker_label: t.speaker.clone(),
                text: t.text.clone(),
                start_seconds: t.start,
                end_seconds: t.end,
            })
            .collect()
    }

    /// Chapters in the engine's model
    pub fn chapter_marks(&self) -> Vec<ChapterMark> {
        self.summary_chapters
            .iter()
            .flatten()
            .map(|c| ChapterMark {
                start_seconds: c.start,
                title: c.title.clone(),
            })
            .collect()
    }
}

/// What a successful submission returns
#[derive(Clone, Debug, PartialEq)]
pub struct SubmitResponse {
    pub id: JobId,
    pub status: RemoteStatus,
}

impl From<StatusResponse> for SubmitResponse {
    fn from(response: StatusResponse) -> Self {
        Self {
            id: response.id,
            status: response.status,
        }
    }
}

// =============================================================================
// Submission Options
// =============================================================================

/// Multipart form flags sent with an upload
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitOptions {
    pub app_bundle: String,
    pub user_id: String,
    pub summarize: bool,
    pub sound_studio: bool,
    pub social_content: bool,
    pub export_timestamps: bool,
    pub remove_dead_air: bool,
    pub muted: bool,
    pub transcription: bool,
    pub remove_filler_words: bool,
    pub merge: bool,
    pub video: bool,
    pub export_format: String,
}

impl Default for SubmitOptions {
    fn default() -> Self {
        Self {
            app_bundle: "com.yourapp.bundle".to_string(),
            user_id: "default_user".to_string(),
            summarize: true,
            sound_studio: true,
            social_content: false,
            export_timestamps: false,
            remove_dead_air: false,
            muted: true,
            transcription: true,
            remove_filler_words: true,
            merge: false,
            video: false,
            export_format: "mp3".to_string(),
        }
    }
}

impl SubmitOptions {
    /// Text fields of the multipart form, in wire order
    pub fn form_fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("app_bundle", self.app_bundle.clone()),
            ("summarize", self.summarize.to_string()),
            ("export_format", self.export_format.clone()),
            ("sound_studio", self.sound_studio.to_string()),
            ("social_content", self.social_content.to_string()),
            ("export_timestamps", self.export_timestamps.to_string()),
            ("remove_dead_air", self.remove_dead_air.to_string()),
            ("muted", self.muted.to_string()),
            ("user_id", self.user_id.clone()),
            ("transcription", self.transcription.to_string()),
            ("remove_filler_words", self.remove_filler_words.to_string()),
            ("merge", self.merge.to_string()),
            ("video", self.video.to_string()),
        ]
    }
}

// =============================================================================
// Client Interface
// =============================================================================

/// Remote job processor
#[async_trait]
pub trait RemoteJobClient: Send + Sync {
    /// Uploads `file` and returns the server-assigned job id
    async fn submit(&self, file: &Path, options: &SubmitOptions) -> CoreResult<SubmitResponse>;

    /// Fetches the current status of a job
    async fn fetch_status(&self, id: &str) -> CoreResult<StatusResponse>;

    /// Downloads a result into a new, uniquely named file in `dest_dir`
    async fn download(&self, url: &str, dest_dir: &Path) -> CoreResult<PathBuf>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_response_deserialization() {
        let json = r#"{
            "id": "A1",
            "status": "finished",
            "result": "https://cdn.example.com/A1.mp3",
            "transcriptions": [{"speaker": "S1", "text": "hi", "start": 0.0, "end": 1.2}],
            "summaries": ["short"],
            "summary_chapters": [{"start": 0.0, "title": "Intro"}],
            "error": null
        }"#;

        let resp: StatusResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.status, RemoteStatus::Finished);
        assert_eq!(resp.transcript_segments()[0].speaker_label, "S1");
        assert_eq!(resp.chapter_marks()[0].title, "Intro");
    }

    #[test]
    fn test_status_response_minimal_and_camel_chapters() {
        let resp: StatusResponse =
            serde_json::from_str(r#"{"id": "A1", "status": "queued"}"#).unwrap();
        assert!(resp.transcript_segments().is_empty());
        assert!(resp.chapter_marks().is_empty());

        let resp: StatusResponse = serde_json::from_str(
            r#"{"id": "A1", "status": "finished", "summaryChapters": [{"start": 3.5, "title": "B"}]}"#,
        )
        .unwrap();
        assert_eq!(resp.chapter_marks()[0].start_seconds, 3.5);
    }

    #[test]
    fn test_unknown_status_is_preserved() {
        let resp: StatusResponse =
            serde_json::from_str(r#"{"id": "A1", "status": "paused"}"#).unwrap();
        assert_eq!(resp.status, RemoteStatus::Unknown("paused".into()));
        assert_eq!(resp.status.job_status(), None);
        assert!(!resp.status.is_terminal());
        assert_eq!(serde_json::to_value(&resp.status).unwrap(), "paused");
    }

    #[test]
    fn test_submit_options_form_fields() {
        let fields = SubmitOptions::default().form_fields();
        let names: Vec<_> = fields.iter().map(|(name, _)| *name).collect();
        for expected in [
            "app_bundle",
            "user_id",
            "summarize",
            "sound_studio",
            "social_content",
            "export_timestamps",
            "remove_dead_air",
            "muted",
            "transcription",
            "remove_filler_words",
            "merge",
            "video",
            "export_format",
        ] {
            assert!(names.contains(&expected), "missing {expected}");
        }
        assert!(fields.contains(&("muted", "true".to_string())));
    }
}
