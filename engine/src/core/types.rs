//! Desai Core Type Definitions
//!
//! Fundamental identifiers and enumerations shared by every component.

use serde::{Deserialize, Serialize};

// =============================================================================
// ID Types
// =============================================================================

/// Job identifier, assigned by the remote job processor at submission time
pub type JobId = String;

/// Time in seconds (floating point)
pub type TimeSec = f64;

// =============================================================================
// Job Classification
// =============================================================================

/// Which local artifact pipeline applies to a job
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    /// Extension of the canonical artifact file for this kind
    pub fn extension(self) -> &'static str {
        match self {
            MediaKind::Video => "mp4",
            MediaKind::Audio => "mp3",
        }
    }

    /// Stable storage name
    pub fn as_str(self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }

    /// Parses a stored name
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "audio" => Some(MediaKind::Audio),
            "video" => Some(MediaKind::Video),
            _ => None,
        }
    }
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the server does with the uploaded media
///
/// Transcribe jobs keep the original media; enhance jobs replace (audio) or
/// re-mux (video) it with the server result.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    #[serde(alias = "editing")]
    Enhance,
    #[serde(alias = "transcribing")]
    Transcribe,
}

impl Operation {
    /// Stable storage name
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Enhance => "enhance",
            Operation::Transcribe => "transcribe",
        }
    }

    /// Parses a stored name, accepting the legacy names as well
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "enhance" | "editing" => Some(Operation::Enhance),
            "transcribe" | "transcribing" => Some(Operation::Transcribe),
            _ => None,
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
