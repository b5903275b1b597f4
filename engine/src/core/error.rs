//! Desai Error Definitions
//!
//! Defines error types used throughout the engine.

use std::fmt;

use thiserror::Error;

use super::ffmpeg::FFmpegError;
use super::jobs::JobStatus;
use super::JobId;

/// Core engine error types
#[derive(Error, Debug)]
pub enum CoreError {
    // =========================================================================
    // Job Errors
    // =========================================================================
    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("Invalid job id: {0}")]
    InvalidJobId(String),

    #[error("Invalid status transition for job {id}: {from} -> {to}")]
    InvalidStatusTransition {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Job is still being processed: {0}")]
    JobInProgress(JobId),

    #[error("Database error: {0}")]
    Database(String),

    // =========================================================================
    // Remote Errors
    // =========================================================================
    /// The processor or result host answered with a non-success status
    #[error("Remote API error ({status}): {message}")]
    RemoteHttp { status: u16, message: String },

    /// The request never produced a response
    #[error("Network error ({kind}): {message}")]
    Transport {
        kind: TransportFailure,
        message: String,
    },

    #[error("Invalid remote response: {0}")]
    InvalidRemoteResponse(String),

    #[error("Not authorized to submit jobs")]
    NotAuthorized,

    // =========================================================================
    // Artifact Errors
    // =========================================================================
    #[error("Artifact missing for job {0}")]
    ArtifactMissing(JobId),

    #[error("Media processing failed: {0}")]
    Media(#[from] FFmpegError),

    // =========================================================================
    // General Errors
    // =========================================================================
    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Why a request failed before a response arrived
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportFailure {
    Timeout,
    Connect,
    Other,
}

impl fmt::Display for TransportFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportFailure::Timeout => write!(f, "timeout"),
            TransportFailure::Connect => write!(f, "connection"),
            TransportFailure::Other => write!(f, "network"),
        }
    }
}

/// Core engine result type
pub type CoreResult<T> = Result<T, CoreError>;

impl From<rusqlite::Error> for CoreError {
    fn from(err: rusqlite::Error) -> Self {
        CoreError::Database(err.to_string())
    }
}

impl CoreError {
    /// Returns true when the error is likely transient and the request may be retried.
    ///
    /// Decided from the HTTP status or transport failure kind only; message
    /// text is never inspected.
    pub fn is_retryable(&self) -> bool {
        match self {
            CoreError::RemoteHttp { status, .. } => matches!(status, 429 | 502 | 503 | 504),
            CoreError::Transport { kind, .. } => {
                matches!(kind, TransportFailure::Timeout | TransportFailure::Connect)
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CoreError::JobNotFound("A1".to_string());
        assert_eq!(err.to_string(), "Job not found: A1");

        let err = CoreError::InvalidStatusTransition {
            id: "A1".to_string(),
            from: JobStatus::Finished,
            to: JobStatus::Started,
        };
        assert!(err.to_string().contains("finished -> started"));
    }

    fn http(status: u16, message: &str) -> CoreError {
        CoreError::RemoteHttp {
            status,
            message: message.to_string(),
        }
    }

    #[test]
    fn test_retryable_classification() {
        assert!(http(503, "busy").is_retryable());
        assert!(http(429, "slow down").is_retryable());
        assert!(!http(400, "bad file").is_retryable());
        assert!(CoreError::Transport {
            kind: TransportFailure::Timeout,
            message: "operation timed out".into(),
        }
        .is_retryable());
        assert!(!CoreError::Transport {
            kind: TransportFailure::Other,
            message: "builder error".into(),
        }
        .is_retryable());
        assert!(!CoreError::NotAuthorized.is_retryable());
    }

    #[test]
    fn test_client_error_body_text_does_not_make_it_retryable() {
        assert!(!http(400, "connection to storage refused").is_retryable());
        assert!(!http(422, "upstream returned 503, timed out").is_retryable());
        assert!(!CoreError::InvalidRemoteResponse("connection 504".into()).is_retryable());
    }

    #[test]
    fn test_remote_error_display() {
        assert_eq!(
            http(413, "File too large").to_string(),
            "Remote API error (413): File too large"
        );
        let err = CoreError::Transport {
            kind: TransportFailure::Connect,
            message: "refused".into(),
        };
        assert_eq!(err.to_string(), "Network error (connection): refused");
    }

    #[test]
    fn test_sqlite_error_maps_to_database() {
        let err: CoreError = rusqlite::Error::InvalidQuery.into();
        assert!(matches!(err, CoreError::Database(_)));
    }
}
