//! Job Event Module
//!
//! Typed lifecycle notifications for whoever drives the engine. Every job ends
//! with exactly one terminal event: `Finished`, `Cancelled` or `Failed`.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::core::JobId;

// =============================================================================
// Event Types
// =============================================================================

/// Event names used when forwarding events to a frontend
pub mod event_names {
    /// Job result materialized locally
    pub const JOB_FINISHED: &str = "job:finished";
    /// Job removed without a result (timeout, missing result or artifact)
    pub const JOB_CANCELLED: &str = "job:cancelled";
    /// Job failed remotely or while materializing its result
    pub const JOB_FAILED: &str = "job:failed";
    /// The persisted job list changed
    pub const STORE_CHANGED: &str = "store:changed";
}

/// Why a job was dropped without a result
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CancelReason {
    /// No terminal status within the polling window
    Timeout,
    /// Finished without a usable result URL
    MissingResult,
    /// The local video to merge into is gone
    MissingArtifact,
}

/// Engine event
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum JobEvent {
    Finished { id: JobId },
    Cancelled { id: JobId, reason: CancelReason },
    Failed { id: JobId, error: String },
    StoreChanged,
}

impl JobEvent {
    /// Frontend event name
    pub fn name(&self) -> &'static str {
        match self {
            JobEvent::Finished { .. } => event_names::JOB_FINISHED,
            JobEvent::Cancelled { .. } => event_names::JOB_CANCELLED,
            JobEvent::Failed { .. } => event_names::JOB_FAILED,
            JobEvent::StoreChanged => event_names::STORE_CHANGED,
        }
    }

    /// Job the event refers to, if any
    pub fn job_id(&self) -> Option<&str> {
        match self {
            JobEvent::Finished { id }
            | JobEvent::Cancelled { id, .. }
            | JobEvent::Failed { id, .. } => Some(id),
            JobEvent::StoreChanged => None,
        }
    }

    /// True for the three job-ending events
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobEvent::StoreChanged)
    }
}

// =============================================================================
// Event Bus
// =============================================================================

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Broadcasts [`JobEvent`]s to every subscriber.
///
/// Emitting with no subscribers is not an error; slow subscribers observe
/// `RecvError::Lagged` rather than blocking the engine.
#[derive(Clone, Debug)]
pub struct EventBus {
    sender: broadcast::Sender<JobEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: JobEvent) {
        tracing::debug!(event = event.name(), job_id = ?event.job_id(), "Emitting event");
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
