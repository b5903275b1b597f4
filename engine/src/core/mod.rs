//! Desai Core Engine
//!
//! Job persistence, artifact materialization, remote polling and result
//! reconciliation.

pub mod artifacts;
pub mod engine;
pub mod events;
pub mod ffmpeg;
pub mod fs;
pub mod jobs;
pub mod poller;
pub mod reconciler;
pub mod recovery;
pub mod remote;
pub mod settings;
pub mod submission;

// Re-export common types
mod types;
pub use types::*;

mod error;
pub use error::*;

#[cfg(test)]
pub(crate) mod testing;
