//! Desai Core Library
//!
//! Tracks long-running server-side media jobs (audio/video enhancement and
//! transcription) from submission to completion. The library owns the durable
//! job records, the canonical on-device artifacts, one polling loop per remote
//! job, and the reconciliation of server results into local state.
//!
//! The UI is an external collaborator: it drives [`core::engine::JobEngine`]
//! and listens to [`core::events::JobEvent`]s.

pub mod core;

use std::path::Path;
use std::sync::OnceLock;

pub use crate::core::{CoreError, CoreResult};

// =============================================================================
// Logging
// =============================================================================

static LOG_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();

/// Installs the global tracing subscriber.
///
/// Logs go to stderr and to a daily-rolling file in `log_dir`, leaving stdout
/// to the host's own output. The filter is read from `RUST_LOG`, falling back
/// to `default_level`. Calling this more than once is harmless; only the first
/// subscriber is kept.
pub fn init_logging(log_dir: &Path, default_level: tracing::Level) {
    let _ = std::fs::create_dir_all(log_dir);

    let file_appender = tracing_appender::rolling::daily(log_dir, "desai.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = LOG_GUARD.set(guard);

    use tracing_subscriber::prelude::*;

    let env_filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(cfg!(debug_assertions));

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false);

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layer);

    // Avoid panics if already initialized (tests, embedding hosts).
    let _ = tracing::subscriber::set_global_default(subscriber);
}
