//! Startup Recovery
//!
//! Restarts polling for jobs that were still queued or started when the
//! process last exited, after clearing scratch files left by interrupted
//! downloads and merges.

use tracing::{info, warn};

use crate::core::jobs::JobStore;
use crate::core::poller::{PollRequest, StatusFetchFn, TaskPoller};
use crate::core::settings::PollingSettings;
use crate::core::CoreResult;

/// Resumes every unfinished job. Returns how many loops were started.
pub fn resume_unfinished(
    store: &JobStore,
    poller: &TaskPoller,
    fetch: StatusFetchFn,
    polling: &PollingSettings,
) -> CoreResult<usize> {
    match store.artifacts().purge_scratch() {
        Ok(0) => {}
        Ok(removed) => info!("Removed {} stale scratch files", removed),
        Err(e) => warn!("Failed to purge scratch directory: {}", e),
    }

    let unfinished = store.fetch_unfinished()?;
    let mut started = 0;
    for job in unfinished {
        let request = PollRequest {
            id: job.id.clone(),
            interval: polling.interval(),
            timeout: polling.timeout(),
            media_kind: job.media_kind,
            operation: job.operation,
            local_artifact_path: job.local_artifact_path.clone(),
            duration_seconds: job.duration_seconds,
        };
        if poller.start(request, fetch.clone()) {
            started += 1;
        }
    }

    info!("Resumed polling for {} unfinished jobs", started);
    Ok(started)
}
