//! Result Reconciler
//!
//! Applies remote status responses to the job store. Reconciliation never
//! fails from the caller's point of view: problems are logged and surface as
//! store state and [`JobEvent`]s.
//!
//! A `finished` response is applied in one store mutation (status, result URL,
//! transcript and chapters). Downloading and materializing the result then
//! runs as a tracked follow-up task so the poller is not held up by large
//! transfers or FFmpeg.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::core::events::{CancelReason, JobEvent};
use crate::core::ffmpeg::MediaAssembler;
use crate::core::fs::remove_file_if_exists;
use crate::core::jobs::{Job, JobStatus, JobStore};
use crate::core::remote::{HttpJobClient, RemoteJobClient, RemoteStatus, StatusResponse};
use crate::core::{CoreError, CoreResult, MediaKind, Operation, TimeSec};

/// What the poller knew about a job when it started polling
#[derive(Clone, Debug, PartialEq)]
pub struct JobContext {
    pub media_kind: MediaKind,
    pub operation: Operation,
    pub local_artifact_path: Option<PathBuf>,
    pub duration_seconds: Option<TimeSec>,
}

/// Effect of one reconciled response
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// A queued record was created from the poll context
    Created,
    /// Nothing to change
    Unchanged,
    /// Status moved forward
    Updated,
    /// The job failed remotely and was removed
    Removed,
    /// Finished was recorded and the result follow-up is running
    FinishScheduled,
    /// The job was already finished; no second follow-up
    AlreadyFinished,
    /// No record exists for the id
    Missing,
    /// The store refused the change
    Rejected,
    /// Status not understood
    Ignored,
}

/// Result of materializing a finished job locally
enum Materialized {
    Stored(PathBuf),
    MissingArtifact,
}

/// Applies status responses and owns the finished follow-ups
#[derive(Clone)]
pub struct ResultReconciler {
    store: Arc<JobStore>,
    remote: Arc<dyn RemoteJobClient>,
    assembler: Arc<dyn MediaAssembler>,
    followups: TaskTracker,
}

impl ResultReconciler {
    pub fn new(
        store: Arc<JobStore>,
        remote: Arc<dyn RemoteJobClient>,
        assembler: Arc<dyn MediaAssembler>,
    ) -> Self {
        Self {
            store,
            remote,
            assembler,
            followups: TaskTracker::new(),
        }
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    /// Applies one status response for `id`
    pub async fn reconcile(
        &self,
        id: &str,
        response: StatusResponse,
        context: &JobContext,
    ) -> ReconcileOutcome {
        if response.id != id {
            warn!(
                "Status response for {} carries id {}, applying to {}",
                id, response.id, id
            );
        }

        match &response.status {
            RemoteStatus::Queued => self.apply_queued(id, context),
            RemoteStatus::Started => self.apply_started(id),
            RemoteStatus::Failed => self.apply_failed(id, &response).await,
            RemoteStatus::Finished => self.apply_finished(id, &response),
            RemoteStatus::Unknown(status) => {
                warn!("Unknown status for job {}: {}", id, status);
                ReconcileOutcome::Ignored
            }
        }
    }

    /// Drops a job whose polling window ran out.
    ///
    /// Returns `true` when a record was removed. Finished jobs are kept.
    pub async fn expire(&self, id: &str) -> bool {
        let job = match self.store.fetch(id) {
            Ok(Some(job)) => job,
            Ok(None) => return false,
            Err(e) => {
                error!("Failed to load job {} on timeout: {}", id, e);
                return false;
            }
        };

        if job.status == JobStatus::Finished {
            return false;
        }

        info!("Timeout reached, removing unfinished job {}", id);
        if !self.discard(id, job.media_kind).await {
            return false;
        }
        self.emit(JobEvent::Cancelled {
            id: id.to_string(),
            reason: CancelReason::Timeout,
        });
        true
    }

    /// Waits for every running follow-up
    pub async fn drain(&self) {
        self.followups.close();
        self.followups.wait().await;
        self.followups.reopen();
    }

    // =========================================================================
    // Status Handlers
    // =========================================================================

    fn apply_queued(&self, id: &str, context: &JobContext) -> ReconcileOutcome {
        match self.store.fetch(id) {
            Ok(Some(_)) => ReconcileOutcome::Unchanged,
            Ok(None) => {
                let mut job = Job::new(id, context.media_kind, context.operation)
                    .with_duration(context.duration_seconds);
                if let Some(path) = &context.local_artifact_path {
                    job = job.with_artifact(path.clone());
                }
                match self.store.create(&job) {
                    Ok(true) => ReconcileOutcome::Created,
                    Ok(false) => ReconcileOutcome::Unchanged,
                    Err(e) => {
                        error!("Failed to create queued job {}: {}", id, e);
                        ReconcileOutcome::Rejected
                    }
                }
            }
            Err(e) => {
                error!("Failed to load job {}: {}", id, e);
                ReconcileOutcome::Rejected
            }
        }
    }

    fn apply_started(&self, id: &str) -> ReconcileOutcome {
        let mut was_started = false;
        let result = self.store.update(id, |job| {
            was_started = job.status == JobStatus::Started;
            job.transition_to(JobStatus::Started)
        });

        match result {
            Ok(Some(_)) if was_started => ReconcileOutcome::Unchanged,
            Ok(Some(_)) => {
                info!("Job {} started", id);
                ReconcileOutcome::Updated
            }
            Ok(None) => ReconcileOutcome::Missing,
            Err(e) => {
                debug!("Ignoring started for job {}: {}", id, e);
                ReconcileOutcome::Rejected
            }
        }
    }

    async fn apply_failed(&self, id: &str, response: &StatusResponse) -> ReconcileOutcome {
        let reason = response
            .error
            .clone()
            .unwrap_or_else(|| "Remote processing failed".to_string());

        match self.store.update(id, |job| job.transition_to(JobStatus::Failed)) {
            Ok(Some(job)) => {
                warn!("Job {} failed remotely: {}", id, reason);
                self.discard(id, job.media_kind).await;
                self.emit(JobEvent::Failed {
                    id: id.to_string(),
                    error: reason,
                });
                ReconcileOutcome::Removed
            }
            Ok(None) => ReconcileOutcome::Missing,
            Err(e) => {
                error!("Failed to record failure of job {}: {}", id, e);
                ReconcileOutcome::Rejected
            }
        }
    }

    fn apply_finished(&self, id: &str, response: &StatusResponse) -> ReconcileOutcome {
        let transcript = response.transcript_segments();
        let chapters = response.chapter_marks();
        let result_url = response.result.clone();

        let mut already_finished = false;
        let result = self.store.update(id, |job| {
            if job.status == JobStatus::Finished {
                already_finished = true;
                return Ok(());
            }
            job.transition_to(JobStatus::Finished)?;
            job.result_payload = result_url;
            job.transcript_segments = transcript;
            job.chapter_marks = chapters;
            Ok(())
        });

        match result {
            Ok(Some(_)) if already_finished => ReconcileOutcome::AlreadyFinished,
            Ok(Some(job)) => {
                info!("Job {} finished, materializing result", id);
                let this = self.clone();
                self.followups.spawn(async move { this.complete(job).await });
                ReconcileOutcome::FinishScheduled
            }
            Ok(None) => ReconcileOutcome::Missing,
            Err(e) => {
                error!("Failed to record completion of job {}: {}", id, e);
                ReconcileOutcome::Rejected
            }
        }
    }

    // =========================================================================
    // Finished Follow-up
    // =========================================================================

    /// Stores the result of a freshly finished job.
    ///
    /// Enhance jobs download the result and replace (audio) or re-mux (video)
    /// the local media. Transcribe jobs keep the source untouched; their
    /// transcript and chapters were already written by the finishing mutation.
    /// `job` is the snapshot taken by that mutation.
    async fn complete(self, job: Job) {
        let id = job.id.clone();

        let outcome = match job.operation {
            Operation::Transcribe => self.retain_source(&job),
            Operation::Enhance => {
                let url = match job.result_payload.as_deref() {
                    Some(url) if HttpJobClient::validate_download_url(url).is_ok() => {
                        url.to_string()
                    }
                    other => {
                        warn!("Job {} finished without a usable result: {:?}", id, other);
                        self.cancel(&id, job.media_kind, CancelReason::MissingResult)
                            .await;
                        return;
                    }
                };
                self.materialize(&job, &url).await
            }
        };

        match outcome {
            Ok(Materialized::Stored(path)) => {
                info!("Result for job {} stored at {}", id, path.display());
                self.emit(JobEvent::Finished { id });
            }
            Ok(Materialized::MissingArtifact) => {
                warn!("Local media for job {} not found anywhere", id);
                self.cancel(&id, job.media_kind, CancelReason::MissingArtifact)
                    .await;
            }
            Err(e) => {
                error!("Failed to materialize result for job {}: {}", id, e);
                self.fail(&id, job.media_kind, e.to_string()).await;
            }
        }
    }

    fn retain_source(&self, job: &Job) -> CoreResult<Materialized> {
        Ok(match self.locate_source(job)? {
            Some(path) => Materialized::Stored(path),
            None => Materialized::MissingArtifact,
        })
    }

    /// Finds the job's local media, persisting a repaired path when the
    /// recorded one is stale
    fn locate_source(&self, job: &Job) -> CoreResult<Option<PathBuf>> {
        let recorded = job.local_artifact_path.as_deref();
        let Some(found) = self
            .store
            .artifacts()
            .resolve_existing(&job.id, job.media_kind, recorded)
        else {
            return Ok(None);
        };

        if recorded != Some(found.as_path()) {
            info!("Restored missing media for job {} at {}", job.id, found.display());
            let repaired = found.clone();
            self.store.update(&job.id, |j| {
                j.local_artifact_path = Some(repaired);
                Ok(())
            })?;
        }
        Ok(Some(found))
    }

    async fn materialize(&self, job: &Job, url: &str) -> CoreResult<Materialized> {
        let artifacts = self.store.artifacts();
        let downloaded = self.remote.download(url, &artifacts.scratch_dir()).await?;

        let result = match job.media_kind {
            MediaKind::Video => self.materialize_video(job, &downloaded).await,
            MediaKind::Audio => {
                let path = artifacts
                    .persist_result(&downloaded, &job.id, MediaKind::Audio)
                    .await?;
                self.record_artifact(&job.id, path.clone())?;
                Ok(Materialized::Stored(path))
            }
        };

        if let Err(e) = remove_file_if_exists(&downloaded).await {
            warn!("Failed to remove download {}: {}", downloaded.display(), e);
        }
        result
    }

    async fn materialize_video(&self, job: &Job, downloaded: &Path) -> CoreResult<Materialized> {
        let artifacts = self.store.artifacts();
        let Some(video) = self.locate_source(job)? else {
            return Ok(Materialized::MissingArtifact);
        };

        let merged = self
            .assembler
            .merge_audio(&video, downloaded, &artifacts.scratch_dir())
            .await?;

        let persisted = artifacts
            .persist_result(&merged, &job.id, MediaKind::Video)
            .await;
        let path = match persisted {
            Ok(path) => path,
            Err(e) => {
                let _ = remove_file_if_exists(&merged).await;
                return Err(e);
            }
        };

        self.record_artifact(&job.id, path.clone())?;
        Ok(Materialized::Stored(path))
    }

    fn record_artifact(&self, id: &str, path: PathBuf) -> CoreResult<()> {
        let updated = self.store.update(id, |job| {
            job.set_artifact(path);
            Ok(())
        })?;
        match updated {
            Some(_) => Ok(()),
            None => Err(CoreError::JobNotFound(id.to_string())),
        }
    }

    // =========================================================================
    // Removal
    // =========================================================================

    async fn cancel(&self, id: &str, kind: MediaKind, reason: CancelReason) {
        if self.discard(id, kind).await {
            self.emit(JobEvent::Cancelled {
                id: id.to_string(),
                reason,
            });
        }
    }

    async fn fail(&self, id: &str, kind: MediaKind, reason: String) {
        if let Err(e) = self.store.update(id, |job| job.transition_to(JobStatus::Failed)) {
            warn!("Failed to mark job {} as failed: {}", id, e);
        }
        if self.discard(id, kind).await {
            self.emit(JobEvent::Failed {
                id: id.to_string(),
                error: reason,
            });
        }
    }

    /// Deletes the record and its canonical artifact. Returns `true` if a record was removed.
    async fn discard(&self, id: &str, kind: MediaKind) -> bool {
        let removed = match self.store.delete(id) {
            Ok(removed) => removed,
            Err(e) => {
                error!("Failed to delete job {}: {}", id, e);
                return false;
            }
        };

        if let Err(e) = self.store.artifacts().remove(id, kind).await {
            warn!("Failed to remove artifact of job {}: {}", id, e);
        }
        removed
    }

    fn emit(&self, event: JobEvent) {
        self.store.events().emit(event);
    }
}

impl std::fmt::Debug for ResultReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultReconciler")
            .field("followups", &self.followups.len())
            .finish_non_exhaustive()
    }
}
