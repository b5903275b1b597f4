//! Job Engine
//!
//! Wires the store, artifact directory, remote client, FFmpeg assembler,
//! poller and reconciler together from [`EngineSettings`] and exposes the
//! operations a front end needs.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::info;

use crate::core::artifacts::ArtifactStore;
use crate::core::events::{EventBus, JobEvent};
use crate::core::ffmpeg::{FfmpegAssembler, MediaAssembler};
use crate::core::fs::remove_file_if_exists;
use crate::core::jobs::{Job, JobStatus, JobStore};
use crate::core::poller::{status_fetcher, StatusFetchFn, TaskPoller};
use crate::core::reconciler::ResultReconciler;
use crate::core::recovery;
use crate::core::remote::{HttpJobClient, RemoteJobClient};
use crate::core::settings::EngineSettings;
use crate::core::submission::{AuthorizationGate, JobSubmitter, SubmitRequest, SubmitterConfig};
use crate::core::{CoreError, CoreResult, Operation};

/// Facade over every engine component
#[derive(Clone)]
pub struct JobEngine {
    settings: EngineSettings,
    store: Arc<JobStore>,
    reconciler: ResultReconciler,
    poller: TaskPoller,
    fetch: StatusFetchFn,
    submitter: JobSubmitter,
}

impl JobEngine {
    /// Opens the engine with the HTTP client and detected FFmpeg
    pub fn open(settings: EngineSettings) -> CoreResult<Self> {
        let remote = HttpJobClient::new(settings.remote.request_timeout())?
            .with_base_url(settings.remote.base_url.clone());
        let assembler = FfmpegAssembler::detect(
            settings.ffmpeg.ffmpeg_path.as_deref(),
            settings.ffmpeg.ffprobe_path.as_deref(),
        );
        Self::with_clients(settings, Arc::new(remote), Arc::new(assembler))
    }

    /// Opens the engine with explicit collaborators
    pub fn with_clients(
        mut settings: EngineSettings,
        remote: Arc<dyn RemoteJobClient>,
        assembler: Arc<dyn MediaAssembler>,
    ) -> CoreResult<Self> {
        settings.normalize();
        std::fs::create_dir_all(&settings.storage.data_dir)?;

        let artifacts = ArtifactStore::open(settings.storage.artifacts_dir())?;
        let events = EventBus::new();
        let store = Arc::new(JobStore::open(
            &settings.storage.database_path(),
            artifacts,
            events,
        )?);

        let reconciler = ResultReconciler::new(store.clone(), remote.clone(), assembler.clone());
        let poller = TaskPoller::new(reconciler.clone());
        let fetch = status_fetcher(remote.clone());
        let submitter = JobSubmitter::new(
            store.clone(),
            remote,
            assembler,
            poller.clone(),
            fetch.clone(),
            SubmitterConfig::from_settings(&settings),
        );

        info!(
            "Job engine ready at {}",
            settings.storage.data_dir.display()
        );

        Ok(Self {
            settings,
            store,
            reconciler,
            poller,
            fetch,
            submitter,
        })
    }

    /// Replaces the authorization gate used for new submissions
    pub fn with_gate(mut self, gate: Arc<dyn AuthorizationGate>) -> Self {
        self.submitter = self.submitter.with_gate(gate);
        self
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn poller(&self) -> &TaskPoller {
        &self.poller
    }

    // =========================================================================
    // Jobs
    // =========================================================================

    pub async fn submit(&self, request: SubmitRequest) -> CoreResult<Job> {
        self.submitter.submit(request).await
    }

    /// All jobs, newest first
    pub fn list(&self) -> CoreResult<Vec<Job>> {
        self.store.fetch_all()
    }

    pub fn list_by_operation(&self, operation: Operation) -> CoreResult<Vec<Job>> {
        self.store.fetch_by_operation(operation)
    }

    pub fn get(&self, id: &str) -> CoreResult<Job> {
        self.store
            .fetch(id)?
            .ok_or_else(|| CoreError::JobNotFound(id.to_string()))
    }

    /// Changes the user-facing name of a job
    pub fn rename(&self, id: &str, name: &str) -> CoreResult<Job> {
        let name = name.trim();
        if name.is_empty() {
            return Err(CoreError::ValidationError(
                "Display name must not be empty".to_string(),
            ));
        }

        self.store
            .update(id, |job| {
                job.display_name = Some(name.to_string());
                Ok(())
            })?
            .ok_or_else(|| CoreError::JobNotFound(id.to_string()))
    }

    /// Deletes a finished job and its artifact.
    ///
    /// Jobs the server is still working on cannot be deleted.
    pub async fn delete(&self, id: &str) -> CoreResult<()> {
        let job = self.get(id)?;
        if self.poller.is_active(id) || !job.status.is_terminal() {
            return Err(CoreError::JobInProgress(id.to_string()));
        }

        self.store.delete(id)?;
        self.store.artifacts().remove(id, job.media_kind).await?;
        if let Some(recorded) = &job.local_artifact_path {
            if recorded.starts_with(self.store.artifacts().root()) {
                remove_file_if_exists(recorded).await?;
            }
        }
        Ok(())
    }

    /// Local file of a finished job
    pub fn open_artifact(&self, id: &str) -> CoreResult<PathBuf> {
        let job = self.get(id)?;
        if job.status != JobStatus::Finished {
            return Err(CoreError::ArtifactMissing(id.to_string()));
        }

        self.store
            .artifacts()
            .resolve_existing(id, job.media_kind, job.local_artifact_path.as_deref())
            .ok_or_else(|| CoreError::ArtifactMissing(id.to_string()))
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Restarts polling for jobs left unfinished by a previous run
    pub fn resume_unfinished(&self) -> CoreResult<usize> {
        recovery::resume_unfinished(
            &self.store,
            &self.poller,
            self.fetch.clone(),
            &self.settings.polling,
        )
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.store.events().subscribe()
    }

    /// Cancels every polling loop. Running follow-ups are not interrupted.
    pub fn shutdown(&self) {
        self.poller.shutdown();
    }

    /// Waits for polling loops and then for result follow-ups
    pub async fn wait_idle(&self) {
        self.poller.wait_idle().await;
        self.reconciler.drain().await;
    }
}
