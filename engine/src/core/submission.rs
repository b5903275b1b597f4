//! Job Submission
//!
//! Uploads a picked file to the remote processor and turns the accepted
//! submission into a queued job with a canonical artifact and an active
//! polling loop. A submission that fails at any step leaves no job behind.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::core::ffmpeg::MediaAssembler;
use crate::core::fs::{remove_file_if_exists, validate_job_id};
use crate::core::jobs::{Job, JobStore};
use crate::core::poller::{PollRequest, StatusFetchFn, TaskPoller};
use crate::core::remote::{RemoteJobClient, SubmitOptions};
use crate::core::settings::EngineSettings;
use crate::core::{CoreError, CoreResult, MediaKind, Operation, TimeSec};

// =============================================================================
// Authorization
// =============================================================================

/// Decides whether the user may start new jobs (e.g. an active subscription)
#[async_trait]
pub trait AuthorizationGate: Send + Sync {
    async fn is_authorized(&self) -> bool;
}

/// Gate that authorizes everything
#[derive(Clone, Copy, Debug, Default)]
pub struct AllowAll;

#[async_trait]
impl AuthorizationGate for AllowAll {
    async fn is_authorized(&self) -> bool {
        true
    }
}

// =============================================================================
// Requests
// =============================================================================

/// User-facing enhancement toggles
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnhanceOptions {
    pub sound_studio: bool,
    /// Trim long pauses
    pub remove_dead_air: bool,
    pub remove_filler_words: bool,
}

impl Default for EnhanceOptions {
    fn default() -> Self {
        Self {
            sound_studio: true,
            remove_dead_air: false,
            remove_filler_words: true,
        }
    }
}

/// A file to process
#[derive(Clone, Debug, PartialEq)]
pub struct SubmitRequest {
    pub source: PathBuf,
    pub media_kind: MediaKind,
    pub operation: Operation,
    pub options: EnhanceOptions,
}

impl SubmitRequest {
    pub fn new(source: impl Into<PathBuf>, media_kind: MediaKind, operation: Operation) -> Self {
        Self {
            source: source.into(),
            media_kind,
            operation,
            options: EnhanceOptions::default(),
        }
    }

    pub fn with_options(mut self, options: EnhanceOptions) -> Self {
        self.options = options;
        self
    }
}

/// Identity and cadence applied to every submission
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubmitterConfig {
    pub app_bundle: String,
    pub user_id: String,
    pub export_format: String,
    pub poll_interval: Duration,
    pub poll_timeout: Duration,
}

impl SubmitterConfig {
    pub fn from_settings(settings: &EngineSettings) -> Self {
        Self {
            app_bundle: settings.remote.app_bundle.clone(),
            user_id: settings.remote.user_id.clone(),
            export_format: settings.remote.export_format.clone(),
            poll_interval: settings.polling.interval(),
            poll_timeout: settings.polling.timeout(),
        }
    }
}

impl Default for SubmitterConfig {
    fn default() -> Self {
        Self::from_settings(&EngineSettings::default())
    }
}

/// Form flags for a kind/operation pair.
///
/// Enhancing follows the user's toggles; video enhancement mutes the original
/// track since the result is merged back. Transcription never edits the audio.
pub fn preset_options(
    kind: MediaKind,
    operation: Operation,
    options: &EnhanceOptions,
    config: &SubmitterConfig,
) -> SubmitOptions {
    let base = SubmitOptions {
        app_bundle: config.app_bundle.clone(),
        user_id: config.user_id.clone(),
        summarize: true,
        social_content: false,
        export_timestamps: false,
        transcription: true,
        merge: false,
        video: false,
        export_format: config.export_format.clone(),
        ..SubmitOptions::default()
    };

    match operation {
        Operation::Enhance => SubmitOptions {
            sound_studio: options.sound_studio,
            remove_dead_air: options.remove_dead_air,
            remove_filler_words: options.remove_filler_words,
            muted: kind == MediaKind::Video,
            ..base
        },
        Operation::Transcribe => SubmitOptions {
            sound_studio: kind == MediaKind::Audio,
            remove_dead_air: false,
            remove_filler_words: false,
            muted: false,
            ..base
        },
    }
}

// =============================================================================
// Submitter
// =============================================================================

/// Uploads files and registers the resulting jobs
#[derive(Clone)]
pub struct JobSubmitter {
    store: Arc<JobStore>,
    remote: Arc<dyn RemoteJobClient>,
    assembler: Arc<dyn MediaAssembler>,
    poller: TaskPoller,
    fetch: StatusFetchFn,
    gate: Arc<dyn AuthorizationGate>,
    config: SubmitterConfig,
}

impl JobSubmitter {
    pub fn new(
        store: Arc<JobStore>,
        remote: Arc<dyn RemoteJobClient>,
        assembler: Arc<dyn MediaAssembler>,
        poller: TaskPoller,
        fetch: StatusFetchFn,
        config: SubmitterConfig,
    ) -> Self {
        Self {
            store,
            remote,
            assembler,
            poller,
            fetch,
            gate: Arc::new(AllowAll),
            config,
        }
    }

    pub fn with_gate(mut self, gate: Arc<dyn AuthorizationGate>) -> Self {
        self.gate = gate;
        self
    }

    pub fn config(&self) -> &SubmitterConfig {
        &self.config
    }

    /// Submits `request` and returns the queued job
    pub async fn submit(&self, request: SubmitRequest) -> CoreResult<Job> {
        if !self.gate.is_authorized().await {
            return Err(CoreError::NotAuthorized);
        }
        if !request.source.is_file() {
            return Err(CoreError::ValidationError(format!(
                "Source file not found: {}",
                request.source.display()
            )));
        }

        let duration = self.probe(&request.source).await;

        let extracted = match request.media_kind {
            MediaKind::Video => Some(
                self.assembler
                    .extract_audio(&request.source, &self.store.artifacts().scratch_dir())
                    .await?,
            ),
            MediaKind::Audio => None,
        };

        let upload = extracted.as_deref().unwrap_or(&request.source);
        let result = self.register(&request, upload, duration).await;

        if let Some(path) = &extracted {
            if let Err(e) = remove_file_if_exists(path).await {
                warn!("Failed to remove extracted audio {}: {}", path.display(), e);
            }
        }

        result
    }

    async fn probe(&self, source: &Path) -> Option<TimeSec> {
        match self.assembler.probe_duration(source).await {
            Ok(duration) if duration.is_finite() && duration > 0.0 => Some(duration),
            Ok(_) => None,
            Err(e) => {
                warn!("Could not probe duration of {}: {}", source.display(), e);
                None
            }
        }
    }

    async fn register(
        &self,
        request: &SubmitRequest,
        upload: &Path,
        duration: Option<TimeSec>,
    ) -> CoreResult<Job> {
        let options = preset_options(
            request.media_kind,
            request.operation,
            &request.options,
            &self.config,
        );
        let response = self.remote.submit(upload, &options).await?;
        validate_job_id(&response.id)?;
        info!(
            "Submitted {} for {} as job {}",
            request.source.display(),
            request.operation,
            response.id
        );

        // A reused id must not clobber the media of the job that owns it.
        if let Some(existing) = self.store.fetch(&response.id)? {
            warn!(
                "Job {} already exists, keeping the stored record and its media",
                existing.id
            );
            if existing.is_unfinished() {
                self.start_polling(&existing);
            }
            return Ok(existing);
        }

        let canonical = self
            .store
            .artifacts()
            .persist_source(&request.source, &response.id, request.media_kind)
            .await?;

        let job = Job::new(response.id.as_str(), request.media_kind, request.operation)
            .with_artifact(canonical)
            .with_duration(duration);

        if !self.store.create(&job)? {
            return Err(CoreError::Internal(format!(
                "Job {} was created concurrently",
                job.id
            )));
        }

        self.start_polling(&job);
        Ok(job)
    }

    fn start_polling(&self, job: &Job) {
        self.poller.start(
            PollRequest {
                id: job.id.clone(),
                interval: self.config.poll_interval,
                timeout: self.config.poll_timeout,
                media_kind: job.media_kind,
                operation: job.operation,
                local_artifact_path: job.local_artifact_path.clone(),
                duration_seconds: job.duration_seconds,
            },
            self.fetch.clone(),
        );
    }
}
