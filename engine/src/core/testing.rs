//! Test doubles and fixtures shared by the engine's unit tests.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::broadcast;

use crate::core::artifacts::ArtifactStore;
use crate::core::events::{EventBus, JobEvent};
use crate::core::ffmpeg::{FFmpegError, FFmpegResult, MediaAssembler};
use crate::core::jobs::{Job, JobStore};
use crate::core::poller::{status_fetcher, PollRequest, StatusFetchFn, TaskPoller};
use crate::core::reconciler::ResultReconciler;
use crate::core::remote::{
    RemoteJobClient, RemoteStatus, StatusResponse, SubmitOptions, SubmitResponse,
};
use crate::core::{
    CoreError, CoreResult, JobId, MediaKind, Operation, TimeSec, TransportFailure,
};

// =============================================================================
// Scripted Remote
// =============================================================================

#[derive(Clone)]
enum Scripted {
    Respond(StatusResponse),
    Error(String),
}

/// A submission seen by [`MockRemote`]
#[derive(Clone, Debug)]
pub struct RecordedSubmission {
    pub file: PathBuf,
    pub file_existed: bool,
    pub options: SubmitOptions,
}

/// Remote job processor with scripted status responses.
///
/// Each id replays its script in order; the last entry repeats forever.
/// Ids without a script fail every status check.
#[derive(Default)]
pub struct MockRemote {
    scripts: Mutex<HashMap<JobId, VecDeque<Scripted>>>,
    fetch_counts: Mutex<HashMap<JobId, usize>>,
    submit_ids: Mutex<VecDeque<JobId>>,
    submit_error: Mutex<Option<(u16, String)>>,
    submissions: Mutex<Vec<RecordedSubmission>>,
    download_body: Mutex<Vec<u8>>,
    download_error: Mutex<Option<u16>>,
    download_calls: AtomicUsize,
}

impl MockRemote {
    pub fn script(&self, id: &str, responses: Vec<StatusResponse>) {
        self.scripts.lock().unwrap().insert(
            id.to_string(),
            responses.into_iter().map(Scripted::Respond).collect(),
        );
    }

    /// Scripts a transport error before the given responses
    pub fn script_error_then(&self, id: &str, error: &str, responses: Vec<StatusResponse>) {
        let mut script: VecDeque<Scripted> = VecDeque::new();
        script.push_back(Scripted::Error(error.to_string()));
        script.extend(responses.into_iter().map(Scripted::Respond));
        self.scripts.lock().unwrap().insert(id.to_string(), script);
    }

    pub fn fetch_count(&self, id: &str) -> usize {
        self.fetch_counts
            .lock()
            .unwrap()
            .get(id)
            .copied()
            .unwrap_or(0)
    }

    pub fn queue_submit_id(&self, id: &str) {
        self.submit_ids.lock().unwrap().push_back(id.to_string());
    }

    pub fn fail_submissions(&self, status: u16, message: &str) {
        *self.submit_error.lock().unwrap() = Some((status, message.to_string()));
    }

    pub fn submissions(&self) -> Vec<RecordedSubmission> {
        self.submissions.lock().unwrap().clone()
    }

    pub fn set_download_body(&self, body: &[u8]) {
        *self.download_body.lock().unwrap() = body.to_vec();
    }

    pub fn fail_downloads(&self, status: u16) {
        *self.download_error.lock().unwrap() = Some(status);
    }

    pub fn download_calls(&self) -> usize {
        self.download_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteJobClient for MockRemote {
    async fn submit(&self, file: &Path, options: &SubmitOptions) -> CoreResult<SubmitResponse> {
        self.submissions.lock().unwrap().push(RecordedSubmission {
            file: file.to_path_buf(),
            file_existed: file.exists(),
            options: options.clone(),
        });

        if let Some((status, message)) = self.submit_error.lock().unwrap().clone() {
            return Err(CoreError::RemoteHttp { status, message });
        }

        let id = self
            .submit_ids
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        Ok(SubmitResponse {
            id,
            status: RemoteStatus::Queued,
        })
    }

    async fn fetch_status(&self, id: &str) -> CoreResult<StatusResponse> {
        *self
            .fetch_counts
            .lock()
            .unwrap()
            .entry(id.to_string())
            .or_default() += 1;

        let next = {
            let mut scripts = self.scripts.lock().unwrap();
            match scripts.get_mut(id) {
                Some(script) if script.len() > 1 => script.pop_front(),
                Some(script) => script.front().cloned(),
                None => None,
            }
        };

        match next {
            Some(Scripted::Respond(response)) => Ok(response),
            Some(Scripted::Error(message)) => Err(CoreError::Transport {
                kind: TransportFailure::Connect,
                message,
            }),
            None => Err(CoreError::RemoteHttp {
                status: 404,
                message: format!("no scripted response for {id}"),
            }),
        }
    }

    async fn download(&self, _url: &str, dest_dir: &Path) -> CoreResult<PathBuf> {
        self.download_calls.fetch_add(1, Ordering::SeqCst);

        if let Some(status) = *self.download_error.lock().unwrap() {
            return Err(CoreError::RemoteHttp {
                status,
                message: "download failed".to_string(),
            });
        }

        let body = self.download_body.lock().unwrap().clone();
        let path = dest_dir.join(format!("{}.mp3", uuid::Uuid::new_v4()));
        tokio::fs::write(&path, body).await?;
        Ok(path)
    }
}

// =============================================================================
// Fake Assembler
// =============================================================================

/// Assembler that concatenates inputs instead of running FFmpeg.
///
/// A merge writes `{video bytes}+{audio bytes}`; an extraction copies the video.
#[derive(Default)]
pub struct MockAssembler {
    merge_calls: AtomicUsize,
    extract_calls: AtomicUsize,
    fail_merge: AtomicBool,
    fail_probe: AtomicBool,
}

impl MockAssembler {
    pub const DURATION: TimeSec = 42.0;

    pub fn merge_calls(&self) -> usize {
        self.merge_calls.load(Ordering::SeqCst)
    }

    pub fn extract_calls(&self) -> usize {
        self.extract_calls.load(Ordering::SeqCst)
    }

    pub fn fail_merges(&self) {
        self.fail_merge.store(true, Ordering::SeqCst);
    }

    pub fn fail_probes(&self) {
        self.fail_probe.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl MediaAssembler for MockAssembler {
    async fn extract_audio(&self, video: &Path, out_dir: &Path) -> FFmpegResult<PathBuf> {
        self.extract_calls.fetch_add(1, Ordering::SeqCst);
        let output = out_dir.join(format!("{}.m4a", uuid::Uuid::new_v4()));
        tokio::fs::copy(video, &output).await?;
        Ok(output)
    }

    async fn merge_audio(
        &self,
        video: &Path,
        audio: &Path,
        out_dir: &Path,
    ) -> FFmpegResult<PathBuf> {
        self.merge_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_merge.load(Ordering::SeqCst) {
            return Err(FFmpegError::ExecutionFailed("Audio merge failed".to_string()));
        }

        let mut merged = tokio::fs::read(video).await?;
        merged.push(b'+');
        merged.extend(tokio::fs::read(audio).await?);

        let output = out_dir.join(format!("{}.mp4", uuid::Uuid::new_v4()));
        tokio::fs::write(&output, merged).await?;
        Ok(output)
    }

    async fn probe_duration(&self, _input: &Path) -> FFmpegResult<TimeSec> {
        if self.fail_probe.load(Ordering::SeqCst) {
            return Err(FFmpegError::ProbeError("unreadable".to_string()));
        }
        Ok(Self::DURATION)
    }
}

// =============================================================================
// Harness
// =============================================================================

/// Fully wired engine components over a temp directory and in-memory SQLite
pub struct Harness {
    pub dir: TempDir,
    pub artifacts: ArtifactStore,
    pub events: EventBus,
    pub store: Arc<JobStore>,
    pub remote: Arc<MockRemote>,
    pub assembler: Arc<MockAssembler>,
    pub reconciler: ResultReconciler,
    pub poller: TaskPoller,
}

impl Harness {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let artifacts = ArtifactStore::open(dir.path().join("artifacts")).unwrap();
        let events = EventBus::new();
        let store =
            Arc::new(JobStore::open_in_memory(artifacts.clone(), events.clone()).unwrap());
        let remote = Arc::new(MockRemote::default());
        let assembler = Arc::new(MockAssembler::default());
        let reconciler = ResultReconciler::new(store.clone(), remote.clone(), assembler.clone());
        let poller = TaskPoller::new(reconciler.clone());

        Self {
            dir,
            artifacts,
            events,
            store,
            remote,
            assembler,
            reconciler,
            poller,
        }
    }

    /// Inserts a queued job; `false` if the id already exists
    pub fn insert_job(&self, id: &str, kind: MediaKind, path: Option<PathBuf>) -> bool {
        self.insert_job_for(id, kind, Operation::Enhance, path)
    }

    pub fn insert_job_for(
        &self,
        id: &str,
        kind: MediaKind,
        operation: Operation,
        path: Option<PathBuf>,
    ) -> bool {
        let mut job = Job::new(id, kind, operation);
        if let Some(path) = path {
            job = job.with_artifact(path);
        }
        self.store.create(&job).unwrap()
    }

    /// Writes `bytes` as the canonical source for `id`
    pub async fn persist_source(&self, id: &str, kind: MediaKind, bytes: &[u8]) -> PathBuf {
        let source = self.dir.path().join(format!("picked-{id}.{}", kind.extension()));
        std::fs::write(&source, bytes).unwrap();
        self.artifacts.persist_source(&source, id, kind).await.unwrap()
    }

    pub fn scratch_is_empty(&self) -> bool {
        std::fs::read_dir(self.artifacts.scratch_dir())
            .unwrap()
            .next()
            .is_none()
    }

    pub fn fetch_fn(&self) -> StatusFetchFn {
        status_fetcher(self.remote.clone())
    }

    /// Poll request with the production defaults (5 s interval, 600 s timeout)
    pub fn poll_request(&self, id: &str, kind: MediaKind) -> PollRequest {
        PollRequest {
            id: id.to_string(),
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(600),
            media_kind: kind,
            operation: Operation::Enhance,
            local_artifact_path: None,
            duration_seconds: None,
        }
    }
}

/// Drains every event currently buffered in `rx`
pub fn collect_events(rx: &mut broadcast::Receiver<JobEvent>) -> Vec<JobEvent> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => events.push(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
    events
}
