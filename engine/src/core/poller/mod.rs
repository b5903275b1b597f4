//! Task Poller
//!
//! Runs one cancellable polling loop per remote job id. At most one loop is
//! active per id: a second `start` for an active id is a no-op.
//!
//! Each iteration checks cancellation, then the timeout, then fetches the
//! status and hands the response to a [`StatusSink`] (the
//! [`ResultReconciler`] outside tests), awaiting it before the next fetch. Fetch errors are logged and retried at the same
//! interval until the window closes. When the window closes without a
//! terminal status the job is expired through the reconciler.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::core::reconciler::{JobContext, ReconcileOutcome, ResultReconciler};
use crate::core::remote::{RemoteJobClient, StatusResponse};
use crate::core::{CoreResult, JobId, MediaKind, Operation, TimeSec};

/// Default delay between status checks
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Default polling window
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(600);

pub type StatusFuture = Pin<Box<dyn Future<Output = CoreResult<StatusResponse>> + Send>>;

/// Status-check collaborator invoked once per iteration
pub type StatusFetchFn = Arc<dyn Fn(JobId) -> StatusFuture + Send + Sync>;

/// Adapts a [`RemoteJobClient`] into a [`StatusFetchFn`]
pub fn status_fetcher(client: Arc<dyn RemoteJobClient>) -> StatusFetchFn {
    Arc::new(move |id: JobId| {
        let client = client.clone();
        Box::pin(async move { client.fetch_status(&id).await }) as StatusFuture
    })
}

/// Receives what a polling loop observes
#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn reconcile(
        &self,
        id: &str,
        response: StatusResponse,
        context: &JobContext,
    ) -> ReconcileOutcome;

    /// Called once when the window closes without a terminal status
    async fn expire(&self, id: &str) -> bool;
}

#[async_trait]
impl StatusSink for ResultReconciler {
    async fn reconcile(
        &self,
        id: &str,
        response: StatusResponse,
        context: &JobContext,
    ) -> ReconcileOutcome {
        ResultReconciler::reconcile(self, id, response, context).await
    }

    async fn expire(&self, id: &str) -> bool {
        ResultReconciler::expire(self, id).await
    }
}

/// Everything a polling loop needs to know about its job
#[derive(Clone, Debug, PartialEq)]
pub struct PollRequest {
    pub id: JobId,
    pub interval: Duration,
    pub timeout: Duration,
    pub media_kind: MediaKind,
    pub operation: Operation,
    pub local_artifact_path: Option<PathBuf>,
    pub duration_seconds: Option<TimeSec>,
}

impl PollRequest {
    fn context(&self) -> JobContext {
        JobContext {
            media_kind: self.media_kind,
            operation: self.operation,
            local_artifact_path: self.local_artifact_path.clone(),
            duration_seconds: self.duration_seconds,
        }
    }
}

/// How a polling loop ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PollExit {
    /// A `finished` or `failed` response was reconciled
    TerminalReached,
    /// The window closed first
    TimedOut,
    /// `stop` or `shutdown` was called
    Cancelled,
}

struct ActivePoll {
    token: CancellationToken,
    generation: u64,
}

struct PollerInner {
    sink: Arc<dyn StatusSink>,
    active: Mutex<HashMap<JobId, ActivePoll>>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    next_generation: AtomicU64,
}

impl PollerInner {
    fn active(&self) -> MutexGuard<'_, HashMap<JobId, ActivePoll>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Releases the per-id slot when a loop exits, including by panic
struct SlotGuard {
    inner: Arc<PollerInner>,
    id: JobId,
    generation: u64,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let mut active = self.inner.active();
        if active
            .get(&self.id)
            .is_some_and(|slot| slot.generation == self.generation)
        {
            active.remove(&self.id);
        }
    }
}

/// Polling loop registry
#[derive(Clone)]
pub struct TaskPoller {
    inner: Arc<PollerInner>,
}

impl TaskPoller {
    pub fn new(reconciler: ResultReconciler) -> Self {
        Self::with_sink(Arc::new(reconciler))
    }

    pub fn with_sink(sink: Arc<dyn StatusSink>) -> Self {
        Self {
            inner: Arc::new(PollerInner {
                sink,
                active: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
                tracker: TaskTracker::new(),
                next_generation: AtomicU64::new(0),
            }),
        }
    }

    /// Starts polling `request.id`.
    ///
    /// Returns `false` without side effects when a loop for the id is already
    /// active or the poller has been shut down.
    pub fn start(&self, request: PollRequest, fetch: StatusFetchFn) -> bool {
        if self.inner.shutdown.is_cancelled() {
            warn!("Poller is shut down, not polling {}", request.id);
            return false;
        }

        let (token, generation) = {
            let mut active = self.inner.active();
            if active.contains_key(&request.id) {
                info!("Polling already active for {}", request.id);
                return false;
            }

            let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
            let token = self.inner.shutdown.child_token();
            active.insert(
                request.id.clone(),
                ActivePoll {
                    token: token.clone(),
                    generation,
                },
            );
            (token, generation)
        };

        info!(
            "Polling {} every {:?} for up to {:?}",
            request.id, request.interval, request.timeout
        );

        let guard = SlotGuard {
            inner: self.inner.clone(),
            id: request.id.clone(),
            generation,
        };
        let sink = self.inner.sink.clone();
        self.inner.tracker.spawn(async move {
            let _guard = guard;
            let id = request.id.clone();
            let exit = run_loop(sink, request, fetch, token).await;
            info!("Polling finished for {}: {:?}", id, exit);
            exit
        });
        true
    }

    /// Cancels the loop for `id`. Its slot is released once the loop exits.
    pub fn stop(&self, id: &str) -> bool {
        match self.inner.active().get(id) {
            Some(slot) => {
                slot.token.cancel();
                info!("Stopped polling for {}", id);
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self, id: &str) -> bool {
        self.inner.active().contains_key(id)
    }

    /// Ids with an active loop, sorted
    pub fn active_ids(&self) -> Vec<JobId> {
        let mut ids: Vec<JobId> = self.inner.active().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Cancels every loop and rejects later starts. Does not wait.
    pub fn shutdown(&self) {
        info!("Shutting down poller");
        self.inner.shutdown.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Waits until every loop started so far has exited
    pub async fn wait_idle(&self) {
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        self.inner.tracker.reopen();
    }
}

async fn run_loop(
    sink: Arc<dyn StatusSink>,
    request: PollRequest,
    fetch: StatusFetchFn,
    token: CancellationToken,
) -> PollExit {
    let deadline = Instant::now() + request.timeout;
    let context = request.context();

    loop {
        if token.is_cancelled() {
            return PollExit::Cancelled;
        }

        if Instant::now() >= deadline {
            sink.expire(&request.id).await;
            return PollExit::TimedOut;
        }

        let fetched = tokio::select! {
            biased;
            _ = token.cancelled() => return PollExit::Cancelled,
            fetched = tokio::time::timeout_at(deadline, fetch(request.id.clone())) => fetched,
        };

        match fetched {
            // Window closed mid-request; the next iteration expires the job.
            Err(_) => continue,
            Ok(Err(e)) => warn!("Polling error for {}: {}", request.id, e),
            Ok(Ok(response)) => {
                debug!("Status for {}: {}", request.id, response.status);
                let terminal = response.status.is_terminal();
                sink.reconcile(&request.id, response, &context).await;
                if terminal {
                    return PollExit::TerminalReached;
                }
            }
        }

        let wake = (Instant::now() + request.interval).min(deadline);
        tokio::select! {
            biased;
            _ = token.cancelled() => return PollExit::Cancelled,
            _ = tokio::time::sleep_until(wake) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::events::{CancelReason, JobEvent};
    use crate::core::jobs::JobStatus;
    use crate::core::remote::RemoteStatus;
    use crate::core::testing::{collect_events, Harness};

    fn queued(id: &str) -> StatusResponse {
        StatusResponse::new(id, RemoteStatus::Queued)
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_start_is_noop() {
        let h = Harness::new();
        h.remote.script("A1", vec![queued("A1")]);

        assert!(h.poller.start(h.poll_request("A1", MediaKind::Audio), h.fetch_fn()));
        assert!(!h.poller.start(h.poll_request("A1", MediaKind::Audio), h.fetch_fn()));
        assert_eq!(h.poller.active_ids(), vec!["A1".to_string()]);

        h.poller.stop("A1");
        h.poller.wait_idle().await;
        assert!(!h.poller.is_active("A1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_starts_spawn_one_loop() {
        let h = Harness::new();
        h.remote.script("A1", vec![queued("A1")]);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let poller = h.poller.clone();
            let request = h.poll_request("A1", MediaKind::Audio);
            let fetch = h.fetch_fn();
            handles.push(tokio::spawn(async move { poller.start(request, fetch) }));
        }

        let mut started = 0;
        for handle in handles {
            if handle.await.unwrap() {
                started += 1;
            }
        }
        assert_eq!(started, 1);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(h.remote.fetch_count("A1"), 1);

        h.poller.shutdown();
        h.poller.wait_idle().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_video_enhance_job_runs_to_completion() {
        let h = Harness::new();
        let source = h.persist_source("A1", MediaKind::Video, b"video").await;
        h.insert_job("A1", MediaKind::Video, Some(source.clone()));
        h.remote.set_download_body(b"audio");
        h.remote.script(
            "A1",
            vec![
                queued("A1"),
                StatusResponse::new("A1", RemoteStatus::Started),
                StatusResponse::new("A1", RemoteStatus::Finished)
                    .with_result("https://cdn.example.com/A1.mp3"),
            ],
        );
        let mut rx = h.events.subscribe();

        let mut request = h.poll_request("A1", MediaKind::Video);
        request.local_artifact_path = Some(source.clone());
        h.poller.start(request, h.fetch_fn());
        h.poller.wait_idle().await;
        h.reconciler.drain().await;

        assert_eq!(h.remote.fetch_count("A1"), 3);
        let job = h.store.fetch("A1").unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Finished);
        assert_eq!(job.local_artifact_path.as_ref(), Some(&source));
        assert_eq!(std::fs::read(&source).unwrap(), b"video+audio");
        assert!(h.scratch_is_empty());
        assert!(!h.poller.is_active("A1"));

        let terminal: Vec<_> = collect_events(&mut rx)
            .into_iter()
            .filter(JobEvent::is_terminal)
            .collect();
        assert_eq!(terminal, vec![JobEvent::Finished { id: "A1".into() }]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_deletes_job_once() {
        let h = Harness::new();
        h.insert_job("B2", MediaKind::Audio, None);
        h.remote.script("B2", vec![queued("B2")]);
        let mut rx = h.events.subscribe();

        let started_at = Instant::now();
        h.poller.start(h.poll_request("B2", MediaKind::Audio), h.fetch_fn());
        h.poller.wait_idle().await;

        assert!(started_at.elapsed() >= Duration::from_secs(600));
        assert!(h.store.fetch("B2").unwrap().is_none());
        // One fetch at t=0 and one after every 5 s sleep before the deadline.
        assert_eq!(h.remote.fetch_count("B2"), 120);

        let cancellations: Vec<_> = collect_events(&mut rx)
            .into_iter()
            .filter(JobEvent::is_terminal)
            .collect();
        assert_eq!(
            cancellations,
            vec![JobEvent::Cancelled {
                id: "B2".into(),
                reason: CancelReason::Timeout
            }]
        );
        assert!(!h.poller.is_active("B2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_errors_are_retried() {
        let h = Harness::new();
        h.insert_job("A1", MediaKind::Audio, None);
        h.remote.script_error_then(
            "A1",
            "connection reset",
            vec![StatusResponse::new("A1", RemoteStatus::Failed).with_error("bad input")],
        );

        h.poller.start(h.poll_request("A1", MediaKind::Audio), h.fetch_fn());
        h.poller.wait_idle().await;

        assert_eq!(h.remote.fetch_count("A1"), 2);
        assert!(h.store.fetch("A1").unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_leaves_store_untouched() {
        let h = Harness::new();
        h.insert_job("A1", MediaKind::Audio, None);
        h.remote.script("A1", vec![queued("A1")]);

        h.poller.start(h.poll_request("A1", MediaKind::Audio), h.fetch_fn());
        tokio::time::sleep(Duration::from_secs(12)).await;
        assert!(h.poller.stop("A1"));
        h.poller.wait_idle().await;

        assert!(!h.poller.is_active("A1"));
        assert!(h.store.fetch("A1").unwrap().is_some());
        assert!(!h.poller.stop("A1"));

        // The slot is free again.
        assert!(h.poller.start(h.poll_request("A1", MediaKind::Audio), h.fetch_fn()));
        h.poller.stop("A1");
        h.poller.wait_idle().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_rejects_new_starts() {
        let h = Harness::new();
        h.remote.script("A1", vec![queued("A1")]);
        h.poller.start(h.poll_request("A1", MediaKind::Audio), h.fetch_fn());

        h.poller.shutdown();
        h.poller.wait_idle().await;

        assert!(h.poller.is_shut_down());
        assert!(h.poller.active_ids().is_empty());
        assert!(!h.poller.start(h.poll_request("B1", MediaKind::Audio), h.fetch_fn()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_fetch_never_outlives_deadline() {
        let h = Harness::new();
        h.insert_job("A1", MediaKind::Audio, None);

        let fetch: StatusFetchFn = Arc::new(|_id: JobId| {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(StatusResponse::new("A1", RemoteStatus::Queued))
            }) as StatusFuture
        });

        let mut request = h.poll_request("A1", MediaKind::Audio);
        request.timeout = Duration::from_secs(30);
        let started_at = Instant::now();
        h.poller.start(request, fetch);
        h.poller.wait_idle().await;

        assert!(started_at.elapsed() < Duration::from_secs(31));
        assert!(h.store.fetch("A1").unwrap().is_none());
    }

    /// Holds every reconciliation until the gate is opened
    struct GatedSink {
        inner: ResultReconciler,
        gate: Arc<tokio::sync::Notify>,
    }

    #[async_trait]
    impl StatusSink for GatedSink {
        async fn reconcile(
            &self,
            id: &str,
            response: StatusResponse,
            context: &JobContext,
        ) -> ReconcileOutcome {
            self.gate.notified().await;
            self.inner.reconcile(id, response, context).await
        }

        async fn expire(&self, id: &str) -> bool {
            self.inner.expire(id).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_fetch_waits_for_reconciliation() {
        let h = Harness::new();
        h.insert_job("A1", MediaKind::Audio, None);
        h.remote.script("A1", vec![queued("A1")]);
        let gate = Arc::new(tokio::sync::Notify::new());
        let poller = TaskPoller::with_sink(Arc::new(GatedSink {
            inner: h.reconciler.clone(),
            gate: gate.clone(),
        }));

        poller.start(h.poll_request("A1", MediaKind::Audio), h.fetch_fn());
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(h.remote.fetch_count("A1"), 1);

        gate.notify_one();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(h.remote.fetch_count("A1"), 1);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(h.remote.fetch_count("A1"), 2);

        poller.shutdown();
        gate.notify_one();
        poller.wait_idle().await;
        assert_eq!(h.remote.fetch_count("A1"), 2);
    }
}
