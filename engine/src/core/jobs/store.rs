//! Job Store
//!
//! SQLite-backed durable record of every job. The connection sits behind a
//! mutex so every mutation is serialized, and `update` runs its
//! read-modify-write inside a single transaction.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{ChapterMark, Job, JobStatus, TranscriptSegment};
use crate::core::artifacts::ArtifactStore;
use crate::core::events::{EventBus, JobEvent};
use crate::core::fs::validate_job_id;
use crate::core::{CoreError, CoreResult, MediaKind, Operation};

const JOB_COLUMNS: &str = "id, media_kind, operation, status, duration_seconds, \
     local_artifact_path, result_payload, transcript_json, chapters_json, created_at, display_name";

/// Durable job records
pub struct JobStore {
    conn: Mutex<Connection>,
    artifacts: ArtifactStore,
    events: EventBus,
}

impl JobStore {
    /// Open or create the job database at `db_path`
    pub fn open(db_path: &Path, artifacts: ArtifactStore, events: EventBus) -> CoreResult<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_path).map_err(|e| {
            CoreError::Database(format!("Failed to open job store: {}", e))
        })?;

        let store = Self {
            conn: Mutex::new(conn),
            artifacts,
            events,
        };
        store.initialize_schema()?;
        Ok(store)
    }

    /// Open an in-memory store (for testing)
    #[cfg(test)]
    pub fn open_in_memory(artifacts: ArtifactStore, events: EventBus) -> CoreResult<Self> {
        let conn = Connection::open_in_memory().map_err(|e| {
            CoreError::Database(format!("Failed to open in-memory job store: {}", e))
        })?;
        let store = Self {
            conn: Mutex::new(conn),
            artifacts,
            events,
        };
        store.initialize_schema()?;
        Ok(store)
    }

    /// Artifact store used for path repair
    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    /// Event bus the store reports changes on
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    fn initialize_schema(&self) -> CoreResult<()> {
        self.lock()?
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS jobs (
                    id TEXT PRIMARY KEY,
                    media_kind TEXT NOT NULL,
                    operation TEXT NOT NULL,
                    status TEXT NOT NULL,
                    duration_seconds REAL,
                    local_artifact_path TEXT,
                    result_payload TEXT,
                    transcript_json TEXT NOT NULL DEFAULT '[]',
                    chapters_json TEXT NOT NULL DEFAULT '[]',
                    created_at TEXT NOT NULL,
                    display_name TEXT
                );
                CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
                CREATE INDEX IF NOT EXISTS idx_jobs_operation ON jobs(operation);",
            )
            .map_err(|e| {
                CoreError::Database(format!("Failed to initialize job store schema: {}", e))
            })?;
        Ok(())
    }

    fn lock(&self) -> CoreResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| CoreError::Internal("Job store lock poisoned".to_string()))
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Inserts a new job. Returns `false` when a job with the same id exists.
    pub fn create(&self, job: &Job) -> CoreResult<bool> {
        validate_job_id(&job.id)?;
        let row = JobRow::from_job(job)?;

        let inserted = self.lock()?.execute(
            "INSERT OR IGNORE INTO jobs
                (id, media_kind, operation, status, duration_seconds, local_artifact_path,
                 result_payload, transcript_json, chapters_json, created_at, display_name)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                row.id,
                row.media_kind,
                row.operation,
                row.status,
                row.duration_seconds,
                row.local_artifact_path,
                row.result_payload,
                row.transcript_json,
                row.chapters_json,
                row.created_at,
                row.display_name,
            ],
        )?;

        if inserted == 0 {
            tracing::info!("Job {} already exists, skipping create", job.id);
            return Ok(false);
        }

        tracing::info!(
            "Created job {} ({} / {})",
            job.id,
            job.media_kind,
            job.operation
        );
        self.events.emit(JobEvent::StoreChanged);
        Ok(true)
    }

    /// Applies `mutation` to the job atomically.
    ///
    /// Returns `None` when the job does not exist. A failing mutation or an
    /// invalid status transition leaves the record untouched.
    pub fn update<F>(&self, id: &str, mutation: F) -> CoreResult<Option<Job>>
    where
        F: FnOnce(&mut Job) -> CoreResult<()>,
    {
        let (job, changed) = {
            let mut conn = self.lock()?;
            let tx = conn.transaction()?;

            let current = tx
                .query_row(
                    &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                    params![id],
                    JobRow::from_row,
                )
                .optional()?;
            let Some(current) = current else {
                return Ok(None);
            };
            let before = current.into_job()?;

            let mut job = before.clone();
            mutation(&mut job)?;
            job.id = before.id.clone();

            if !before.status.can_transition_to(job.status) {
                return Err(CoreError::InvalidStatusTransition {
                    id: before.id,
                    from: before.status,
                    to: job.status,
                });
            }

            let changed = job != before;
            if changed {
                let row = JobRow::from_job(&job)?;
                tx.execute(
                    "UPDATE jobs SET
                        media_kind = ?2, operation = ?3, status = ?4, duration_seconds = ?5,
                        local_artifact_path = ?6, result_payload = ?7, transcript_json = ?8,
                        chapters_json = ?9, display_name = ?10
                     WHERE id = ?1",
                    params![
                        row.id,
                        row.media_kind,
                        row.operation,
                        row.status,
                        row.duration_seconds,
                        row.local_artifact_path,
                        row.result_payload,
                        row.transcript_json,
                        row.chapters_json,
                        row.display_name,
                    ],
                )?;
            }
            tx.commit()?;
            (job, changed)
        };

        if changed {
            self.events.emit(JobEvent::StoreChanged);
        }
        Ok(Some(job))
    }

    /// Removes a job. Returns `false` when it did not exist.
    pub fn delete(&self, id: &str) -> CoreResult<bool> {
        let removed = self
            .lock()?
            .execute("DELETE FROM jobs WHERE id = ?1", params![id])?;

        if removed == 0 {
            return Ok(false);
        }

        tracing::info!("Deleted job {}", id);
        self.events.emit(JobEvent::StoreChanged);
        Ok(true)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Get a job by id, as stored
    pub fn fetch(&self, id: &str) -> CoreResult<Option<Job>> {
        let row = self
            .lock()?
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![id],
                JobRow::from_row,
            )
            .optional()?;
        row.map(JobRow::into_job).transpose()
    }

    /// All jobs, newest first, with artifact paths repaired
    pub fn fetch_all(&self) -> CoreResult<Vec<Job>> {
        let jobs = self.query_jobs(
            &format!("SELECT {JOB_COLUMNS} FROM jobs ORDER BY created_at DESC, rowid DESC"),
            &[],
        )?;
        self.repair_paths(jobs)
    }

    /// Jobs of one operation, newest first, with artifact paths repaired
    pub fn fetch_by_operation(&self, operation: Operation) -> CoreResult<Vec<Job>> {
        let jobs = self.query_jobs(
            &format!(
                "SELECT {JOB_COLUMNS} FROM jobs WHERE operation = ?1 \
                 ORDER BY created_at DESC, rowid DESC"
            ),
            &[operation.as_str()],
        )?;
        self.repair_paths(jobs)
    }

    /// Jobs the server is still working on
    pub fn fetch_unfinished(&self) -> CoreResult<Vec<Job>> {
        self.query_jobs(
            &format!(
                "SELECT {JOB_COLUMNS} FROM jobs WHERE status IN ('queued', 'started') \
                 ORDER BY created_at DESC, rowid DESC"
            ),
            &[],
        )
    }

    fn query_jobs(&self, sql: &str, args: &[&str]) -> CoreResult<Vec<Job>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(args.iter()), JobRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(JobRow::into_job).collect()
    }

    /// Replaces missing artifact paths with the reconstructed canonical path
    /// when that file exists, else flags the job as broken.
    fn repair_paths(&self, mut jobs: Vec<Job>) -> CoreResult<Vec<Job>> {
        let mut repaired = Vec::new();

        for job in jobs.iter_mut() {
            let recorded = job.local_artifact_path.as_deref();
            if recorded.is_some_and(Path::is_file) {
                continue;
            }

            match self
                .artifacts
                .resolve_existing(&job.id, job.media_kind, recorded)
            {
                Some(path) => {
                    tracing::info!("Repaired artifact path for job {}: {}", job.id, path.display());
                    job.local_artifact_path = Some(path.clone());
                    repaired.push((job.id.clone(), path));
                }
                None => job.broken = true,
            }
        }

        if repaired.is_empty() {
            return Ok(jobs);
        }

        {
            let mut conn = self.lock()?;
            let tx = conn.transaction()?;
            for (id, path) in &repaired {
                tx.execute(
                    "UPDATE jobs SET local_artifact_path = ?2 WHERE id = ?1",
                    params![id, path_to_string(path)],
                )?;
            }
            tx.commit()?;
        }
        self.events.emit(JobEvent::StoreChanged);
        Ok(jobs)
    }
}

// =============================================================================
// Row Mapping
// =============================================================================

/// Raw column values of one `jobs` row
struct JobRow {
    id: String,
    media_kind: String,
    operation: String,
    status: String,
    duration_seconds: Option<f64>,
    local_artifact_path: Option<String>,
    result_payload: Option<String>,
    transcript_json: String,
    chapters_json: String,
    created_at: String,
    display_name: Option<String>,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            media_kind: row.get(1)?,
            operation: row.get(2)?,
            status: row.get(3)?,
            duration_seconds: row.get(4)?,
            local_artifact_path: row.get(5)?,
            result_payload: row.get(6)?,
            transcript_json: row.get(7)?,
            chapters_json: row.get(8)?,
            created_at: row.get(9)?,
            display_name: row.get(10)?,
        })
    }

    fn from_job(job: &Job) -> CoreResult<Self> {
        Ok(Self {
            id: job.id.clone(),
            media_kind: job.media_kind.as_str().to_string(),
            operation: job.operation.as_str().to_string(),
            status: job.status.as_str().to_string(),
            duration_seconds: job.duration_seconds,
            local_artifact_path: job.local_artifact_path.as_deref().map(path_to_string),
            result_payload: job.result_payload.clone(),
            transcript_json: serde_json::to_string(&job.transcript_segments)?,
            chapters_json: serde_json::to_string(&job.chapter_marks)?,
            created_at: job.created_at.to_rfc3339_opts(SecondsFormat::Micros, true),
            display_name: job.display_name.clone(),
        })
    }

    fn into_job(self) -> CoreResult<Job> {
        let corrupt = |field: &str, value: &str| {
            CoreError::Database(format!("Job {} has invalid {}: {:?}", self.id, field, value))
        };

        let media_kind = MediaKind::parse(&self.media_kind)
            .ok_or_else(|| corrupt("media_kind", &self.media_kind))?;
        let operation = Operation::parse(&self.operation)
            .ok_or_else(|| corrupt("operation", &self.operation))?;
        let status =
            JobStatus::parse(&self.status).ok_or_else(|| corrupt("status", &self.status))?;
        let created_at = DateTime::parse_from_rfc3339(&self.created_at)
            .map_err(|_| corrupt("created_at", &self.created_at))?
            .with_timezone(&Utc);
        let transcript_segments: Vec<TranscriptSegment> =
            serde_json::from_str(&self.transcript_json)?;
        let chapter_marks: Vec<ChapterMark> = serde_json::from_str(&self.chapters_json)?;

        Ok(Job {
            id: self.id,
            media_kind,
            operation,
            status,
            duration_seconds: self.duration_seconds,
            local_artifact_path: self.local_artifact_path.map(PathBuf::from),
            result_payload: self.result_payload,
            transcript_segments,
            chapter_marks,
            created_at,
            display_name: self.display_name,
            broken: false,
        })
    }
}

fn path_to_string(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, JobStore) {
        let dir = TempDir::new().unwrap();
        let artifacts = ArtifactStore::open(dir.path().join("artifacts")).unwrap();
        let store = JobStore::open_in_memory(artifacts, EventBus::new()).unwrap();
        (dir, store)
    }

    fn job_at(id: &str, seconds_ago: i64) -> Job {
        let mut job = Job::new(id, MediaKind::Audio, Operation::Transcribe);
        job.created_at = Utc::now() - chrono::Duration::seconds(seconds_ago);
        job
    }

    #[test]
    fn test_create_and_fetch() {
        let (_dir, store) = setup();
        let job = Job::new("A1", MediaKind::Video, Operation::Enhance)
            .with_duration(Some(12.5))
            .with_artifact(PathBuf::from("/tmp/A1.mp4"));

        assert!(store.create(&job).unwrap());

        let fetched = store.fetch("A1").unwrap().unwrap();
        assert_eq!(fetched.id, "A1");
        assert_eq!(fetched.media_kind, MediaKind::Video);
        assert_eq!(fetched.status, JobStatus::Queued);
        assert_eq!(fetched.duration_seconds, Some(12.5));
        assert_eq!(fetched.display_name.as_deref(), Some("A1.mp4"));
        assert_eq!(
            fetched.created_at.timestamp_micros(),
            job.created_at.timestamp_micros()
        );
    }

    #[test]
    fn test_create_duplicate_is_noop() {
        let (_dir, store) = setup();
        let job = Job::new("A1", MediaKind::Audio, Operation::Enhance);

        assert!(store.create(&job).unwrap());
        assert!(!store.create(&job).unwrap());
        assert_eq!(store.fetch_all().unwrap().len(), 1);
    }

    #[test]
    fn test_create_rejects_unsafe_id() {
        let (_dir, store) = setup();
        let job = Job::new("../A1", MediaKind::Audio, Operation::Enhance);
        assert!(matches!(store.create(&job), Err(CoreError::InvalidJobId(_))));
    }

    #[test]
    fn test_update_applies_mutation() {
        let (_dir, store) = setup();
        store
            .create(&Job::new("A1", MediaKind::Audio, Operation::Transcribe))
            .unwrap();

        let updated = store
            .update("A1", |job| {
                job.transition_to(JobStatus::Finished)?;
                job.result_payload = Some("https://example.com/r.mp3".into());
                job.transcript_segments = vec![TranscriptSegment {
                    speaker_label: "S1".into(),
                    text: "hello".into(),
                    start_seconds: 0.0,
                    end_seconds: 1.5,
                }];
                job.chapter_marks = vec![ChapterMark {
                    start_seconds: 0.0,
                    title: "Intro".into(),
                }];
                Ok(())
            })
            .unwrap()
            .unwrap();
        assert_eq!(updated.status, JobStatus::Finished);

        let fetched = store.fetch("A1").unwrap().unwrap();
        assert_eq!(fetched.transcript_segments.len(), 1);
        assert_eq!(fetched.chapter_marks[0].title, "Intro");
        assert_eq!(
            fetched.result_payload.as_deref(),
            Some("https://example.com/r.mp3")
        );
    }

    #[test]
    fn test_update_missing_returns_none() {
        let (_dir, store) = setup();
        assert!(store.update("nope", |_| Ok(())).unwrap().is_none());
    }

    #[test]
    fn test_update_rejects_regression() {
        let (_dir, store) = setup();
        store
            .create(&Job::new("A1", MediaKind::Audio, Operation::Enhance))
            .unwrap();
        store
            .update("A1", |job| {
                job.status = JobStatus::Finished;
                Ok(())
            })
            .unwrap();

        let result = store.update("A1", |job| {
            job.status = JobStatus::Started;
            Ok(())
        });
        assert!(matches!(
            result,
            Err(CoreError::InvalidStatusTransition { .. })
        ));
        assert_eq!(
            store.fetch("A1").unwrap().unwrap().status,
            JobStatus::Finished
        );
    }

    #[test]
    fn test_failed_mutation_leaves_record_untouched() {
        let (_dir, store) = setup();
        store
            .create(&Job::new("A1", MediaKind::Audio, Operation::Enhance))
            .unwrap();

        let result = store.update("A1", |job| {
            job.display_name = Some("changed".into());
            Err(CoreError::ValidationError("nope".into()))
        });

        assert!(result.is_err());
        assert_eq!(store.fetch("A1").unwrap().unwrap().display_name, None);
    }

    #[test]
    fn test_fetch_all_newest_first() {
        let (_dir, store) = setup();
        store.create(&job_at("old", 60)).unwrap();
        store.create(&job_at("new", 0)).unwrap();
        store.create(&job_at("mid", 30)).unwrap();

        let ids: Vec<_> = store
            .fetch_all()
            .unwrap()
            .into_iter()
            .map(|j| j.id)
            .collect();
        assert_eq!(ids, vec!["new", "mid", "old"]);
    }

    #[test]
    fn test_fetch_by_operation_filters() {
        let (_dir, store) = setup();
        store
            .create(&Job::new("E1", MediaKind::Video, Operation::Enhance))
            .unwrap();
        store
            .create(&Job::new("T1", MediaKind::Audio, Operation::Transcribe))
            .unwrap();

        let jobs = store.fetch_by_operation(Operation::Transcribe).unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, "T1");
    }

    #[test]
    fn test_fetch_unfinished() {
        let (_dir, store) = setup();
        for (id, status) in [
            ("Q", JobStatus::Queued),
            ("S", JobStatus::Started),
            ("F", JobStatus::Finished),
        ] {
            let mut job = Job::new(id, MediaKind::Audio, Operation::Enhance);
            job.status = status;
            store.create(&job).unwrap();
        }

        let mut ids: Vec<_> = store
            .fetch_unfinished()
            .unwrap()
            .into_iter()
            .map(|j| j.id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["Q", "S"]);
    }

    #[test]
    fn test_fetch_all_repairs_moved_artifact() {
        let (_dir, store) = setup();
        let canonical = store.artifacts().reconstruct_path("A1", MediaKind::Audio);
        std::fs::write(&canonical, b"audio").unwrap();

        let job = Job::new("A1", MediaKind::Audio, Operation::Enhance)
            .with_artifact(PathBuf::from("/old/container/A1.mp3"));
        store.create(&job).unwrap();

        let jobs = store.fetch_all().unwrap();
        assert_eq!(jobs[0].local_artifact_path.as_ref(), Some(&canonical));
        assert!(!jobs[0].broken);

        // The repaired path is persisted.
        let stored = store.fetch("A1").unwrap().unwrap();
        assert_eq!(stored.local_artifact_path, Some(canonical));
    }

    #[test]
    fn test_fetch_all_flags_unrecoverable_as_broken() {
        let (_dir, store) = setup();
        let job = Job::new("A1", MediaKind::Video, Operation::Enhance)
            .with_artifact(PathBuf::from("/gone/A1.mp4"));
        store.create(&job).unwrap();

        let jobs = store.fetch_all().unwrap();
        assert!(jobs[0].broken);
        assert_eq!(
            jobs[0].local_artifact_path,
            Some(PathBuf::from("/gone/A1.mp4"))
        );
    }

    #[test]
    fn test_delete() {
        let (_dir, store) = setup();
        store
            .create(&Job::new("A1", MediaKind::Audio, Operation::Enhance))
            .unwrap();

        assert!(store.delete("A1").unwrap());
        assert!(!store.delete("A1").unwrap());
        assert!(store.fetch("A1").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_mutations_emit_store_changed() {
        let (_dir, store) = setup();
        let mut rx = store.events().subscribe();

        store
            .create(&Job::new("A1", MediaKind::Audio, Operation::Enhance))
            .unwrap();
        // Identical mutation is idempotent and silent.
        store.update("A1", |_| Ok(())).unwrap();
        store.delete("A1").unwrap();

        assert_eq!(rx.recv().await.unwrap(), JobEvent::StoreChanged);
        assert_eq!(rx.recv().await.unwrap(), JobEvent::StoreChanged);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_reopen_persists_jobs() {
        let dir = TempDir::new().unwrap();
        let artifacts = ArtifactStore::open(dir.path().join("artifacts")).unwrap();
        let db = dir.path().join("jobs.db");

        {
            let store = JobStore::open(&db, artifacts.clone(), EventBus::new()).unwrap();
            store
                .create(&Job::new("A1", MediaKind::Audio, Operation::Enhance))
                .unwrap();
        }

        let store = JobStore::open(&db, artifacts, EventBus::new()).unwrap();
        assert_eq!(store.fetch_unfinished().unwrap().len(), 1);
    }
}
