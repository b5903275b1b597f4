//! Artifact Store Module
//!
//! Canonical on-device media for each job. Every job owns at most one file,
//! `{id}.{ext}`, directly under the artifact directory. Downloads and
//! intermediate files live in the `.scratch` subdirectory, which is purged on
//! startup and never holds canonical content.

use std::path::{Path, PathBuf};

use crate::core::fs::{move_file, remove_file_if_exists, validate_job_id};
use crate::core::{CoreError, CoreResult, MediaKind};

/// Name of the ephemeral subdirectory
pub const SCRATCH_DIR_NAME: &str = ".scratch";

/// Canonical artifact storage
#[derive(Clone, Debug)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    /// Opens (and creates) the artifact directory
    pub fn open(root: impl Into<PathBuf>) -> CoreResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(root.join(SCRATCH_DIR_NAME))?;
        Ok(Self { root })
    }

    /// Artifact directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory for ephemeral downloads and intermediate files
    pub fn scratch_dir(&self) -> PathBuf {
        self.root.join(SCRATCH_DIR_NAME)
    }

    /// Deterministic canonical path for a job.
    ///
    /// The extension comes from `kind` alone; sources keep their own container
    /// bytes, so an audio source picked as m4a is still stored as `{id}.mp3`.
    pub fn reconstruct_path(&self, id: &str, kind: MediaKind) -> PathBuf {
        self.root.join(format!("{}.{}", id, kind.extension()))
    }

    /// Returns the recorded path if it exists, else the reconstructed path if that exists
    pub fn resolve_existing(
        &self,
        id: &str,
        kind: MediaKind,
        recorded: Option<&Path>,
    ) -> Option<PathBuf> {
        if let Some(path) = recorded {
            if path.is_file() {
                return Some(path.to_path_buf());
            }
        }

        if validate_job_id(id).is_err() {
            return None;
        }
        let reconstructed = self.reconstruct_path(id, kind);
        reconstructed.is_file().then_some(reconstructed)
    }

    /// Copies a picked or recorded source into the canonical location.
    ///
    /// Any previous canonical file is replaced. When `source` already is the
    /// canonical file nothing is copied.
    pub async fn persist_source(
        &self,
        source: &Path,
        id: &str,
        kind: MediaKind,
    ) -> CoreResult<PathBuf> {
        validate_job_id(id)?;
        let dest = self.reconstruct_path(id, kind);

        if same_file(source, &dest).await {
            return Ok(dest);
        }
        if !tokio::fs::try_exists(source).await.unwrap_or(false) {
            return Err(CoreError::ValidationError(format!(
                "Source file not found: {}",
                source.display()
            )));
        }

        remove_file_if_exists(&dest).await?;
        tokio::fs::copy(source, &dest).await?;

        tracing::info!("Persisted source for job {} at {}", id, dest.display());
        Ok(dest)
    }

    /// Moves a downloaded or merged file into the canonical location.
    ///
    /// The ephemeral original does not survive a successful call.
    pub async fn persist_result(
        &self,
        downloaded: &Path,
        id: &str,
        kind: MediaKind,
    ) -> CoreResult<PathBuf> {
        validate_job_id(id)?;
        let dest = self.reconstruct_path(id, kind);

        if same_file(downloaded, &dest).await {
            return Ok(dest);
        }

        move_file(downloaded, &dest).await?;

        tracing::info!("Persisted result for job {} at {}", id, dest.display());
        Ok(dest)
    }

    /// Deletes the canonical file for a job
    pub async fn remove(&self, id: &str, kind: MediaKind) -> CoreResult<()> {
        validate_job_id(id)?;
        remove_file_if_exists(&self.reconstruct_path(id, kind)).await
    }

    /// Deletes everything in the scratch directory
    pub fn purge_scratch(&self) -> CoreResult<usize> {
        let scratch = self.scratch_dir();
        let mut removed = 0;

        match std::fs::read_dir(&scratch) {
            Ok(entries) => {
                for entry in entries.flatten() {
                    let path = entry.path();
                    let result = if path.is_dir() {
                        std::fs::remove_dir_all(&path)
                    } else {
                        std::fs::remove_file(&path)
                    };
                    match result {
                        Ok(()) => removed += 1,
                        Err(e) => {
                            tracing::warn!("Failed to purge {}: {}", path.display(), e)
                        }
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(CoreError::IoError(e)),
        }

        std::fs::create_dir_all(&scratch)?;
        if removed > 0 {
            tracing::info!("Purged {} scratch entries", removed);
        }
        Ok(removed)
    }
}

async fn same_file(a: &Path, b: &Path) -> bool {
    match (
        tokio::fs::canonicalize(a).await,
        tokio::fs::canonicalize(b).await,
    ) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}
