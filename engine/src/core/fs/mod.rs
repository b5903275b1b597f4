//! Filesystem utilities.
//!
//! Safe primitives for the engine's on-disk state:
//! - job ids become file names, so they are validated before use;
//! - settings are written with an atomic replace so a crash never leaves a partial file;
//! - artifacts are moved with a rename that falls back to copy + remove across devices.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::core::{CoreError, CoreResult};

// =============================================================================
// Path Validation
// =============================================================================

/// Validates that an identifier is safe to use as a file name component.
///
/// Rejects empty ids, surrounding whitespace, traversal sequences (`..`),
/// path separators, drive letter indicators (`:`) and control characters.
pub fn validate_path_id_component(id: &str, label: &str) -> Result<(), String> {
    let trimmed = id.trim();
    if trimmed.is_empty() {
        return Err(format!("{label} is empty or contains only whitespace"));
    }
    if trimmed.len() != id.len() {
        return Err(format!("Invalid {label}: surrounding whitespace"));
    }
    if trimmed.contains("..")
        || trimmed.contains('/')
        || trimmed.contains('\\')
        || trimmed.contains(':')
    {
        return Err(format!("Invalid {label}: contains path traversal characters"));
    }
    if trimmed.chars().any(|c| c.is_control()) {
        return Err(format!("Invalid {label}: contains control characters"));
    }
    Ok(())
}

/// Validates a remote job id, mapping failures to [`CoreError::InvalidJobId`].
pub fn validate_job_id(id: &str) -> CoreResult<()> {
    validate_path_id_component(id, "jobId")
        .map_err(|reason| CoreError::InvalidJobId(format!("{id:?}: {reason}")))
}

// =============================================================================
// Atomic Writes
// =============================================================================

/// Write bytes to `path` using an atomic replace pattern.
///
/// Writes a sibling temporary file, syncs it, then renames it into place. If the
/// destination exists it is first moved aside as `.bak` and removed afterwards.
pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> CoreResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let tmp_path = sibling_with_suffix(path, "tmp");
    {
        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(bytes)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
    }

    atomic_replace(path, &tmp_path)
}

/// Write a JSON file atomically with pretty formatting.
pub fn atomic_write_json_pretty<T: serde::Serialize>(path: &Path, value: &T) -> CoreResult<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)
}

fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut sibling = path.to_path_buf();
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| suffix.to_string());
    sibling.set_file_name(format!("{file_name}.{suffix}"));
    sibling
}

fn atomic_replace(dest: &Path, src_tmp: &Path) -> CoreResult<()> {
    if !dest.exists() {
        std::fs::rename(src_tmp, dest)?;
        return Ok(());
    }

    // Windows: rename-over-existing may fail depending on filesystem; use a backup swap.
    let bak = sibling_with_suffix(dest, "bak");
    if bak.exists() {
        let _ = std::fs::remove_file(&bak);
    }

    std::fs::rename(dest, &bak)?;
    match std::fs::rename(src_tmp, dest) {
        Ok(()) => {
            let _ = std::fs::remove_file(&bak);
            Ok(())
        }
        Err(e) => {
            let _ = std::fs::rename(&bak, dest);
            let _ = std::fs::remove_file(src_tmp);
            Err(CoreError::IoError(e))
        }
    }
}

// =============================================================================
// Artifact Moves
// =============================================================================

/// Moves `src` to `dest`, replacing any existing file at `dest`.
///
/// Uses a rename when both paths share a filesystem and falls back to
/// copy + remove otherwise. The source never survives a successful move.
pub async fn move_file(src: &Path, dest: &Path) -> CoreResult<()> {
    remove_file_if_exists(dest).await?;

    if tokio::fs::rename(src, dest).await.is_ok() {
        return Ok(());
    }

    tokio::fs::copy(src, dest).await?;
    if let Err(e) = tokio::fs::remove_file(src).await {
        tracing::warn!("Copied {} but failed to remove it: {}", src.display(), e);
    }
    Ok(())
}

/// Removes a file, treating "not found" as success.
pub async fn remove_file_if_exists(path: &Path) -> CoreResult<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(CoreError::IoError(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn atomic_write_bytes_creates_and_replaces() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        atomic_write_bytes(&path, b"one").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "one");

        atomic_write_bytes(&path, b"two").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "two");
        assert!(!path.with_file_name("settings.json.bak").exists());
        assert!(!path.with_file_name("settings.json.tmp").exists());
    }

    // =========================================================================
    // Path Validation Tests
    // =========================================================================

    #[test]
    fn test_validate_path_id_component_valid() {
        assert!(validate_path_id_component("A1", "jobId").is_ok());
        assert!(validate_path_id_component("3f2b6c1e-5d4a-4f7e-9a0b-1c2d3e4f5a6b", "jobId").is_ok());
        assert!(validate_path_id_component("job.with.dots", "jobId").is_ok());
    }

    #[test]
    fn test_validate_path_id_component_rejects_unsafe() {
        assert!(validate_path_id_component("", "jobId").unwrap_err().contains("empty"));
        assert!(validate_path_id_component("..", "jobId")
            .unwrap_err()
            .contains("path traversal"));
        assert!(validate_path_id_component("foo/bar", "jobId").is_err());
        assert!(validate_path_id_component("foo\\bar", "jobId").is_err());
        assert!(validate_path_id_component("C:", "jobId").is_err());
        assert!(validate_path_id_component("a\0b", "jobId").is_err());
        assert!(validate_path_id_component(" A1", "jobId").is_err());
    }

    #[test]
    fn test_validate_job_id_error_variant() {
        assert!(matches!(
            validate_job_id("../etc"),
            Err(CoreError::InvalidJobId(_))
        ));
    }

    #[tokio::test]
    async fn move_file_replaces_destination_and_removes_source() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("download.tmp");
        let dest = dir.path().join("A1.mp3");
        std::fs::write(&src, b"new").unwrap();
        std::fs::write(&dest, b"old").unwrap();

        move_file(&src, &dest).await.unwrap();

        assert!(!src.exists());
        assert_eq!(std::fs::read(&dest).unwrap(), b"new");
    }

    #[tokio::test]
    async fn remove_file_if_exists_ignores_missing() {
        let dir = TempDir::new().unwrap();
        remove_file_if_exists(&dir.path().join("missing")).await.unwrap();
    }
}
