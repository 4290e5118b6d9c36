// src/finalize.rs

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::OwnedMutexGuard;

use crate::models::FailureKind;

/// Errors while moving a completed artifact into the final directory.
#[derive(Debug, Error)]
pub enum FinalizeError {
    /// The pre-existing destination file could not be removed (or appeared
    /// without authorization). Not retryable.
    #[error("cannot overwrite existing file {path}: {source}")]
    CannotOverwrite {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The rename into the destination directory failed. The staged file is
    /// left intact for manual recovery.
    #[error("moving staged file into place failed: {0}")]
    MoveFailed(#[from] std::io::Error),
}

impl FinalizeError {
    pub fn kind(&self) -> FailureKind {
        match self {
            FinalizeError::CannotOverwrite { .. } => FailureKind::CannotOverwrite,
            FinalizeError::MoveFailed(_) => FailureKind::MoveFailed,
        }
    }
}

/// Mutual exclusion keyed by normalized final path.
///
/// Two jobs targeting the same destination file would otherwise race on the
/// delete+rename in `commit`; holding the per-path lock across the
/// collision-check-to-finalize sequence prevents that.
pub struct PathLocks {
    locks: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl PathLocks {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn hold(&self) -> MutexGuard<'_, HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>> {
        self.locks.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Component-wise normalization; exact-path equality is the collision
    /// criterion, so no case folding or symlink chasing here.
    fn normalize(path: &Path) -> PathBuf {
        path.components().collect()
    }

    /// Acquires the lock for `path`, waiting if another job holds it.
    pub async fn acquire(&self, path: &Path) -> OwnedMutexGuard<()> {
        let entry = {
            let mut locks = self.hold();
            // Drop entries nobody is waiting on so the map tracks live paths.
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks
                .entry(Self::normalize(path))
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        entry.lock_owned().await
    }
}

impl Default for PathLocks {
    fn default() -> Self {
        Self::new()
    }
}

/// Moves the completed staged file to its final path.
///
/// If `overwrite` was authorized, the existing destination file is removed
/// first; then the staged file is renamed into place. On failure the staged
/// file is never deleted without a confirmed destination copy.
pub async fn commit(
    staged: &Path,
    final_path: &Path,
    overwrite: bool,
) -> Result<(), FinalizeError> {
    if let Some(parent) = final_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    match tokio::fs::metadata(final_path).await {
        Ok(_) if overwrite => {
            tokio::fs::remove_file(final_path).await.map_err(|source| {
                FinalizeError::CannotOverwrite {
                    path: final_path.to_path_buf(),
                    source,
                }
            })?;
        }
        Ok(_) => {
            // A file appeared at the destination without an overwrite grant.
            return Err(FinalizeError::CannotOverwrite {
                path: final_path.to_path_buf(),
                source: std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    "destination exists and overwrite was not authorized",
                ),
            });
        }
        Err(_) => {}
    }

    tokio::fs::rename(staged, final_path).await?;
    Ok(())
}

/// Best-effort removal of a staged artifact after cancellation or before a
/// retry attempt. Failure is ignored by design.
pub async fn discard_staged(staged: &Path) {
    if let Err(e) = tokio::fs::remove_file(staged).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::debug!(path = %staged.display(), error = %e, "staged file cleanup failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn commit_moves_staged_file_into_place() {
        let dir = TempDir::new().unwrap();
        let staged = dir.path().join("clip.mp4.part");
        let final_path = dir.path().join("done").join("clip.mp4");
        tokio::fs::write(&staged, b"payload").await.unwrap();

        commit(&staged, &final_path, false).await.unwrap();

        assert_eq!(tokio::fs::read(&final_path).await.unwrap(), b"payload");
        assert!(!staged.exists());
    }

    #[tokio::test]
    async fn commit_replaces_destination_when_overwrite_authorized() {
        let dir = TempDir::new().unwrap();
        let staged = dir.path().join("clip.mp4.part");
        let final_path = dir.path().join("clip.mp4");
        tokio::fs::write(&staged, b"new").await.unwrap();
        tokio::fs::write(&final_path, b"old").await.unwrap();

        commit(&staged, &final_path, true).await.unwrap();

        assert_eq!(tokio::fs::read(&final_path).await.unwrap(), b"new");
        assert!(!staged.exists());
    }

    #[tokio::test]
    async fn commit_refuses_unauthorized_overwrite_and_keeps_staged_file() {
        let dir = TempDir::new().unwrap();
        let staged = dir.path().join("clip.mp4.part");
        let final_path = dir.path().join("clip.mp4");
        tokio::fs::write(&staged, b"new").await.unwrap();
        tokio::fs::write(&final_path, b"old").await.unwrap();

        let err = commit(&staged, &final_path, false).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::CannotOverwrite);
        // Existing file untouched, staged file intact for recovery.
        assert_eq!(tokio::fs::read(&final_path).await.unwrap(), b"old");
        assert_eq!(tokio::fs::read(&staged).await.unwrap(), b"new");
    }

    #[tokio::test]
    async fn path_locks_serialize_same_path() {
        let locks = Arc::new(PathLocks::new());
        let path = PathBuf::from("/final/clip.mp4");

        let guard = locks.acquire(&path).await;
        let contender = {
            let locks = locks.clone();
            let path = path.clone();
            tokio::spawn(async move {
                let _guard = locks.acquire(&path).await;
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!contender.is_finished());
        drop(guard);
        contender.await.unwrap();
    }

    #[tokio::test]
    async fn path_locks_distinguish_distinct_paths() {
        let locks = PathLocks::new();
        let _a = locks.acquire(Path::new("/final/a.mp4")).await;
        // Must not deadlock.
        let _b = locks.acquire(Path::new("/final/b.mp4")).await;
    }

    #[tokio::test]
    async fn discard_staged_ignores_missing_file() {
        discard_staged(Path::new("/nonexistent/by.construction.part")).await;
    }
}
