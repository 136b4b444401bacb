//! Single-worker guard for a data directory.

use std::path::{Path, PathBuf};

use anyhow::Context;
use fs4::fs_std::FileExt;

/// Exclusive advisory lock on the worker lock file. Held until dropped.
#[derive(Debug)]
pub struct WorkerLock {
    _file: std::fs::File,
    path: PathBuf,
}

impl WorkerLock {
    /// Take the lock at `path`, creating parent directories as needed.
    /// Fails immediately if another worker holds it.
    pub async fn acquire(path: &Path) -> anyhow::Result<Self> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create data directory: {}", parent.display())
                })?;
            }
            let file = std::fs::File::create(&path)
                .with_context(|| format!("Failed to create lock file: {}", path.display()))?;
            file.try_lock_exclusive().map_err(|_| {
                anyhow::anyhow!(
                    "Another gphotos2immich worker is running on this data directory (lock: {})",
                    path.display()
                )
            })?;
            tracing::debug!(path = %path.display(), "Worker lock acquired");
            Ok(Self { _file: file, path })
        })
        .await?
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_second_worker_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.lock");
        let _held = WorkerLock::acquire(&path).await.unwrap();

        let err = WorkerLock::acquire(&path).await.unwrap_err();
        assert!(
            err.to_string().contains("Another gphotos2immich worker"),
            "Unexpected error: {}",
            err
        );
    }

    #[tokio::test]
    async fn test_lock_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("worker.lock");
        {
            let held = WorkerLock::acquire(&path).await.unwrap();
            assert_eq!(held.path(), path);
        }
        WorkerLock::acquire(&path)
            .await
            .expect("Lock should be released after drop");
    }
}
