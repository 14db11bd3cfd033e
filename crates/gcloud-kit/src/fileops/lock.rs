//! File-based advisory locking with RAII release.
//!
//! Uses `fs2` for cross-platform exclusive file locks. The lock file is
//! created on first acquire and left in place; only the lock itself is
//! released when the returned [`LockGuard`] is dropped, so a process waiting
//! on the same file never ends up holding a lock on an unlinked inode.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs2::FileExt;

use crate::errors::{GcloudError, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A file-based advisory lock.
pub struct FileLock {
    path: PathBuf,
}

/// RAII guard that holds an exclusive file lock until dropped.
#[derive(Debug)]
pub struct LockGuard {
    file: File,
}

impl FileLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Lock file placed next to `target`, e.g. `token.json` → `token.json.lock`.
    pub fn beside(target: &Path) -> Self {
        let mut name = target.file_name().unwrap_or_default().to_os_string();
        name.push(".lock");
        Self::new(target.with_file_name(name))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Try to acquire an exclusive lock without waiting.
    ///
    /// If the lock is already held by another process/thread, returns
    /// [`GcloudError::LockConflict`].
    pub fn acquire(&self) -> Result<LockGuard> {
        let file = self.open()?;
        file.try_lock_exclusive()
            .map_err(|_| GcloudError::LockConflict {
                path: self.path.clone(),
            })?;
        Ok(LockGuard { file })
    }

    /// Acquire the lock, polling until `timeout` elapses.
    pub async fn acquire_timeout(&self, timeout: Duration) -> Result<LockGuard> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.acquire() {
                Ok(guard) => return Ok(guard),
                Err(GcloudError::LockConflict { .. }) if Instant::now() < deadline => {
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn open(&self) -> Result<File> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        Ok(OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.path)?)
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}
