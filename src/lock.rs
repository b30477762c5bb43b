//! Workspace lock.
//!
//! One lock file per workspace, taken with an OS advisory exclusive lock
//! (`flock` on unix, `LockFileEx` on windows). The daemon takes it once and
//! holds it for its lifetime; the fallback path takes the same file for a
//! single operation. The lock is released when the handle is dropped, or by
//! the OS when the holding process dies.

use std::fs::{File, OpenOptions, TryLockError};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::error::{OpsError, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug)]
pub struct WorkspaceLock {
    path: PathBuf,
    file: File,
}

impl WorkspaceLock {
    /// Takes the lock or fails immediately with `LockUnavailable`.
    pub fn try_acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // No truncate: the current holder's pid stays readable until we win.
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        match file.try_lock() {
            Ok(()) => {}
            Err(TryLockError::WouldBlock) => {
                return Err(OpsError::LockUnavailable {
                    path: path.to_path_buf(),
                })
            }
            Err(TryLockError::Error(e)) => return Err(OpsError::Io(e)),
        }

        file.set_len(0)?;
        writeln!(file, "pid={}", std::process::id())?;
        file.sync_data()?;

        info!(path = %path.display(), pid = std::process::id(), "workspace lock acquired");
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    /// Retries [`try_acquire`](Self::try_acquire) until `timeout` elapses.
    ///
    /// A zero timeout is a single attempt.
    pub async fn acquire(path: &Path, timeout: Duration) -> Result<Self> {
        let deadline = Instant::now() + timeout;
        loop {
            match Self::try_acquire(path) {
                Err(OpsError::LockUnavailable { .. }) if Instant::now() < deadline => {
                    debug!(path = %path.display(), "workspace lock busy, retrying");
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
                other => return other,
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WorkspaceLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
        debug!(path = %self.path.display(), "workspace lock released");
    }
}
