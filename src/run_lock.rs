//! Advisory lock serializing runs on the same component.
//!
//! At most one orchestration run may be in flight per (workdir, component)
//! pair. The lock is an OS file lock on `W/.infraheal-locks/<name>.lock`, held
//! for as long as the [`RunLock`] value lives and released by the OS if the
//! process dies. It coordinates infraheal processes only; it is not a
//! security boundary.

use crate::error::LockError;
use crate::providers::TimeProvider;
use fd_lock::RwLock;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

pub const LOCK_DIR: &str = ".infraheal-locks";

/// Diagnostic content written into a held lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub component: String,
    pub acquired_at: u64,
}

pub struct RunLock {
    path: PathBuf,
    // Closing the descriptor releases the lock.
    _file: Box<RwLock<File>>,
}

impl RunLock {
    /// Takes the lock without waiting.
    ///
    /// Returns [`LockError::Busy`] when another run holds it.
    pub fn acquire(
        workdir: &Path,
        component: &str,
        clock: &dyn TimeProvider,
    ) -> Result<Self, LockError> {
        let dir = workdir.join(LOCK_DIR);
        fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{component}.lock"));

        // The file is never truncated or removed by a waiter, only by a holder.
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;
        let mut lock = Box::new(RwLock::new(file));

        {
            let mut guard = lock.try_write().map_err(|e| {
                if e.kind() == ErrorKind::WouldBlock {
                    LockError::Busy {
                        component: component.to_string(),
                        workdir: workdir.to_path_buf(),
                    }
                } else {
                    LockError::Io(e)
                }
            })?;

            let info = LockInfo {
                pid: std::process::id(),
                component: component.to_string(),
                acquired_at: clock.now(),
            };
            let json = serde_json::to_string(&info).map_err(std::io::Error::other)?;
            guard.set_len(0)?;
            guard.write_all(json.as_bytes())?;

            // Keep the OS lock past this scope; it is released when the
            // descriptor inside `lock` is closed.
            std::mem::forget(guard);
        }

        debug!("Acquired run lock {}", path.display());
        Ok(Self { path, _file: lock })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the holder information of a lock file, if any.
    pub fn read_info(path: &Path) -> Option<LockInfo> {
        let content = fs::read_to_string(path).ok()?;
        serde_json::from_str(&content).ok()
    }
}

impl std::fmt::Debug for RunLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunLock").field("path", &self.path).finish()
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        debug!("Released run lock {}", self.path.display());
    }
}
