//! Deployment lock — serializes healing and update episodes.
//!
//! An advisory `flock` on a lock file keyed to the deployment. Acquisition
//! never blocks: when another episode (in this or any other process) holds
//! the lock, the caller skips its cycle.

use std::fs::{File, OpenOptions};
use std::io::{self, Seek, Write};
use std::path::{Path, PathBuf};

use fd_lock::{RwLock, RwLockWriteGuard};
use tracing::debug;

/// Lock file handle. Call [`DeploymentLock::try_acquire`] to take the lock;
/// it is released when the returned guard drops.
pub struct DeploymentLock {
    path: PathBuf,
    lock: RwLock<File>,
}

impl DeploymentLock {
    /// Open (creating if needed) the lock file. Does not take the lock.
    pub fn open(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            lock: RwLock::new(file),
        })
    }

    /// Take the lock without waiting. `Ok(None)` means another holder has it.
    pub fn try_acquire(&mut self) -> io::Result<Option<RwLockWriteGuard<'_, File>>> {
        match self.lock.try_write() {
            Ok(mut guard) => {
                // Best effort: record the holder for operators inspecting the file.
                guard.set_len(0)?;
                guard.rewind()?;
                writeln!(*guard, "{}", std::process::id())?;
                debug!(path = ?self.path, "deployment lock acquired");
                Ok(Some(guard))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                debug!(path = ?self.path, "deployment lock held elsewhere");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
