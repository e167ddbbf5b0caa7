// src/lock.rs

//! Per-device exclusive lock for update traversals
//!
//! Only one check-in/download/install traversal may run at a time on a
//! device. Concurrent CLI invocations (an operator racing a systemd
//! timer, for instance) are serialized by an advisory `flock` on a file
//! under the agent's state directory; the lock is released when the
//! holding process exits or drops it.

use crate::error::{Error, Result};
use fs2::FileExt;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Exclusive advisory lock held for the lifetime of an update traversal
pub struct UpdateLock {
    // kept open to maintain the lock
    #[allow(dead_code)]
    file: File,
    path: PathBuf,
}

impl UpdateLock {
    /// Try to take the lock without blocking
    ///
    /// Returns `Ok(None)` when another process holds it.
    pub fn try_acquire<P: AsRef<Path>>(path: P) -> Result<Option<Self>> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| Error::Io(format!("failed to create {}: {e}", parent.display())))?;
        }

        let file = File::create(&path)
            .map_err(|e| Error::Io(format!("failed to create {}: {e}", path.display())))?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                debug!("Acquired update lock at {}", path.display());
                Ok(Some(Self { file, path }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                debug!("Update lock already held at {}", path.display());
                Ok(None)
            }
            Err(e) => Err(Error::Io(format!(
                "failed to acquire update lock at {}: {e}",
                path.display()
            ))),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for UpdateLock {
    fn drop(&mut self) {
        debug!("Released update lock at {}", self.path.display());
    }
}
