// src/storage.rs

//! Filesystem statistics probe for disk-space admission control
//!
//! The sysroot volume must never be filled past the configured watermark
//! by a staged update, so the rootfs manager asks this probe for block
//! counts before pulling a delta. An unprivileged process sees only the
//! blocks reserved for unprivileged use; root sees the full free count.

use crate::error::{Error, Result};
use nix::sys::statvfs::statvfs;
use nix::unistd::geteuid;
use std::path::Path;

/// Block-level statistics for the filesystem holding a directory
#[derive(Debug, Clone, Copy, Default)]
pub struct StorageStat {
    /// Total number of blocks on the volume
    pub block_count: u64,
    /// Blocks available for new data (see the uid rule in [`stat_path`])
    pub free_blocks: u64,
    /// Size of one block in bytes
    pub block_size: u64,
}

/// Source of filesystem statistics
///
/// The rootfs manager takes the probe as a trait object so admission
/// arithmetic can be exercised with fixed block counts.
pub trait StorageProbe: Send + Sync {
    fn stat(&self, path: &Path) -> Result<StorageStat>;
}

/// Probe backed by `statvfs(3)`
pub struct StatvfsProbe;

impl StorageProbe for StatvfsProbe {
    fn stat(&self, path: &Path) -> Result<StorageStat> {
        stat_path(path)
    }
}

/// Read filesystem statistics for the directory at `path`
///
/// Free-block selection: unprivileged-available blocks (`f_bavail`) when
/// the effective uid is not 0, otherwise total free blocks (`f_bfree`).
pub fn stat_path(path: &Path) -> Result<StorageStat> {
    if !path.is_dir() {
        return Err(Error::Io(format!(
            "not a directory: {}",
            path.display()
        )));
    }

    let stat = statvfs(path).map_err(|e| {
        Error::Io(format!(
            "failed to stat filesystem at {}: {e}",
            path.display()
        ))
    })?;

    let free_blocks = if geteuid().is_root() {
        stat.blocks_free() as u64
    } else {
        stat.blocks_available() as u64
    };

    Ok(StorageStat {
        block_count: stat.blocks() as u64,
        free_blocks,
        // f_frsize == f_bsize on Linux filesystems
        block_size: stat.block_size() as u64,
    })
}
