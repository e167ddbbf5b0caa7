// src/lib.rs

//! otad - OTA update agent for OSTree-based embedded Linux devices
//!
//! The agent keeps a device on the newest approved root-filesystem
//! commit and application set for its hardware class:
//!
//! - Check-in: refresh signed targets metadata, filter by hardware id
//!   and tags, pick a candidate
//! - Download: fetch the commit (binary delta or full) from an ordered
//!   list of origins, behind a disk-space admission check
//! - Install: stage a boot deployment through the tree tool, gated by
//!   the bootloader interlock (no firmware rollbacks, no staging while a
//!   firmware update is mid-flight)
//! - Finalize: after reboot, confirm the deployment or roll back
//!   (bootloader-driven or app-driven)
//!
//! Everything runs on a single-threaded synchronous control loop; the
//! CLI in `src/main.rs` is a thin driver over [`cli`].

pub mod apps;
pub mod bootloader;
pub mod cli;
pub mod client;
pub mod config;
pub mod db;
pub mod delta;
mod error;
pub mod flow;
pub mod hash;
pub mod http;
pub mod lock;
pub mod ostree;
pub mod outcome;
pub mod registry;
pub mod remote;
pub mod rootfs;
pub mod status;
pub mod storage;
pub mod target;
pub mod tuf;

#[cfg(test)]
mod testing;

pub use client::{
    CheckInResult, InstallMode, Installer, LocalUpdateSource, SecondaryEcu, UpdateClient,
};
pub use config::Config;
pub use error::{Error, Result};
pub use flow::FlowControlToken;
pub use lock::UpdateLock;
pub use outcome::{
    CheckInStatus, DownloadResult, DownloadStatus, FinalizeResult, InstallKind, InstallResult,
    InstallStatus, InstallationResult,
};
pub use status::StatusCode;
pub use target::{Target, TargetApp};
