// src/outcome.rs

//! Outcome types reported by the update engine
//!
//! Three layers of results flow upward: the tree tool and rootfs manager
//! produce [`InstallationResult`]/[`DownloadResult`], the controller's
//! installer surfaces [`InstallResult`], and finalization after reboot
//! reports a [`FinalizeResult`]. The CLI maps each onto a stable exit
//! code.

use std::fmt;

/// Result kinds produced by the tree tool and the rootfs manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallKind {
    Ok,
    /// Deployment staged; reboot required to observe it
    NeedCompletion,
    InstallFailed,
    VerificationFailed,
    DownloadFailed,
    DownloadFailedNoSpace,
    Unknown,
}

/// A staging/pull outcome with a human description
#[derive(Debug, Clone)]
pub struct InstallationResult {
    pub kind: InstallKind,
    pub description: String,
}

impl InstallationResult {
    pub fn ok(description: impl Into<String>) -> Self {
        Self { kind: InstallKind::Ok, description: description.into() }
    }

    pub fn need_completion(description: impl Into<String>) -> Self {
        Self { kind: InstallKind::NeedCompletion, description: description.into() }
    }

    pub fn install_failed(description: impl Into<String>) -> Self {
        Self { kind: InstallKind::InstallFailed, description: description.into() }
    }

    pub fn download_failed(description: impl Into<String>) -> Self {
        Self { kind: InstallKind::DownloadFailed, description: description.into() }
    }

    pub fn is_ok(&self) -> bool {
        self.kind == InstallKind::Ok
    }
}

impl fmt::Display for InstallationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}/{}", self.kind, self.description)
    }
}

/// Status of a rootfs/apps download attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadStatus {
    Ok,
    DownloadFailed,
    VerificationFailed,
    DownloadFailedNoSpace,
}

#[derive(Debug, Clone)]
pub struct DownloadResult {
    pub status: DownloadStatus,
    pub description: String,
}

impl DownloadResult {
    pub fn ok() -> Self {
        Self { status: DownloadStatus::Ok, description: String::new() }
    }

    pub fn failed(description: impl Into<String>) -> Self {
        Self { status: DownloadStatus::DownloadFailed, description: description.into() }
    }

    pub fn no_space(description: impl Into<String>) -> Self {
        Self { status: DownloadStatus::DownloadFailedNoSpace, description: description.into() }
    }

    pub fn verification_failed(description: impl Into<String>) -> Self {
        Self { status: DownloadStatus::VerificationFailed, description: description.into() }
    }

    pub fn is_ok(&self) -> bool {
        self.status == DownloadStatus::Ok
    }
}

impl fmt::Display for DownloadResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}/{}", self.status, self.description)
    }
}

/// Status of one installer traversal as seen by the CLI driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallStatus {
    Ok,
    /// Rootfs finalized but the boot firmware wants one more reboot
    OkBootFwNeedsCompletion,
    NeedsCompletion,
    AppsNeedCompletion,
    BootFwNeedsCompletion,
    DownloadFailed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct InstallResult {
    pub status: InstallStatus,
    pub description: String,
}

impl InstallResult {
    pub fn new(status: InstallStatus, description: impl Into<String>) -> Self {
        Self { status, description: description.into() }
    }

    pub fn is_ok(&self) -> bool {
        matches!(
            self.status,
            InstallStatus::Ok
                | InstallStatus::OkBootFwNeedsCompletion
                | InstallStatus::NeedsCompletion
                | InstallStatus::AppsNeedCompletion
                | InstallStatus::BootFwNeedsCompletion
        )
    }
}

impl fmt::Display for InstallResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}/{}", self.status, self.description)
    }
}

/// Status of a metadata check-in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckInStatus {
    Ok,
    /// Refresh failed; the local metadata copy was used
    OkCached,
    Failed,
}

/// Outcome of post-reboot finalization
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalizeResult {
    /// New deployment confirmed, apps in sync
    Ok,
    /// Confirmed, but a boot-firmware update needs one more reboot
    OkBootFwNeedsCompletion,
    /// Finalization not possible yet; the device must reboot first
    NeedsReboot,
    NoPending,
    /// Bootloader rolled the rootfs back and apps were re-synced
    RollbackOk,
    /// App-driven rollback staged; reboot to complete it
    RollbackNeedsReboot,
    RollbackFailed,
    Unknown(String),
}
