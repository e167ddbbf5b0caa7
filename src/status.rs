// src/status.rs

//! Stable exit codes for the CLI surface
//!
//! Scripts and systemd units branch on these values, so they are part of
//! the public interface and must never be renumbered.

use std::fmt;

/// Process exit codes reported by `otad` commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum StatusCode {
    Ok = 0,
    UnknownError = 1,
    /// Check-in used the local metadata copy because refresh failed
    CheckinOkCached = 3,
    CheckinFailure = 4,
    /// Finalization succeeded; reboot required to confirm the boot firmware
    OkNeedsRebootForBootFw = 5,
    InstallAppsNeedFinalization = 10,
    TufMetaPullFailure = 13,
    InstallationInProgress = 16,
    NoPendingInstallation = 17,
    DownloadFailure = 18,
    DownloadFailureNoSpace = 19,
    DownloadFailureVerificationFailed = 20,
    InstallAppPullFailure = 22,
    InstallNeedsRebootForBootFw = 23,
    InstallNeedsReboot = 100,
    InstallDowngradeAttempt = 102,
    InstallRollbackOk = 103,
    InstallRollbackNeedsReboot = 104,
    InstallRollbackFailed = 105,
    TufTargetNotFound = 106,
}

impl StatusCode {
    pub fn exit_code(self) -> i32 {
        self as i32
    }

    /// Codes that indicate the requested operation succeeded
    pub fn is_success(self) -> bool {
        matches!(
            self,
            StatusCode::Ok
                | StatusCode::CheckinOkCached
                | StatusCode::OkNeedsRebootForBootFw
                | StatusCode::InstallNeedsReboot
                | StatusCode::InstallAppsNeedFinalization
                | StatusCode::InstallNeedsRebootForBootFw
        )
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, self.exit_code())
    }
}
