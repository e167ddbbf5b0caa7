// src/bootloader/mod.rs

//! Bootloader capability set
//!
//! The rootfs manager depends on this capability set only: boot-firmware
//! update status gates new deployments, and the version queries feed the
//! monotonic-version interlock. [`lite::BootloaderLite`] implements it
//! over a U-Boot environment; tests use fakes.
//!
//! A deployment ships its boot-firmware version in
//! `usr/lib/firmware/version.txt` as `key=value` lines, one of which is
//! `bootfirmware_version=<u64>`. A malformed file is distinguished from
//! an unreadable one: the former rejects the update, the latter is
//! treated as "no bootloader update in this target".

mod lite;

pub use lite::BootloaderLite;

use crate::error::{Error, Result};
use crate::target::Target;

/// Relative path of the boot-firmware version file inside a deployment
pub const VERSION_FILE: &str = "usr/lib/firmware/version.txt";

const VERSION_KEY: &str = "bootfirmware_version";

/// Boot-firmware update status queries
pub trait BootFwUpdateStatus: Send + Sync {
    /// Can this device update its boot firmware at all?
    fn is_update_supported(&self) -> bool;

    /// Is a boot-firmware update staged and waiting for a reboot?
    fn is_update_in_progress(&self) -> bool;
}

/// Full bootloader capability set consumed by the rootfs manager
pub trait Bootloader: BootFwUpdateStatus {
    /// Called before an install is staged; not atomic, so a false
    /// positive is tolerated thanks to rollback support
    fn update_notify(&self);

    /// Called after an install to let the bootloader observe the staged
    /// deployment
    fn install_notify(&self, target: &Target);

    fn is_rollback_protection_enabled(&self) -> bool;

    /// Currently running boot-firmware version; `None` when the value is
    /// missing or invalid (callers assume `0` and proceed)
    fn current_version(&self) -> Option<String>;

    /// Boot-firmware version the deployment `hash` would install
    ///
    /// `Err(Error::InvalidArgument)` means the version file is malformed
    /// and the update must be rejected; any other error means the lookup
    /// failed and the target is assumed to carry no bootloader update.
    fn target_version(&self, hash: &str) -> Result<String>;
}

/// Extract the boot-firmware version from a version-file's contents
///
/// The key is matched exactly: sibling keys sharing the prefix (such as
/// `bootfirmware_version_date`) are skipped, not misread.
pub fn parse_version_file(content: &str) -> Result<String> {
    let mut key_seen_without_value = false;
    for line in content.lines() {
        let line = line.trim();
        let Some((key, value)) = line.split_once('=') else {
            if line.split_whitespace().next() == Some(VERSION_KEY) {
                key_seen_without_value = true;
            }
            continue;
        };
        if key.trim() != VERSION_KEY {
            continue;
        }
        let value = value.trim();
        if value.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "empty {VERSION_KEY} value"
            )));
        }
        return Ok(value.to_string());
    }

    if key_seen_without_value {
        return Err(Error::InvalidArgument(format!(
            "malformed {VERSION_KEY} line: missing `=`"
        )));
    }
    Err(Error::InvalidArgument(format!(
        "no {VERSION_KEY} entry in version file"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_version() {
        let content = "bootfirmware_version=92\n";
        assert_eq!(parse_version_file(content).unwrap(), "92");
    }

    #[test]
    fn test_parse_among_other_keys() {
        let content = "vendor=nxp\nbootfirmware_version = 17\nboard=imx8\n";
        assert_eq!(parse_version_file(content).unwrap(), "17");
    }

    #[test]
    fn test_sibling_key_with_version_prefix_is_skipped() {
        let content = "bootfirmware_version_date=20230101\nbootfirmware_version=92\n";
        assert_eq!(parse_version_file(content).unwrap(), "92");
    }

    #[test]
    fn test_only_sibling_keys_is_missing_not_malformed() {
        let err = parse_version_file("bootfirmware_version_date=20230101\n").unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(msg) if msg.contains("no bootfirmware_version entry")));
    }

    #[test]
    fn test_missing_key_is_malformed() {
        let err = parse_version_file("vendor=nxp\n").unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_missing_separator_is_malformed() {
        let err = parse_version_file("bootfirmware_version 92\n").unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_empty_value_is_malformed() {
        let err = parse_version_file("bootfirmware_version=\n").unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }
}
