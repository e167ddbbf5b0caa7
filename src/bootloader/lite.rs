// src/bootloader/lite.rs

//! U-Boot environment bootloader
//!
//! Reads and writes the bootloader state through the `fw_printenv` /
//! `fw_setenv` pair. Environment variables used:
//!
//! - `upgrade_available`      - armed before a rootfs install so the
//!   bootloader counts boot attempts and can fall back
//! - `bootupgrade_available`  - armed when a staged deployment carries a
//!   newer boot firmware; cleared by the firmware itself after flashing
//! - `rollback_protection`    - set by the factory image when monotonic
//!   firmware versions are enforced
//! - `bootfirmware_version`   - version of the currently flashed firmware

use super::{parse_version_file, BootFwUpdateStatus, Bootloader, VERSION_FILE};
use crate::error::{Error, Result};
use crate::ostree::Sysroot;
use crate::target::Target;
use std::process::Command;
use std::sync::Arc;
use tracing::{debug, warn};

const UPGRADE_AVAILABLE_VAR: &str = "upgrade_available";
const BOOT_UPGRADE_AVAILABLE_VAR: &str = "bootupgrade_available";
const ROLLBACK_PROTECTION_VAR: &str = "rollback_protection";
const FW_VERSION_VAR: &str = "bootfirmware_version";

pub struct BootloaderLite {
    sysroot: Arc<dyn Sysroot>,
    get_env_cmd: String,
    set_env_cmd: String,
}

impl BootloaderLite {
    pub fn new(sysroot: Arc<dyn Sysroot>) -> Self {
        Self::with_commands(sysroot, "fw_printenv", "fw_setenv")
    }

    /// Override the environment tools (an empty getter marks the device
    /// as not supporting boot-firmware updates)
    pub fn with_commands(
        sysroot: Arc<dyn Sysroot>,
        get_env_cmd: impl Into<String>,
        set_env_cmd: impl Into<String>,
    ) -> Self {
        Self {
            sysroot,
            get_env_cmd: get_env_cmd.into(),
            set_env_cmd: set_env_cmd.into(),
        }
    }

    fn get_env(&self, var: &str) -> Result<String> {
        if self.get_env_cmd.is_empty() {
            return Err(Error::Unknown("no bootloader env getter configured".to_string()));
        }
        let output = Command::new(&self.get_env_cmd)
            .arg(var)
            .output()
            .map_err(|e| Error::Io(format!("failed to run {}: {e}", self.get_env_cmd)))?;
        if !output.status.success() {
            return Err(Error::Unknown(format!(
                "{} {var} failed: {}",
                self.get_env_cmd,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        // fw_printenv prints `name=value`
        let stdout = String::from_utf8_lossy(&output.stdout);
        let line = stdout.trim();
        let value = match line.split_once('=') {
            Some((_, value)) => value.trim(),
            None => line,
        };
        Ok(value.to_string())
    }

    fn set_env(&self, var: &str, value: &str) -> Result<()> {
        if self.set_env_cmd.is_empty() {
            return Err(Error::Unknown("no bootloader env setter configured".to_string()));
        }
        let output = Command::new(&self.set_env_cmd)
            .arg(var)
            .arg(value)
            .output()
            .map_err(|e| Error::Io(format!("failed to run {}: {e}", self.set_env_cmd)))?;
        if !output.status.success() {
            return Err(Error::Unknown(format!(
                "{} {var} {value} failed: {}",
                self.set_env_cmd,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        debug!("Set bootloader env {var}={value}");
        Ok(())
    }
}

impl BootFwUpdateStatus for BootloaderLite {
    fn is_update_supported(&self) -> bool {
        !self.get_env_cmd.is_empty()
    }

    fn is_update_in_progress(&self) -> bool {
        match self.get_env(BOOT_UPGRADE_AVAILABLE_VAR) {
            Ok(value) => !value.is_empty() && value != "0",
            Err(e) => {
                debug!("Could not read {BOOT_UPGRADE_AVAILABLE_VAR}: {e}");
                false
            }
        }
    }
}

impl Bootloader for BootloaderLite {
    fn update_notify(&self) {
        if let Err(e) = self.set_env(UPGRADE_AVAILABLE_VAR, "1") {
            warn!("Failed to notify bootloader about the upcoming update: {e}");
        }
    }

    fn install_notify(&self, target: &Target) {
        // arm the firmware update flag when the staged deployment ships a
        // newer firmware than the one currently flashed
        let target_ver = match self.target_version(target.sha256()) {
            Ok(v) => v,
            Err(e) => {
                debug!("No boot firmware version in {}: {e}", target.name());
                return;
            }
        };
        let current_ver = self.current_version().unwrap_or_else(|| "0".to_string());

        let (Ok(target_num), Ok(current_num)) =
            (target_ver.parse::<u64>(), current_ver.parse::<u64>())
        else {
            warn!(
                "Unparseable boot firmware versions; target: {target_ver}, current: {current_ver}"
            );
            return;
        };

        if target_num > current_num {
            if let Err(e) = self.set_env(BOOT_UPGRADE_AVAILABLE_VAR, "1") {
                warn!("Failed to arm the boot firmware update: {e}");
            }
        }
    }

    fn is_rollback_protection_enabled(&self) -> bool {
        match self.get_env(ROLLBACK_PROTECTION_VAR) {
            Ok(value) => !value.is_empty() && value != "0",
            Err(e) => {
                debug!("Could not read {ROLLBACK_PROTECTION_VAR}: {e}");
                false
            }
        }
    }

    fn current_version(&self) -> Option<String> {
        match self.get_env(FW_VERSION_VAR) {
            Ok(value) if !value.is_empty() => Some(value),
            Ok(_) => None,
            Err(e) => {
                debug!("Could not read {FW_VERSION_VAR}: {e}");
                None
            }
        }
    }

    fn target_version(&self, hash: &str) -> Result<String> {
        let deployment = self.sysroot.deployment_path(hash).ok_or_else(|| {
            Error::Unknown(format!("no deployment found for commit {hash}"))
        })?;
        let version_file = deployment.join(VERSION_FILE);
        let content = std::fs::read_to_string(&version_file).map_err(|e| {
            Error::Io(format!(
                "failed to read {}: {e}",
                version_file.display()
            ))
        })?;
        parse_version_file(&content)
    }
}
