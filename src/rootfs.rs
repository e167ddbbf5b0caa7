// src/rootfs.rs

//! Root-filesystem tree manager
//!
//! Orchestrates one rootfs update end to end: builds the fetch-origin
//! list, decides between delta and full pulls per origin, runs the
//! disk-space admission check, stages the deployment through the tree
//! tool, and gates everything behind the bootloader interlock.
//!
//! Failure policy: a disk-space failure aborts the whole download (the
//! disk, not the origin, is the bottleneck), any other pull failure falls
//! through to the next origin, and the accumulated descriptions are
//! reported when every origin has been tried.

use crate::bootloader::{BootFwUpdateStatus as _, Bootloader};
use crate::config::{is_truthy, PacmanConfig};
use crate::db::{InstalledVersion, InstalledVersionMode};
use crate::delta::{self, DeltaStat};
use crate::error::Error;
use crate::flow::FlowControlToken;
use crate::http::HttpClient;
use crate::ostree::{Deployment, Sysroot, TreeTool};
use crate::outcome::{DownloadResult, InstallKind, InstallationResult};
use crate::remote::{self, TlsMaterial};
use crate::storage::{StorageProbe, StorageStat};
use crate::target::Target;
use rusqlite::Connection;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Disk-fullness ceiling defaults and bounds (percent)
pub const DEFAULT_STORAGE_WATERMARK: u32 = 90;
pub const MIN_STORAGE_WATERMARK: u32 = 50;
pub const MAX_STORAGE_WATERMARK: u32 = 95;

const UPDATE_BLOCK_PARAM: &str = "bootupgrade_available_blocker";
const WATERMARK_PARAM: &str = "sysroot_storage_watermark";

/// Rootfs manager knobs read from the `pacman` config table
#[derive(Debug, Clone)]
pub struct RootfsConfig {
    /// Block rootfs updates while a boot-firmware update is pending
    pub update_block: bool,
    /// Storage watermark percent, clamped to [50, 95]
    pub storage_watermark: u32,
}

impl Default for RootfsConfig {
    fn default() -> Self {
        Self {
            update_block: false,
            storage_watermark: DEFAULT_STORAGE_WATERMARK,
        }
    }
}

impl RootfsConfig {
    pub fn from_pacman(pacman: &PacmanConfig) -> Self {
        let mut cfg = Self::default();

        if let Some(val) = pacman.extra.get(UPDATE_BLOCK_PARAM) {
            cfg.update_block = is_truthy(val);
        }

        if let Some(val) = pacman.extra.get(WATERMARK_PARAM) {
            cfg.storage_watermark = match val.trim().parse::<u32>() {
                Ok(v) if v < MIN_STORAGE_WATERMARK => {
                    error!(
                        "Value of `{WATERMARK_PARAM}` parameter is too low: {val}; setting it to the minimum allowed: {MIN_STORAGE_WATERMARK}"
                    );
                    MIN_STORAGE_WATERMARK
                }
                Ok(v) if v > MAX_STORAGE_WATERMARK => {
                    error!(
                        "Value of `{WATERMARK_PARAM}` parameter is too high: {val}; setting it to the maximum allowed: {MAX_STORAGE_WATERMARK}"
                    );
                    MAX_STORAGE_WATERMARK
                }
                Ok(v) => v,
                Err(_) => {
                    error!(
                        "Invalid value of `{WATERMARK_PARAM}` parameter: {val}; setting it to the default value: {DEFAULT_STORAGE_WATERMARK}"
                    );
                    DEFAULT_STORAGE_WATERMARK
                }
            };
        }

        cfg
    }
}

/// Snapshot of an admission decision, for logs and error descriptions
#[derive(Debug, Clone, Copy)]
pub struct UpdateStat {
    pub storage_capacity: u64,
    pub high_watermark: u32,
    pub max_available: u64,
    pub available: u64,
    pub delta_size: u64,
}

impl fmt::Display for UpdateStat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "required {}, available {} out of {}({}% of the volume capacity {})",
            self.delta_size,
            self.available,
            self.max_available,
            self.high_watermark,
            self.storage_capacity
        )
    }
}

/// Can a delta of `uncompressed_size` bytes land without crossing the watermark?
///
/// `max_blocks = floor(total × watermark/100)`; blocks already in use
/// count against the budget; the delta needs `ceil(size / block_size)`
/// blocks.
pub fn delta_fits(stat: &StorageStat, watermark: u32, uncompressed_size: u64) -> (bool, UpdateStat) {
    let max_blocks_available = stat.block_count * watermark as u64 / 100;
    let blocks_in_use = stat.block_count - stat.free_blocks;
    let max_blocks_available_for_update = max_blocks_available.saturating_sub(blocks_in_use);
    let blocks_required_by_delta =
        uncompressed_size / stat.block_size + u64::from(uncompressed_size % stat.block_size != 0);

    let update_stat = UpdateStat {
        storage_capacity: stat.block_size * stat.block_count,
        high_watermark: watermark,
        max_available: max_blocks_available * stat.block_size,
        available: max_blocks_available_for_update * stat.block_size,
        delta_size: uncompressed_size,
    };

    (blocks_required_by_delta <= max_blocks_available_for_update, update_stat)
}

/// Does a pull-error description indicate the disk is full?
///
/// Two shapes exist: the object-pull guard ("would be exceeded, at
/// least" together with one of the min-free-space knobs) and the static
/// delta guard ("Delta requires ... free space, but only ...").
fn is_no_space_pull_error(description: &str) -> bool {
    (description.contains("would be exceeded, at least")
        && (description.contains("min-free-space-size")
            || description.contains("min-free-space-percent")))
        || (description.contains("Delta requires")
            && description.contains("free space, but only"))
}

pub struct RootfsTreeManager {
    sysroot: Arc<dyn Sysroot>,
    tree: Box<dyn TreeTool>,
    bootloader: Box<dyn Bootloader>,
    http: Arc<dyn HttpClient>,
    probe: Box<dyn StorageProbe>,
    ostree_server: String,
    keys: Option<TlsMaterial>,
    cfg: RootfsConfig,
}

impl RootfsTreeManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sysroot: Arc<dyn Sysroot>,
        tree: Box<dyn TreeTool>,
        bootloader: Box<dyn Bootloader>,
        http: Arc<dyn HttpClient>,
        probe: Box<dyn StorageProbe>,
        ostree_server: impl Into<String>,
        keys: Option<TlsMaterial>,
        cfg: RootfsConfig,
    ) -> Self {
        Self {
            sysroot,
            tree,
            bootloader,
            http,
            probe,
            ostree_server: ostree_server.into(),
            keys,
            cfg,
        }
    }

    /// Commit hash the device is booted on; empty on a pristine sysroot
    pub fn current_hash(&self) -> String {
        self.sysroot
            .deployment_hash(Deployment::Current)
            .unwrap_or_default()
    }

    /// Commit hash staged for the next boot; empty when none
    pub fn pending_hash(&self) -> String {
        self.sysroot
            .deployment_hash(Deployment::Pending)
            .unwrap_or_default()
    }

    /// The bootloader capability set this manager gates installs with
    pub fn bootloader(&self) -> &dyn Bootloader {
        self.bootloader.as_ref()
    }

    /// Fetch the target's commit, trying each origin in precedence order
    pub fn download(&self, target: &Target, token: &FlowControlToken) -> DownloadResult {
        self.download_from(&self.ostree_server.clone(), target, token)
    }

    /// Fetch from an explicit base server (local update sources)
    pub fn download_from(
        &self,
        base_server: &str,
        target: &Target,
        token: &FlowControlToken,
    ) -> DownloadResult {
        let remotes = remote::get_remotes(
            base_server,
            target.name(),
            self.keys.clone(),
            self.http.as_ref(),
        );

        let mut error_desc = String::new();
        let mut result = DownloadResult::failed("no fetch origin available");

        for origin in &remotes {
            if token.is_aborted() {
                return DownloadResult::failed("cancelled");
            }

            if !origin.is_remote_set {
                if let Err(e) = self.tree.add_remote(origin) {
                    error!("Failed to configure remote {}: {e}", origin.name);
                    error_desc.push_str(&format!("{e}\n"));
                    result = DownloadResult::failed(error_desc.clone());
                    continue;
                }
            }

            if let Some(delta_stat) = self.delta_stat_if_available(target, origin) {
                info!("Found and pulled delta stats, checking if update can fit on a disk...");
                match self.can_delta_fit_on_disk(&delta_stat) {
                    Ok((fits, update_stat)) => {
                        if !fits {
                            // the disk, not the origin, is the bottleneck
                            return DownloadResult::no_space(format!(
                                "Insufficient storage available; err: {update_stat}"
                            ));
                        }
                        info!("Fetching static delta; {update_stat}");
                    }
                    Err(e) => {
                        error!(
                            "Failed to check if the static delta can fit on a disk, skipping the update size check...; err: {e}"
                        );
                        info!(
                            "Fetching ostree commit {} from {}",
                            target.sha256(),
                            origin.base_url
                        );
                    }
                }
            } else {
                info!("No static delta or static delta stats are found, skipping the update size check...");
                info!(
                    "Fetching ostree commit {} from {}",
                    target.sha256(),
                    origin.base_url
                );
            }

            let pull = self.tree.pull(origin, target.sha256());
            if pull.is_ok() {
                return DownloadResult::ok();
            }

            error!("Failed to fetch from {}, err: {}", origin.base_url, pull.description);

            if is_no_space_pull_error(&pull.description) {
                return DownloadResult::no_space(format!(
                    "Insufficient storage available; path: {}; err: {}",
                    self.sysroot.path().display(),
                    pull.description
                ));
            }

            error_desc.push_str(&pull.description);
            error_desc.push('\n');
            result = DownloadResult::failed(error_desc.clone());
        }

        result
    }

    /// Stage a deployment of `target`
    ///
    /// `current` is the target the device is booted on. The install also
    /// runs when a pending deployment differs from `target`, which
    /// undeploys the pending one (app-driven rollback installs the
    /// current target again).
    pub fn install(&self, target: &Target, current: &Target) -> InstallationResult {
        if current.sha256() != target.sha256() && self.bootloader.is_update_supported() {
            let verdict = self.verify_bootloader_update(target);
            if verdict.kind != InstallKind::Ok {
                return verdict;
            }
        }

        let pending = self.pending_hash();
        let hash_differs = current.sha256() != target.sha256();
        let undeploys_pending = !pending.is_empty() && pending != target.sha256();

        if !hash_differs && !undeploys_pending {
            info!("Target {} is same as current", target.sha256());
            return InstallationResult::ok("OSTree hash already installed, same as current");
        }

        // notify the bootloader before installation happens as it is not
        // atomic and a false notification doesn't hurt with rollback
        // support in place
        self.bootloader.update_notify();

        let mut result = self.tree.install(target.sha256());
        if result.kind == InstallKind::InstallFailed {
            error!("Failed to install OSTree target");
            return result;
        }

        self.install_notify(target);

        if !hash_differs && result.kind == InstallKind::NeedCompletion {
            info!("Successfully undeployed the pending failing target");
            info!("Target {} is same as current", target.sha256());
            self.bootloader.update_notify();
            result = InstallationResult::ok("OSTree hash already installed, same as current");
        }

        result
    }

    /// Bootloader interlock, evaluated before any staging
    ///
    /// Rule order (first match wins): update-block with a firmware update
    /// in flight → NeedCompletion; rollback protection off → Ok;
    /// malformed version file → InstallFailed; unreadable version → Ok;
    /// unparseable target version → InstallFailed; unreadable current
    /// version → assume 0; target < current → InstallFailed.
    pub fn verify_bootloader_update(&self, target: &Target) -> InstallationResult {
        if self.cfg.update_block && self.bootloader.is_update_in_progress() {
            warn!(
                "Bootloader update is in progress. A device must be rebooted to confirm and finalize the boot fw update before installation of a new target with a rootfs change"
            );
            return InstallationResult::need_completion("bootloader update is in progress");
        }

        if !self.bootloader.is_rollback_protection_enabled() {
            return InstallationResult::ok("");
        }

        let target_ver_str = match self.bootloader.target_version(target.sha256()) {
            Ok(v) => v,
            Err(Error::InvalidArgument(msg)) => {
                warn!("Rejecting the update because a bootloader version file is malformed: {msg}");
                return InstallationResult::install_failed(msg);
            }
            Err(e) => {
                info!("Failed to get bootloader version, assuming no bootloader update: {e}");
                return InstallationResult::ok("");
            }
        };

        let target_ver = match target_ver_str.trim().parse::<u64>() {
            Ok(v) => v,
            Err(e) => {
                let msg = format!(
                    "invalid format of the bootloader version; value: {target_ver_str}; err: {e}"
                );
                error!("Rejecting the update since the bootloader version has an invalid format; {msg}");
                return InstallationResult::install_failed(msg);
            }
        };

        let cur_ver_str = self.bootloader.current_version().unwrap_or_else(|| {
            warn!("Failed to get current bootloader version");
            warn!("Assuming that the current bootloader version is `0` and proceeding with the update");
            "0".to_string()
        });
        let cur_ver = cur_ver_str.trim().parse::<u64>().unwrap_or_else(|e| {
            warn!("Invalid format of the current bootloader version; value: {cur_ver_str}; err: {e}");
            warn!("Assuming that the current bootloader version is `0` and proceeding with the update");
            0
        });

        if target_ver < cur_ver {
            let msg = format!(
                "bootloader rollback from version {cur_ver_str} to {target_ver_str} has been detected"
            );
            warn!("Rejecting the update because {msg}");
            return InstallationResult::install_failed(msg);
        }

        InstallationResult::ok("")
    }

    /// Persist a synthesized target for a freshly provisioned device
    ///
    /// A device whose current deployment is unknown gets an initial
    /// version-0 target so check-in comparisons and rollback bookkeeping
    /// have something to anchor on. Failures are logged and swallowed.
    pub fn set_initial_target_if_needed(&self, conn: &Connection, current: &Target, hwid: &str) {
        if !current.is_unknown() || current.sha256().is_empty() {
            return;
        }
        let initial = Target::initial(current.sha256(), hwid);
        info!("Registering the initial target {}", initial.name());
        if let Err(e) = InstalledVersion::save(conn, &initial, InstalledVersionMode::Current) {
            error!("Failed to set the initial target: {e}");
        }
    }

    fn delta_stat_if_available(
        &self,
        target: &Target,
        origin: &crate::remote::Remote,
    ) -> Option<DeltaStat> {
        delta::stat_if_available(
            target.custom(),
            &self.current_hash(),
            target.sha256(),
            origin,
            self.http.as_ref(),
        )
    }

    fn can_delta_fit_on_disk(&self, stat: &DeltaStat) -> crate::error::Result<(bool, UpdateStat)> {
        let storage = self.probe.stat(self.sysroot.path())?;
        Ok(delta_fits(&storage, self.cfg.storage_watermark, stat.u_size))
    }

    fn install_notify(&self, target: &Target) {
        if self.sysroot.reload() {
            debug!(
                "Change in the ostree-based sysroot has been detected after installation; booted on: {} pending: {}",
                self.current_hash(),
                self.pending_hash()
            );
        } else {
            warn!(
                "Change in the ostree-based sysroot has NOT been detected after installation; booted on: {} pending: {}",
                self.current_hash(),
                self.pending_hash()
            );
        }
        self.bootloader.install_notify(target);
    }
}
