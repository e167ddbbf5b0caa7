// src/client.rs

//! Update controller
//!
//! The top-level state machine a CLI or daemon tick drives: check in with
//! the metadata source, pick a target, produce an [`Installer`] that
//! downloads and stages it, and finalize (or roll back) after reboot.
//! One traversal is active per device at most; a pending deployment in
//! the installed-versions database marks a traversal in flight.

use crate::apps::AppFetcher;
use crate::bootloader::BootFwUpdateStatus as _;
use crate::config::Config;
use crate::db::{self, InstalledVersion, InstalledVersionMode};
use crate::error::Result;
use crate::flow::FlowControlToken;
use crate::http::{HttpClient, ReqwestHttpClient};
use crate::ostree::{OstreeCli, OstreeSysroot, Sysroot};
use crate::outcome::{
    CheckInStatus, DownloadResult, FinalizeResult, InstallKind, InstallResult, InstallStatus,
};
use crate::registry::RegistryClient;
use crate::remote::TlsMaterial;
use crate::rootfs::{RootfsConfig, RootfsTreeManager};
use crate::storage::StatvfsProbe;
use crate::target::Target;
use crate::tuf::{JsonTufSource, TufSource};
use rusqlite::Connection;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Result of a metadata check-in: accepted targets for this device,
/// ascending by version
pub struct CheckInResult {
    pub status: CheckInStatus,
    primary_hwid: String,
    targets: Vec<Target>,
}

impl CheckInResult {
    pub fn failed() -> Self {
        Self {
            status: CheckInStatus::Failed,
            primary_hwid: String::new(),
            targets: Vec::new(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status != CheckInStatus::Failed
    }

    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    /// Newest target whose first hardware id equals `hwid` (the primary
    /// ECU's id when `None`)
    pub fn latest(&self, hwid: Option<&str>) -> Option<Target> {
        let hwid = hwid.unwrap_or(&self.primary_hwid);
        self.targets
            .iter()
            .rev()
            .find(|t| t.hardware_ids().first().map(String::as_str) == Some(hwid))
            .cloned()
    }
}

/// What an install traversal covers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InstallMode {
    /// Rootfs and apps
    #[default]
    All,
    /// Rootfs only; apps are finalized later
    OstreeOnly,
}

/// Offline update source: metadata, commits, and apps on local media
#[derive(Debug, Clone)]
pub struct LocalUpdateSource {
    pub tuf_repo: PathBuf,
    pub ostree_repo: PathBuf,
    pub apps_dir: PathBuf,
}

/// A secondary ECU registered alongside the primary
#[derive(Debug, Clone)]
pub struct SecondaryEcu {
    pub serial: String,
    pub hwid: String,
    pub target_name: String,
}

pub struct UpdateClient {
    http: Arc<dyn HttpClient>,
    tuf: Box<dyn TufSource>,
    rootfs: RootfsTreeManager,
    apps: AppFetcher,
    db: Connection,
    primary_hwid: String,
    tags: Vec<String>,
    tls_server: String,
    secondary_hwids: Vec<String>,
}

impl UpdateClient {
    /// Wire the controller from explicit collaborators
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        http: Arc<dyn HttpClient>,
        tuf: Box<dyn TufSource>,
        rootfs: RootfsTreeManager,
        apps: AppFetcher,
        db: Connection,
        primary_hwid: impl Into<String>,
        tags: Vec<String>,
        tls_server: impl Into<String>,
    ) -> Self {
        Self {
            http,
            tuf,
            rootfs,
            apps,
            db,
            primary_hwid: primary_hwid.into(),
            tags,
            tls_server: tls_server.into(),
            secondary_hwids: Vec::new(),
        }
    }

    /// Build the production controller from the merged configuration
    ///
    /// `finalize` promotes a pending installation the device has already
    /// booted into; the `complete` command passes `false` and runs the
    /// full finalization itself.
    pub fn from_config(config: &Config, finalize: bool) -> Result<Self> {
        let http: Arc<dyn HttpClient> = Arc::new(ReqwestHttpClient::new()?);
        let sysroot: Arc<dyn Sysroot> = Arc::new(OstreeSysroot::new(
            &config.pacman.sysroot,
            &config.pacman.os,
        ));
        let tree = Box::new(OstreeCli::new(&config.pacman.sysroot, &config.pacman.os));
        let bootloader = Box::new(crate::bootloader::BootloaderLite::new(sysroot.clone()));

        let keys = tls_material(config);
        let rootfs = RootfsTreeManager::new(
            sysroot,
            tree,
            bootloader,
            http.clone(),
            Box::new(StatvfsProbe),
            config.pacman.ostree_server.clone(),
            keys,
            RootfsConfig::from_pacman(&config.pacman),
        );

        let registry = RegistryClient::new(http.clone(), &config.pacman.ostree_server);
        let apps = AppFetcher::new(
            registry,
            crate::apps::AppStore::new(&config.pacman.apps_root),
        );

        let tuf = Box::new(JsonTufSource::new(config.storage.tuf_targets_path()));
        let db = db::init(config.storage.sqldb_path())?;

        let client = Self::new(
            http,
            tuf,
            rootfs,
            apps,
            db,
            config.provision.primary_ecu_hardware_id.clone(),
            config.pacman.tag_list(),
            config.tls.server.clone(),
        );

        client
            .rootfs
            .set_initial_target_if_needed(&client.db, &client.current_from_disk(), &client.primary_hwid);
        if finalize {
            client.startup_finalize();
        }
        Ok(client)
    }

    /// Refresh metadata and select the targets applying to this device
    pub fn check_in(&self) -> CheckInResult {
        let mut status = CheckInStatus::Ok;

        info!("Refreshing targets metadata");
        if let Err(e) = self.tuf.update() {
            warn!("Unable to update latest metadata, using local copy: {e}");
            if !self.tuf.check_offline() {
                error!("Unable to use local copy of TUF data");
                return CheckInResult::failed();
            }
            status = CheckInStatus::OkCached;
        }

        let all = match self.tuf.targets() {
            Ok(targets) => targets,
            Err(e) => {
                error!("Unable to enumerate TUF targets: {e}");
                return CheckInResult::failed();
            }
        };

        CheckInResult {
            status,
            primary_hwid: self.primary_hwid.clone(),
            targets: self.select_targets(all),
        }
    }

    /// Check in against an offline update source
    pub fn check_in_local(&self, source: &LocalUpdateSource) -> CheckInResult {
        let tuf = JsonTufSource::new(source.tuf_repo.join("targets.json"));
        if !tuf.check_offline() {
            error!(
                "Unable to read targets metadata from {}",
                source.tuf_repo.display()
            );
            return CheckInResult::failed();
        }
        let all = match tuf.targets() {
            Ok(targets) => targets,
            Err(e) => {
                error!("Unable to enumerate local TUF targets: {e}");
                return CheckInResult::failed();
            }
        };

        CheckInResult {
            status: CheckInStatus::Ok,
            primary_hwid: self.primary_hwid.clone(),
            targets: self.select_targets(all),
        }
    }

    fn select_targets(&self, all: Vec<Target>) -> Vec<Target> {
        let mut targets: Vec<Target> = all
            .into_iter()
            .filter(|t| {
                t.has_any_tag(&self.tags)
                    && t.hardware_ids()
                        .iter()
                        .any(|id| *id == self.primary_hwid || self.secondary_hwids.contains(id))
            })
            .collect();
        targets.sort_by_key(Target::version);
        targets
    }

    /// The target the device is booted on
    ///
    /// Falls back to an unknown target carrying the booted commit hash
    /// when the database has no match for it.
    pub fn get_current(&self) -> Target {
        self.current_from_disk()
    }

    fn current_from_disk(&self) -> Target {
        let hash = self.rootfs.current_hash();
        if hash.is_empty() {
            return Target::unknown();
        }

        if let Ok(Some(current)) = InstalledVersion::current(&self.db) {
            if current.sha256() == hash {
                return current;
            }
        }
        if let Ok(known) = InstalledVersion::known_versions(&self.db) {
            if let Some(found) = known.into_iter().rev().find(|t| t.sha256() == hash) {
                return found;
            }
        }
        Target::unknown_with_hash(hash)
    }

    pub fn get_pending_target(&self) -> Option<Target> {
        InstalledVersion::pending(&self.db).ok().flatten()
    }

    pub fn is_installation_in_progress(&self) -> bool {
        self.get_pending_target().is_some()
    }

    /// Was this target tried before and never confirmed?
    pub fn is_rollback(&self, target: &Target) -> bool {
        InstalledVersion::is_known_but_not_installed(&self.db, target.sha256()).unwrap_or(false)
    }

    /// Newest once-confirmed target older than the pending (or current) one
    pub fn get_rollback_target(&self) -> Option<Target> {
        let before = self
            .get_pending_target()
            .map(|t| t.version())
            .unwrap_or_else(|| self.get_current().version());
        InstalledVersion::rollback_candidate(&self.db, before)
            .ok()
            .flatten()
    }

    pub fn apps_in_sync(&self, target: &Target) -> bool {
        self.apps.target_apps_in_sync(target)
    }

    /// Produce the installer for one target
    ///
    /// The target must be present in the metadata source the traversal
    /// started from; `None` means it is not, and the caller should check
    /// in again.
    pub fn installer(
        &self,
        target: &Target,
        reason: Option<&str>,
        mode: InstallMode,
        local: Option<&LocalUpdateSource>,
    ) -> Option<Installer<'_>> {
        let resolved = match local {
            Some(source) => {
                let cr = self.check_in_local(source);
                cr.targets().iter().find(|t| t.name() == target.name()).cloned()?
            }
            None => self
                .tuf
                .targets()
                .ok()?
                .into_iter()
                .find(|t| t.name() == target.name())?,
        };

        let correlation_id = format!("{}-{}", resolved.version(), Uuid::new_v4());
        Some(Installer {
            client: self,
            target: resolved,
            reason: reason.unwrap_or("").to_string(),
            correlation_id,
            mode,
            local: local.cloned(),
        })
    }

    /// Finalization after reboot; distinguishes the two rollback kinds
    pub fn complete_installation(&self) -> FinalizeResult {
        let Some(pending) = self.get_pending_target() else {
            return FinalizeResult::NoPending;
        };

        // install staged but the device has not rebooted yet
        if self.rootfs.pending_hash() == pending.sha256() {
            info!("Install finalization wasn't invoked, device reboot is required");
            return FinalizeResult::NeedsReboot;
        }

        let booted_hash = self.rootfs.current_hash();
        if booted_hash == pending.sha256() {
            // the new deployment booted; apps decide success
            if self.sync_apps(&pending) {
                if let Err(e) = InstalledVersion::save(&self.db, &pending, InstalledVersionMode::Current)
                {
                    error!("Failed to record the finalized installation: {e}");
                    return FinalizeResult::Unknown(e.to_string());
                }
                info!("Finalized installation of {}", pending.name());
                if self.rootfs.bootloader().is_update_in_progress() {
                    info!("Finalization was successful, reboot is required to confirm the boot firmware update");
                    return FinalizeResult::OkBootFwNeedsCompletion;
                }
                return FinalizeResult::Ok;
            }

            // app-driven rollback: rootfs booted fine, apps did not
            info!("Device booted on the updated rootfs but failed to start the updated apps");
            info!("Looking for a target to roll back to...");
            let Some(rollback) = self.get_rollback_target() else {
                error!("Failed to find a target to roll back to");
                let _ = InstalledVersion::clear_pending(&self.db);
                return FinalizeResult::RollbackFailed;
            };
            info!("Rolling back to {}...", rollback.name());
            let current = self.get_current();
            let res = self.rootfs.install(&rollback, &current);
            return match res.kind {
                InstallKind::NeedCompletion => {
                    if let Err(e) =
                        InstalledVersion::save(&self.db, &rollback, InstalledVersionMode::Pending)
                    {
                        error!("Failed to record the rollback installation: {e}");
                    }
                    info!("Successfully installed the rollback target, reboot is required to complete it");
                    FinalizeResult::RollbackNeedsReboot
                }
                _ => {
                    error!("Failed to roll back to {}: {res}", rollback.name());
                    FinalizeResult::RollbackFailed
                }
            };
        }

        // bootloader-driven rollback: the device booted something else
        let current = self.get_current();
        info!(
            "Installation has failed, device was rolled back to {}",
            current.name()
        );
        if let Err(e) = InstalledVersion::clear_pending(&self.db) {
            error!("Failed to clear the pending installation: {e}");
        }
        info!("Syncing apps with the target the device was rolled back to, if needed...");
        if self.apps_in_sync(&current) || self.sync_apps(&current) {
            info!("Rollback to {} completed", current.name());
            FinalizeResult::RollbackOk
        } else {
            error!("Failed to sync apps, rollback to {} failed", current.name());
            FinalizeResult::RollbackFailed
        }
    }

    /// Register secondary ECUs with the device gateway
    ///
    /// On success their hardware ids widen subsequent check-in filtering.
    pub fn set_secondaries(&mut self, ecus: &[SecondaryEcu]) -> InstallResult {
        let mut data = serde_json::Map::new();
        let mut hwids = Vec::new();
        for ecu in ecus {
            data.insert(
                ecu.serial.clone(),
                serde_json::json!({"target": ecu.target_name}),
            );
            hwids.push(ecu.hwid.clone());
        }

        let url = format!("{}/ecus", self.tls_server.trim_end_matches('/'));
        match self.http.put_json(&url, &vec![], &Value::Object(data)) {
            Ok(resp) if resp.is_ok() => {
                self.secondary_hwids = hwids;
                InstallResult::new(InstallStatus::Ok, "")
            }
            Ok(resp) => InstallResult::new(InstallStatus::Failed, resp.status_line()),
            Err(e) => InstallResult::new(InstallStatus::Failed, e.to_string()),
        }
    }

    fn sync_apps(&self, target: &Target) -> bool {
        if self.apps_in_sync(target) {
            return true;
        }
        match self.apps.fetch_target_apps(target, &FlowControlToken::new()) {
            Ok(()) => true,
            Err(e) => {
                error!("Failed to sync apps for {}: {e}", target.name());
                false
            }
        }
    }

    /// Quiet startup finalization: promote a pending installation the
    /// device has already booted into
    fn startup_finalize(&self) {
        let Some(pending) = self.get_pending_target() else {
            return;
        };
        let booted = self.rootfs.current_hash();
        let still_staged = self.rootfs.pending_hash() == pending.sha256();
        if !still_staged && booted == pending.sha256() && self.apps_in_sync(&pending) {
            info!("Finalizing the pending installation of {}", pending.name());
            if let Err(e) = InstalledVersion::save(&self.db, &pending, InstalledVersionMode::Current)
            {
                error!("Failed to finalize the pending installation: {e}");
            }
        }
    }

    pub fn primary_hwid(&self) -> &str {
        &self.primary_hwid
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }
}

fn tls_material(config: &Config) -> Option<TlsMaterial> {
    let storage = &config.storage;
    if storage.tls_cacert_path.is_none()
        && storage.tls_clientcert_path.is_none()
        && storage.tls_pkey_path.is_none()
    {
        return None;
    }
    Some(TlsMaterial {
        ca_file: storage.tls_cacert_path.clone(),
        cert_file: storage.tls_clientcert_path.clone(),
        pkey_file: storage.tls_pkey_path.clone(),
    })
}

/// One download+install traversal for a selected target
pub struct Installer<'a> {
    client: &'a UpdateClient,
    target: Target,
    reason: String,
    correlation_id: String,
    mode: InstallMode,
    local: Option<LocalUpdateSource>,
}

impl Installer<'_> {
    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Fetch the rootfs commit and re-verify it against the metadata
    pub fn download(&self, token: &FlowControlToken) -> DownloadResult {
        let reason = if self.reason.is_empty() {
            format!("Update to {}", self.target.name())
        } else {
            self.reason.clone()
        };
        info!(
            "Downloading: {} ({}; correlation id {})",
            self.target, reason, self.correlation_id
        );

        let result = match &self.local {
            Some(source) => self.client.rootfs.download_from(
                &format!("file://{}", source.ostree_repo.display()),
                &self.target,
                token,
            ),
            None => self.client.rootfs.download(&self.target, token),
        };
        if !result.is_ok() {
            return result;
        }

        if let Err(e) = self.client.tuf.verify_target(&self.target) {
            error!("Downloaded target is invalid: {e}");
            // leave a trace so the target counts as known-but-failed
            if let Err(db_err) = InstalledVersion::record(&self.client.db, &self.target) {
                error!("Failed to record the failed target: {db_err}");
            }
            return DownloadResult::verification_failed(e.to_string());
        }

        DownloadResult::ok()
    }

    /// Pull apps (per install mode) and stage the deployment
    pub fn install(&self) -> InstallResult {
        info!("Installing: {}", self.target);

        if self.mode == InstallMode::All && self.local.is_none() && !self.target.apps().is_empty()
        {
            if let Err(e) = self
                .client
                .apps
                .fetch_target_apps(&self.target, &FlowControlToken::new())
            {
                error!("Failed to pull apps for {}: {e}", self.target.name());
                return InstallResult::new(
                    InstallStatus::DownloadFailed,
                    format!("failed to pull apps: {e}"),
                );
            }
        }

        let current = self.client.get_current();
        let res = self.client.rootfs.install(&self.target, &current);
        match res.kind {
            InstallKind::Ok => {
                self.client
                    .http
                    .set_default_header("x-ats-target", self.target.name());
                if let Err(e) =
                    InstalledVersion::save(&self.client.db, &self.target, InstalledVersionMode::Current)
                {
                    error!("Failed to record the installed version: {e}");
                }
                let status = if self.mode == InstallMode::OstreeOnly
                    && !self.target.apps().is_empty()
                {
                    InstallStatus::AppsNeedCompletion
                } else {
                    InstallStatus::Ok
                };
                InstallResult::new(status, res.description)
            }
            InstallKind::NeedCompletion => {
                if res.description.contains("bootloader update is in progress") {
                    // the interlock blocked the install; nothing was staged
                    return InstallResult::new(InstallStatus::BootFwNeedsCompletion, res.description);
                }
                self.client
                    .http
                    .set_default_header("x-ats-target", self.target.name());
                if let Err(e) =
                    InstalledVersion::save(&self.client.db, &self.target, InstalledVersionMode::Pending)
                {
                    error!("Failed to record the pending version: {e}");
                }
                InstallResult::new(InstallStatus::NeedsCompletion, res.description)
            }
            _ => InstallResult::new(InstallStatus::Failed, res.description),
        }
    }
}
