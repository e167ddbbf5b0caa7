// src/cli.rs

//! Command flows behind the CLI surface
//!
//! Each flow drives the update controller through one traversal and maps
//! the outcome onto a stable [`StatusCode`]. The binary stays a thin
//! argument parser around these functions.

use crate::client::{InstallMode, LocalUpdateSource, UpdateClient};
use crate::flow::FlowControlToken;
use crate::outcome::{CheckInStatus, DownloadStatus, FinalizeResult, InstallStatus};
use crate::status::StatusCode;
use tracing::{error, info, warn};

fn checkin_code(status: CheckInStatus) -> StatusCode {
    match status {
        CheckInStatus::Ok => StatusCode::Ok,
        CheckInStatus::OkCached => StatusCode::CheckinOkCached,
        CheckInStatus::Failed => StatusCode::CheckinFailure,
    }
}

fn download_code(status: DownloadStatus) -> StatusCode {
    match status {
        DownloadStatus::Ok => StatusCode::Ok,
        DownloadStatus::DownloadFailed => StatusCode::DownloadFailure,
        DownloadStatus::VerificationFailed => StatusCode::DownloadFailureVerificationFailed,
        DownloadStatus::DownloadFailedNoSpace => StatusCode::DownloadFailureNoSpace,
    }
}

fn install_code(status: InstallStatus) -> StatusCode {
    match status {
        InstallStatus::Ok => StatusCode::Ok,
        InstallStatus::OkBootFwNeedsCompletion => StatusCode::OkNeedsRebootForBootFw,
        InstallStatus::NeedsCompletion => StatusCode::InstallNeedsReboot,
        InstallStatus::AppsNeedCompletion => StatusCode::InstallAppsNeedFinalization,
        InstallStatus::BootFwNeedsCompletion => StatusCode::InstallNeedsRebootForBootFw,
        InstallStatus::DownloadFailed => StatusCode::InstallAppPullFailure,
        InstallStatus::Failed => StatusCode::UnknownError,
    }
}

fn finalize_code(result: &FinalizeResult) -> StatusCode {
    match result {
        FinalizeResult::Ok => StatusCode::Ok,
        FinalizeResult::OkBootFwNeedsCompletion => StatusCode::OkNeedsRebootForBootFw,
        FinalizeResult::NeedsReboot => StatusCode::InstallNeedsReboot,
        FinalizeResult::NoPending => StatusCode::NoPendingInstallation,
        FinalizeResult::RollbackOk => StatusCode::InstallRollbackOk,
        FinalizeResult::RollbackNeedsReboot => StatusCode::InstallRollbackNeedsReboot,
        FinalizeResult::RollbackFailed => StatusCode::InstallRollbackFailed,
        FinalizeResult::Unknown(_) => StatusCode::UnknownError,
    }
}

/// `check`: refresh metadata and print the targets for this device
pub fn check(client: &UpdateClient, local: Option<&LocalUpdateSource>) -> StatusCode {
    let cr = match local {
        Some(source) => client.check_in_local(source),
        None => client.check_in(),
    };

    if cr.is_ok() {
        if cr.targets().is_empty() {
            println!("\nNo targets found");
        } else {
            println!("\nFound targets:");
        }
        for target in cr.targets() {
            println!("\tName: {}", target.name());
            println!("\tOSTree hash: {}", target.sha256());
            let apps = target.apps();
            if !apps.is_empty() {
                println!("\tApps:");
                for app in apps {
                    println!("\t\t{} -> {}", app.name, app.uri);
                }
            }
            println!();
        }
    }

    checkin_code(cr.status)
}

/// Options for the `install` flow
#[derive(Debug, Clone, Default)]
pub struct InstallOptions {
    /// Install the target with this version number
    pub version: Option<i64>,
    /// Install the target with this exact name
    pub target_name: Option<String>,
    /// `all` (default) or `delay-app-install`
    pub install_mode: Option<String>,
    /// Allow installing a target older than the current one
    pub force_downgrade: bool,
    pub local: Option<LocalUpdateSource>,
}

/// `install`: check in, select a target, download, and stage it
pub fn install(client: &UpdateClient, opts: &InstallOptions) -> StatusCode {
    let mode = match opts.install_mode.as_deref() {
        None | Some("") | Some("all") => InstallMode::All,
        Some("delay-app-install") => InstallMode::OstreeOnly,
        Some(other) => {
            warn!("Unsupported installation mode: {other}; falling back to the default install mode");
            InstallMode::All
        }
    };

    // the device must be in a clean state before a new traversal starts
    if client.is_installation_in_progress() {
        let pending = client
            .get_pending_target()
            .map(|t| t.name().to_string())
            .unwrap_or_default();
        error!(
            "Cannot start target installation since there is an ongoing installation; target: {pending}"
        );
        return StatusCode::InstallationInProgress;
    }

    let current = client.get_current();
    let cr = match &opts.local {
        Some(source) => client.check_in_local(source),
        None => client.check_in(),
    };
    if cr.status == CheckInStatus::Failed {
        error!("Failed to pull TUF metadata or they are invalid");
        return StatusCode::TufMetaPullFailure;
    }

    let target = if opts.version.is_none() && opts.target_name.is_none() {
        cr.latest(None)
    } else {
        cr.targets()
            .iter()
            .find(|t| {
                opts.version.is_some_and(|v| t.version() == v)
                    || opts.target_name.as_deref().is_some_and(|n| t.name() == n)
            })
            .cloned()
    };
    let Some(target) = target else {
        error!(
            "No target found; version: {}, hardware ID: {}",
            opts.version.map_or_else(|| "latest".to_string(), |v| v.to_string()),
            client.primary_hwid()
        );
        return StatusCode::TufTargetNotFound;
    };

    if current.version() > target.version() {
        warn!(
            "Found target is a lower version than the current one; current: {}, found target: {}",
            current.version(),
            target.version()
        );
        if !opts.force_downgrade {
            error!("Downgrade is not allowed by default, re-run the command with `--force` to force downgrade");
            return StatusCode::InstallDowngradeAttempt;
        }
        warn!("Downgrading from {} to {}...", current.version(), target.version());
    }

    if current == target && client.apps_in_sync(&target) {
        info!(
            "The specified target is already installed, enforcing installation to make sure it's synced and running: {}",
            target.name()
        );
    } else {
        info!("Updating active target: {}", current.name());
        info!("To new target: {}", target.name());
    }

    let Some(installer) = client.installer(&target, None, mode, opts.local.as_ref()) else {
        error!("Unexpected error: installer couldn't find the target; try again later");
        return StatusCode::UnknownError;
    };

    let dr = installer.download(&FlowControlToken::new());
    if !dr.is_ok() {
        error!("Failed to download target; target: {}, err: {dr}", target.name());
        return download_code(dr.status);
    }

    let ir = installer.install();
    if !ir.is_ok() {
        error!("Failed to install target; target: {}, err: {ir}", target.name());
        if ir.status == InstallStatus::Failed {
            // try to get back to the running target right away
            info!("Rolling back to the previous target: {}...", current.name());
            let Some(rollback) = client.installer(&current, None, mode, opts.local.as_ref())
            else {
                error!("Failed to find the previous target in the targets metadata");
                return StatusCode::InstallRollbackFailed;
            };
            let rir = rollback.install();
            if !rir.is_ok() {
                error!("Failed to rollback to {}, err: {rir}", current.name());
            }
            return if rir.status == InstallStatus::Ok {
                StatusCode::InstallRollbackOk
            } else {
                StatusCode::InstallRollbackFailed
            };
        }
    }

    install_code(ir.status)
}

/// `complete`: post-reboot finalization or rollback
pub fn complete(client: &UpdateClient) -> StatusCode {
    if !client.is_installation_in_progress() {
        error!("There is no pending installation to complete");
        return StatusCode::NoPendingInstallation;
    }
    let pending = client.get_pending_target();
    let result = client.complete_installation();
    if !matches!(result, FinalizeResult::Ok | FinalizeResult::OkBootFwNeedsCompletion) {
        if let Some(pending) = pending {
            warn!(
                "Finalization of {} did not complete cleanly: {result:?}",
                pending.name()
            );
        }
    }
    finalize_code(&result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apps::{AppFetcher, AppStore};
    use crate::client::UpdateClient;
    use crate::db;
    use crate::outcome::InstallationResult;
    use crate::registry::RegistryClient;
    use crate::rootfs::{RootfsConfig, RootfsTreeManager};
    use crate::testing::{roomy_stat, CannedHttp, FixedProbe, ScriptedBootloader, ScriptedSysroot, ScriptedTree};
    use crate::tuf::JsonTufSource;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn hash(c: char) -> String {
        c.to_string().repeat(64)
    }

    fn target_meta(fill: char, version: i64) -> Value {
        json!({
            "hashes": {"sha256": hash(fill)},
            "length": 0,
            "custom": {
                "version": version.to_string(),
                "hardwareIds": ["raspberrypi4-64"],
                "tags": ["main"],
            },
        })
    }

    struct Rig {
        dir: TempDir,
        sysroot: Arc<ScriptedSysroot>,
        tree: Arc<ScriptedTree>,
    }

    impl Rig {
        /// Booted on hash('a') (= version 41); metadata offers 41 and 42
        fn new() -> (Self, UpdateClient) {
            Self::with_targets(json!({
                "device-lmp-41": target_meta('a', 41),
                "device-lmp-42": target_meta('b', 42),
            }))
        }

        fn with_targets(targets: Value) -> (Self, UpdateClient) {
            let dir = TempDir::new().unwrap();
            let http = Arc::new(CannedHttp::new());
            let sysroot = Arc::new(ScriptedSysroot::booted(&hash('a')));
            let tree = Arc::new(ScriptedTree::happy());
            let bootloader = Arc::new(ScriptedBootloader::plain());

            std::fs::write(
                dir.path().join("targets.json"),
                serde_json::to_vec(&json!({"signed": {"targets": targets}})).unwrap(),
            )
            .unwrap();

            let rootfs = RootfsTreeManager::new(
                sysroot.clone(),
                Box::new(tree.clone()),
                Box::new(bootloader),
                http.clone(),
                Box::new(FixedProbe(roomy_stat())),
                "https://g/",
                None,
                RootfsConfig::default(),
            );
            let apps = AppFetcher::new(
                RegistryClient::new(http.clone(), "https://gw/treehub/api/v3/"),
                AppStore::new(dir.path().join("apps")),
            );
            let tuf = Box::new(JsonTufSource::new(dir.path().join("targets.json")));
            let database = db::init(dir.path().join("sql.db")).unwrap();

            let client = UpdateClient::new(
                http,
                tuf,
                rootfs,
                apps,
                database,
                "raspberrypi4-64",
                vec!["main".to_string()],
                "https://gw",
            );
            (Self { dir, sysroot, tree }, client)
        }
    }

    #[test]
    fn test_check_reports_ok() {
        let (_rig, client) = Rig::new();
        assert_eq!(check(&client, None), StatusCode::Ok);
    }

    #[test]
    fn test_check_reports_cached_after_refresh_failure() {
        let (rig, client) = Rig::new();
        assert_eq!(check(&client, None), StatusCode::Ok);
        std::fs::remove_file(rig.dir.path().join("targets.json")).unwrap();
        assert_eq!(check(&client, None), StatusCode::CheckinOkCached);
    }

    #[test]
    fn test_check_failure_code() {
        let (rig, client) = Rig::new();
        std::fs::remove_file(rig.dir.path().join("targets.json")).unwrap();
        assert_eq!(check(&client, None), StatusCode::CheckinFailure);
    }

    #[test]
    fn test_install_latest_stages_and_needs_reboot() {
        let (_rig, client) = Rig::new();
        let code = install(&client, &InstallOptions::default());
        assert_eq!(code, StatusCode::InstallNeedsReboot);
        assert!(client.is_installation_in_progress());
    }

    #[test]
    fn test_install_by_version_and_by_name() {
        let (_rig, client) = Rig::new();
        let code = install(
            &client,
            &InstallOptions { version: Some(42), ..Default::default() },
        );
        assert_eq!(code, StatusCode::InstallNeedsReboot);
        assert_eq!(client.get_pending_target().unwrap().name(), "device-lmp-42");

        let (_rig2, client2) = Rig::new();
        let code = install(
            &client2,
            &InstallOptions {
                target_name: Some("device-lmp-42".to_string()),
                ..Default::default()
            },
        );
        assert_eq!(code, StatusCode::InstallNeedsReboot);
    }

    #[test]
    fn test_install_unknown_target_not_found() {
        let (_rig, client) = Rig::new();
        let code = install(
            &client,
            &InstallOptions { version: Some(99), ..Default::default() },
        );
        assert_eq!(code, StatusCode::TufTargetNotFound);
    }

    #[test]
    fn test_install_refused_while_in_progress() {
        let (_rig, client) = Rig::new();
        assert_eq!(install(&client, &InstallOptions::default()), StatusCode::InstallNeedsReboot);
        assert_eq!(
            install(&client, &InstallOptions::default()),
            StatusCode::InstallationInProgress
        );
    }

    #[test]
    fn test_install_downgrade_refused_without_force() {
        let (rig, client) = Rig::new();
        // boot the device on v42's hash and confirm it as current
        rig.sysroot.set_current(&hash('b'));
        assert_eq!(
            install(&client, &InstallOptions { version: Some(42), ..Default::default() }),
            StatusCode::Ok
        );

        let code = install(
            &client,
            &InstallOptions { version: Some(41), ..Default::default() },
        );
        assert_eq!(code, StatusCode::InstallDowngradeAttempt);

        let code = install(
            &client,
            &InstallOptions { version: Some(41), force_downgrade: true, ..Default::default() },
        );
        assert_eq!(code, StatusCode::InstallNeedsReboot);
    }

    #[test]
    fn test_install_metadata_failure_code() {
        let (rig, client) = Rig::new();
        std::fs::remove_file(rig.dir.path().join("targets.json")).unwrap();
        assert_eq!(
            install(&client, &InstallOptions::default()),
            StatusCode::TufMetaPullFailure
        );
    }

    #[test]
    fn test_install_download_failure_codes() {
        let (rig, client) = Rig::new();
        rig.tree
            .pull_queue
            .lock()
            .unwrap()
            .push_back(InstallationResult::download_failed("origin down"));
        assert_eq!(
            install(&client, &InstallOptions::default()),
            StatusCode::DownloadFailure
        );

        let (rig, client) = Rig::new();
        rig.tree.pull_queue.lock().unwrap().push_back(InstallationResult::download_failed(
            "min-free-space-percent 3% would be exceeded, at least 42 bytes needed",
        ));
        assert_eq!(
            install(&client, &InstallOptions::default()),
            StatusCode::DownloadFailureNoSpace
        );
    }

    #[test]
    fn test_install_hard_failure_rolls_back_to_current() {
        let (rig, client) = Rig::new();
        // confirm v41 so the rollback target resolves in metadata
        assert_eq!(
            install(&client, &InstallOptions { version: Some(41), ..Default::default() }),
            StatusCode::Ok
        );
        // the staging of v42 fails hard; rolling back installs v41 which
        // is already current -> Ok
        rig.tree
            .push_install(InstallationResult::install_failed("deploy exploded"));
        let code = install(
            &client,
            &InstallOptions { version: Some(42), ..Default::default() },
        );
        assert_eq!(code, StatusCode::InstallRollbackOk);
    }

    #[test]
    fn test_complete_without_pending() {
        let (_rig, client) = Rig::new();
        assert_eq!(complete(&client), StatusCode::NoPendingInstallation);
    }

    #[test]
    fn test_complete_full_cycle() {
        let (rig, client) = Rig::new();
        assert_eq!(install(&client, &InstallOptions::default()), StatusCode::InstallNeedsReboot);

        // not rebooted yet
        rig.sysroot.set_pending(Some(&hash('b')));
        assert_eq!(complete(&client), StatusCode::InstallNeedsReboot);

        // rebooted into the new deployment
        rig.sysroot.set_pending(None);
        rig.sysroot.set_current(&hash('b'));
        assert_eq!(complete(&client), StatusCode::Ok);
        assert_eq!(client.get_current().name(), "device-lmp-42");
    }

    #[test]
    fn test_complete_bootloader_rollback_code() {
        let (rig, client) = Rig::new();
        assert_eq!(
            install(&client, &InstallOptions { version: Some(41), ..Default::default() }),
            StatusCode::Ok
        );
        assert_eq!(install(&client, &InstallOptions::default()), StatusCode::InstallNeedsReboot);

        // reboot happened but the device came back on the old deployment
        rig.sysroot.set_pending(None);
        assert_eq!(complete(&client), StatusCode::InstallRollbackOk);
    }
}
