// src/ostree.rs

//! Content-addressed tree collaborator
//!
//! The agent never speaks the OSTree object-store protocol itself; it
//! drives the tree tool through two narrow traits. [`Sysroot`] answers
//! questions about deployments on disk (booted, pending, rollback) and
//! [`TreeTool`] performs remote registration, pulls, and deployment
//! staging. The production implementations shell out to the `ostree`
//! binary; tests substitute fakes.

use crate::error::{Error, Result};
use crate::outcome::InstallationResult;
use crate::remote::Remote;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;
use tracing::{debug, warn};

/// Deployment slots of an OSTree sysroot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deployment {
    /// The deployment the device is booted on
    Current,
    /// Staged, becomes active after reboot
    Pending,
    /// The previous deployment kept for rollback
    Rollback,
}

/// Read-side view of the sysroot
pub trait Sysroot: Send + Sync {
    /// Root of the physical sysroot
    fn path(&self) -> &Path;

    /// The content-addressed repository under the sysroot
    fn repo_path(&self) -> PathBuf {
        self.path().join("ostree").join("repo")
    }

    /// Commit hash occupying `slot`, if any
    fn deployment_hash(&self, slot: Deployment) -> Option<String>;

    /// On-disk root directory of the deployment with `hash`
    fn deployment_path(&self, hash: &str) -> Option<PathBuf>;

    /// Re-read deployment state; true when something changed
    fn reload(&self) -> bool;
}

/// Write-side operations delegated to the tree tool
pub trait TreeTool: Send + Sync {
    /// Register a fetch origin (TLS material included) with the repo
    fn add_remote(&self, remote: &Remote) -> Result<()>;

    /// Pull a commit from a registered origin
    fn pull(&self, remote: &Remote, hash: &str) -> InstallationResult;

    /// Stage a deployment of a pulled commit
    fn install(&self, hash: &str) -> InstallationResult;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct SysrootState {
    current: Option<String>,
    pending: Option<String>,
    rollback: Option<String>,
}

/// Sysroot view backed by `ostree admin status`
pub struct OstreeSysroot {
    path: PathBuf,
    os_name: String,
    state: Mutex<SysrootState>,
}

impl OstreeSysroot {
    pub fn new(path: impl Into<PathBuf>, os_name: impl Into<String>) -> Self {
        let sysroot = Self {
            path: path.into(),
            os_name: os_name.into(),
            state: Mutex::new(SysrootState::default()),
        };
        sysroot.reload();
        sysroot
    }

    fn read_state(&self) -> SysrootState {
        let output = Command::new("ostree")
            .arg("admin")
            .arg("status")
            .arg(format!("--sysroot={}", self.path.display()))
            .output();

        match output {
            Ok(out) if out.status.success() => {
                parse_admin_status(&String::from_utf8_lossy(&out.stdout))
            }
            Ok(out) => {
                warn!(
                    "ostree admin status failed: {}",
                    String::from_utf8_lossy(&out.stderr).trim()
                );
                SysrootState::default()
            }
            Err(e) => {
                warn!("failed to run ostree admin status: {e}");
                SysrootState::default()
            }
        }
    }
}

impl Sysroot for OstreeSysroot {
    fn path(&self) -> &Path {
        &self.path
    }

    fn deployment_hash(&self, slot: Deployment) -> Option<String> {
        let state = self.state.lock().unwrap();
        match slot {
            Deployment::Current => state.current.clone(),
            Deployment::Pending => state.pending.clone(),
            Deployment::Rollback => state.rollback.clone(),
        }
    }

    fn deployment_path(&self, hash: &str) -> Option<PathBuf> {
        let deploy_dir = self
            .path
            .join("ostree")
            .join("deploy")
            .join(&self.os_name)
            .join("deploy");
        let entries = std::fs::read_dir(&deploy_dir).ok()?;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            // deployments are named <hash>.<serial>
            if name.starts_with(hash) && entry.path().is_dir() {
                return Some(entry.path());
            }
        }
        None
    }

    fn reload(&self) -> bool {
        let fresh = self.read_state();
        let mut state = self.state.lock().unwrap();
        let changed = *state != fresh;
        *state = fresh;
        changed
    }
}

/// Parse `ostree admin status` output into deployment slots
///
/// Deployment lines have the shape `[*] <osname> <hash>.<serial>` with an
/// optional `(pending)` / `(rollback)` annotation; indented property
/// lines are skipped. Without an annotation, a deployment listed before
/// the booted one is pending and one after it is rollback.
fn parse_admin_status(output: &str) -> SysrootState {
    let mut state = SysrootState::default();
    let mut seen_booted = false;

    for line in output.lines() {
        let trimmed = line.trim_start();
        let (booted, rest) = match trimmed.strip_prefix('*') {
            Some(rest) => (true, rest.trim_start()),
            None => (false, trimmed),
        };

        // property lines are indented deeper than deployment lines
        if !booted && line.starts_with("    ") {
            continue;
        }

        let mut tokens = rest.split_whitespace();
        let Some(_osname) = tokens.next() else { continue };
        let Some(commit) = tokens.next() else { continue };
        let Some(hash) = commit.split('.').next() else { continue };
        if hash.len() != 64 || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
            continue;
        }
        let annotation = tokens.next().unwrap_or("");

        if booted {
            state.current = Some(hash.to_string());
            seen_booted = true;
        } else if annotation == "(rollback)" || (seen_booted && annotation != "(pending)") {
            if state.rollback.is_none() {
                state.rollback = Some(hash.to_string());
            }
        } else if state.pending.is_none() {
            state.pending = Some(hash.to_string());
        }
    }

    state
}

/// Tree tool backed by the `ostree` binary
pub struct OstreeCli {
    sysroot_path: PathBuf,
    repo_path: PathBuf,
    os_name: String,
}

impl OstreeCli {
    pub fn new(sysroot_path: impl Into<PathBuf>, os_name: impl Into<String>) -> Self {
        let sysroot_path = sysroot_path.into();
        let repo_path = sysroot_path.join("ostree").join("repo");
        Self {
            sysroot_path,
            repo_path,
            os_name: os_name.into(),
        }
    }

    fn run(&self, args: &[String]) -> Result<String> {
        debug!("ostree {}", args.join(" "));
        let output = Command::new("ostree")
            .args(args)
            .output()
            .map_err(|e| Error::Io(format!("failed to run ostree: {e}")))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(Error::Unknown(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }
}

impl TreeTool for OstreeCli {
    fn add_remote(&self, remote: &Remote) -> Result<()> {
        let mut args = vec![
            "remote".to_string(),
            "add".to_string(),
            format!("--repo={}", self.repo_path.display()),
            "--force".to_string(),
            "--no-gpg-verify".to_string(),
        ];
        if let Some(keys) = &remote.keys {
            if let Some(ca) = &keys.ca_file {
                args.push(format!("--set=tls-ca-path={}", ca.display()));
            }
            if let Some(cert) = &keys.cert_file {
                args.push(format!("--set=tls-client-cert-path={}", cert.display()));
            }
            if let Some(pkey) = &keys.pkey_file {
                args.push(format!("--set=tls-client-key-path={}", pkey.display()));
            }
        }
        args.push(remote.name.clone());
        args.push(remote.base_url.clone());

        self.run(&args).map(|_| ())
    }

    fn pull(&self, remote: &Remote, hash: &str) -> InstallationResult {
        let mut args = vec![
            "pull".to_string(),
            format!("--repo={}", self.repo_path.display()),
        ];
        for (name, value) in &remote.headers {
            args.push(format!("--http-header={name}={value}"));
        }
        args.push(remote.name.clone());
        args.push(hash.to_string());

        match self.run(&args) {
            Ok(_) => InstallationResult::ok(""),
            Err(e) => InstallationResult::download_failed(e.to_string()),
        }
    }

    fn install(&self, hash: &str) -> InstallationResult {
        let mut args = vec![
            "admin".to_string(),
            "deploy".to_string(),
            format!("--sysroot={}", self.sysroot_path.display()),
            "--stage".to_string(),
        ];
        if !self.os_name.is_empty() {
            args.push(format!("--os={}", self.os_name));
        }
        args.push(hash.to_string());

        match self.run(&args) {
            Ok(_) => InstallationResult::need_completion("deployment staged, reboot to activate"),
            Err(e) => InstallationResult::install_failed(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(c: char) -> String {
        c.to_string().repeat(64)
    }

    #[test]
    fn test_parse_status_booted_only() {
        let out = format!("* lmp {}.0\n    origin refspec: otad-remote:{}\n", hash('a'), hash('a'));
        let state = parse_admin_status(&out);
        assert_eq!(state.current, Some(hash('a')));
        assert_eq!(state.pending, None);
        assert_eq!(state.rollback, None);
    }

    #[test]
    fn test_parse_status_pending_listed_first() {
        let out = format!(
            "  lmp {}.0 (pending)\n* lmp {}.0\n  lmp {}.1 (rollback)\n",
            hash('b'),
            hash('a'),
            hash('c')
        );
        let state = parse_admin_status(&out);
        assert_eq!(state.current, Some(hash('a')));
        assert_eq!(state.pending, Some(hash('b')));
        assert_eq!(state.rollback, Some(hash('c')));
    }

    #[test]
    fn test_parse_status_positional_classification() {
        // no annotations: before the booted entry = pending, after = rollback
        let out = format!("  lmp {}.0\n* lmp {}.0\n  lmp {}.1\n", hash('b'), hash('a'), hash('c'));
        let state = parse_admin_status(&out);
        assert_eq!(state.pending, Some(hash('b')));
        assert_eq!(state.current, Some(hash('a')));
        assert_eq!(state.rollback, Some(hash('c')));
    }

    #[test]
    fn test_parse_status_skips_property_lines() {
        let out = format!(
            "* lmp {}.0\n    Version: 92\n    origin refspec: gcs:{}\n",
            hash('a'),
            hash('a')
        );
        let state = parse_admin_status(&out);
        assert_eq!(state.current, Some(hash('a')));
        assert_eq!(state.pending, None);
    }

    #[test]
    fn test_parse_status_ignores_garbage() {
        let state = parse_admin_status("No deployments.\n");
        assert_eq!(state, SysrootState::default());
    }
}
