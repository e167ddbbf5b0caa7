// src/testing.rs

//! Shared test doubles for the collaborator traits
//!
//! Only compiled for unit tests. The fakes are deliberately dumb: canned
//! HTTP responses keyed by URL, scripted tree-tool results, and
//! flag-driven bootloader state.

use crate::bootloader::{BootFwUpdateStatus, Bootloader};
use crate::error::{Error, Result};
use crate::http::{DownloadSink, Headers, HttpClient, HttpResponse};
use crate::ostree::{Deployment, Sysroot, TreeTool};
use crate::outcome::InstallationResult;
use crate::remote::Remote;
use crate::storage::{StorageProbe, StorageStat};
use crate::target::Target;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// HTTP fake answering every method from one url → response map
pub(crate) struct CannedHttp {
    responses: Mutex<HashMap<String, HttpResponse>>,
    pub requests: Mutex<Vec<String>>,
    pub default_headers: Mutex<HashMap<String, String>>,
}

impl CannedHttp {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
            default_headers: Mutex::new(HashMap::new()),
        }
    }

    pub fn respond(&self, url: &str, status: u16, body: Vec<u8>) {
        self.responses
            .lock()
            .unwrap()
            .insert(url.to_string(), HttpResponse { status, body });
    }

    pub fn respond_json(&self, url: &str, body: Value) {
        self.respond(url, 200, serde_json::to_vec(&body).unwrap());
    }

    fn lookup(&self, url: &str) -> HttpResponse {
        self.requests.lock().unwrap().push(url.to_string());
        self.responses
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .unwrap_or(HttpResponse { status: 404, body: Vec::new() })
    }
}

impl HttpClient for CannedHttp {
    fn get(&self, url: &str, _headers: &Headers, _max_size: u64) -> Result<HttpResponse> {
        Ok(self.lookup(url))
    }

    fn post_json(
        &self,
        url: &str,
        _headers: &Headers,
        _body: Option<&Value>,
    ) -> Result<HttpResponse> {
        Ok(self.lookup(url))
    }

    fn put_json(&self, url: &str, _headers: &Headers, _body: &Value) -> Result<HttpResponse> {
        Ok(self.lookup(url))
    }

    fn download(&self, url: &str, _headers: &Headers, sink: &mut dyn DownloadSink) -> Result<u16> {
        let resp = self.lookup(url);
        if resp.is_ok() {
            for chunk in resp.body.chunks(5) {
                sink.write_chunk(chunk)?;
            }
        }
        Ok(resp.status)
    }

    fn set_default_header(&self, name: &str, value: &str) {
        self.default_headers
            .lock()
            .unwrap()
            .insert(name.to_string(), value.to_string());
    }
}

/// Sysroot fake with settable deployment slots
pub(crate) struct ScriptedSysroot {
    path: PathBuf,
    pub current: Mutex<Option<String>>,
    pub pending: Mutex<Option<String>>,
    pub rollback: Mutex<Option<String>>,
}

impl ScriptedSysroot {
    pub fn booted(hash: &str) -> Self {
        Self {
            path: PathBuf::from("/sysroot"),
            current: Mutex::new(Some(hash.to_string())),
            pending: Mutex::new(None),
            rollback: Mutex::new(None),
        }
    }

    pub fn set_pending(&self, hash: Option<&str>) {
        *self.pending.lock().unwrap() = hash.map(str::to_string);
    }

    pub fn set_current(&self, hash: &str) {
        *self.current.lock().unwrap() = Some(hash.to_string());
    }
}

impl Sysroot for ScriptedSysroot {
    fn path(&self) -> &Path {
        &self.path
    }

    fn deployment_hash(&self, slot: Deployment) -> Option<String> {
        match slot {
            Deployment::Current => self.current.lock().unwrap().clone(),
            Deployment::Pending => self.pending.lock().unwrap().clone(),
            Deployment::Rollback => self.rollback.lock().unwrap().clone(),
        }
    }

    fn deployment_path(&self, _hash: &str) -> Option<PathBuf> {
        None
    }

    fn reload(&self) -> bool {
        true
    }
}

/// Tree tool with scripted pull/install outcomes
pub(crate) struct ScriptedTree {
    pub pull_queue: Mutex<VecDeque<InstallationResult>>,
    pub install_queue: Mutex<VecDeque<InstallationResult>>,
    pub pulls: AtomicUsize,
    pub installs: AtomicUsize,
}

impl ScriptedTree {
    /// Empty queues mean "succeed": pulls return Ok, installs stage
    pub fn happy() -> Self {
        Self {
            pull_queue: Mutex::new(VecDeque::new()),
            install_queue: Mutex::new(VecDeque::new()),
            pulls: AtomicUsize::new(0),
            installs: AtomicUsize::new(0),
        }
    }

    pub fn push_install(&self, result: InstallationResult) {
        self.install_queue.lock().unwrap().push_back(result);
    }
}

impl TreeTool for ScriptedTree {
    fn add_remote(&self, _remote: &Remote) -> Result<()> {
        Ok(())
    }

    fn pull(&self, _remote: &Remote, _hash: &str) -> InstallationResult {
        self.pulls.fetch_add(1, Ordering::SeqCst);
        self.pull_queue
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| InstallationResult::ok(""))
    }

    fn install(&self, _hash: &str) -> InstallationResult {
        self.installs.fetch_add(1, Ordering::SeqCst);
        self.install_queue
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| InstallationResult::need_completion("deployment staged"))
    }
}

/// Bootloader fake driven by plain flags
pub(crate) struct ScriptedBootloader {
    pub supported: bool,
    pub in_progress: Mutex<bool>,
    pub rollback_protection: bool,
    pub current_version: Mutex<Option<String>>,
    pub target_versions: Mutex<HashMap<String, String>>,
}

impl ScriptedBootloader {
    pub fn plain() -> Self {
        Self {
            supported: true,
            in_progress: Mutex::new(false),
            rollback_protection: false,
            current_version: Mutex::new(None),
            target_versions: Mutex::new(HashMap::new()),
        }
    }
}

impl BootFwUpdateStatus for ScriptedBootloader {
    fn is_update_supported(&self) -> bool {
        self.supported
    }

    fn is_update_in_progress(&self) -> bool {
        *self.in_progress.lock().unwrap()
    }
}

impl Bootloader for ScriptedBootloader {
    fn update_notify(&self) {}

    fn install_notify(&self, _target: &Target) {}

    fn is_rollback_protection_enabled(&self) -> bool {
        self.rollback_protection
    }

    fn current_version(&self) -> Option<String> {
        self.current_version.lock().unwrap().clone()
    }

    fn target_version(&self, hash: &str) -> Result<String> {
        self.target_versions
            .lock()
            .unwrap()
            .get(hash)
            .cloned()
            .ok_or_else(|| Error::Unknown(format!("no deployment for {hash}")))
    }
}

// Arc-wrapped fakes usable directly as boxed trait objects while the
// test keeps a handle for inspection
impl TreeTool for std::sync::Arc<ScriptedTree> {
    fn add_remote(&self, remote: &Remote) -> Result<()> {
        self.as_ref().add_remote(remote)
    }

    fn pull(&self, remote: &Remote, hash: &str) -> InstallationResult {
        self.as_ref().pull(remote, hash)
    }

    fn install(&self, hash: &str) -> InstallationResult {
        self.as_ref().install(hash)
    }
}

impl BootFwUpdateStatus for std::sync::Arc<ScriptedBootloader> {
    fn is_update_supported(&self) -> bool {
        self.as_ref().is_update_supported()
    }

    fn is_update_in_progress(&self) -> bool {
        self.as_ref().is_update_in_progress()
    }
}

impl Bootloader for std::sync::Arc<ScriptedBootloader> {
    fn update_notify(&self) {
        self.as_ref().update_notify()
    }

    fn install_notify(&self, target: &Target) {
        self.as_ref().install_notify(target)
    }

    fn is_rollback_protection_enabled(&self) -> bool {
        self.as_ref().is_rollback_protection_enabled()
    }

    fn current_version(&self) -> Option<String> {
        self.as_ref().current_version()
    }

    fn target_version(&self, hash: &str) -> Result<String> {
        self.as_ref().target_version(hash)
    }
}

/// Probe returning a fixed stat regardless of path
pub(crate) struct FixedProbe(pub StorageStat);

impl StorageProbe for FixedProbe {
    fn stat(&self, _path: &Path) -> Result<StorageStat> {
        Ok(self.0)
    }
}

pub(crate) fn roomy_stat() -> StorageStat {
    StorageStat {
        block_count: 1_000_000,
        free_blocks: 900_000,
        block_size: 4096,
    }
}
