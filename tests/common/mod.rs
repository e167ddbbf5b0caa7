// tests/common/mod.rs

//! Test doubles for the collaborator traits, built on the public API
//!
//! A `Device` bundles a full controller wired to scripted fakes: canned
//! HTTP, a settable sysroot, a tree tool with scriptable outcomes, and a
//! flag-driven bootloader.

use otad::apps::{AppFetcher, AppStore};
use otad::bootloader::{BootFwUpdateStatus, Bootloader};
use otad::db;
use otad::http::{DownloadSink, Headers, HttpClient, HttpResponse};
use otad::ostree::{Deployment, Sysroot, TreeTool};
use otad::outcome::InstallationResult;
use otad::registry::RegistryClient;
use otad::remote::Remote;
use otad::rootfs::{RootfsConfig, RootfsTreeManager};
use otad::storage::{StorageProbe, StorageStat};
use otad::target::Target;
use otad::tuf::JsonTufSource;
use otad::{Result, UpdateClient};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

pub fn hash(c: char) -> String {
    c.to_string().repeat(64)
}

pub fn target_meta(fill: char, version: i64, hwid: &str, tags: &[&str]) -> Value {
    serde_json::json!({
        "hashes": {"sha256": hash(fill)},
        "length": 0,
        "custom": {
            "version": version.to_string(),
            "hardwareIds": [hwid],
            "tags": tags,
        },
    })
}

// ----------------------------------------------------------------------
// HTTP
// ----------------------------------------------------------------------

pub struct FakeHttp {
    responses: Mutex<HashMap<String, HttpResponse>>,
    pub requests: Mutex<Vec<String>>,
}

impl FakeHttp {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
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

pub struct HttpRef(pub Arc<FakeHttp>);

impl HttpClient for HttpRef {
    fn get(&self, url: &str, _headers: &Headers, _max_size: u64) -> Result<HttpResponse> {
        Ok(self.0.lookup(url))
    }

    fn post_json(
        &self,
        url: &str,
        _headers: &Headers,
        _body: Option<&Value>,
    ) -> Result<HttpResponse> {
        Ok(self.0.lookup(url))
    }

    fn put_json(&self, url: &str, _headers: &Headers, _body: &Value) -> Result<HttpResponse> {
        Ok(self.0.lookup(url))
    }

    fn download(&self, url: &str, _headers: &Headers, sink: &mut dyn DownloadSink) -> Result<u16> {
        let resp = self.0.lookup(url);
        if resp.is_ok() {
            for chunk in resp.body.chunks(11) {
                sink.write_chunk(chunk)?;
            }
        }
        Ok(resp.status)
    }

    fn set_default_header(&self, _name: &str, _value: &str) {}
}

// ----------------------------------------------------------------------
// sysroot and tree tool
// ----------------------------------------------------------------------

pub struct FakeSysroot {
    path: PathBuf,
    pub current: Mutex<Option<String>>,
    pub pending: Mutex<Option<String>>,
}

impl FakeSysroot {
    pub fn booted(hash: &str) -> Self {
        Self {
            path: PathBuf::from("/sysroot"),
            current: Mutex::new(Some(hash.to_string())),
            pending: Mutex::new(None),
        }
    }

    pub fn reboot_into(&self, hash: &str) {
        *self.current.lock().unwrap() = Some(hash.to_string());
        *self.pending.lock().unwrap() = None;
    }
}

pub struct SysrootRef(pub Arc<FakeSysroot>);

impl Sysroot for SysrootRef {
    fn path(&self) -> &Path {
        &self.0.path
    }

    fn deployment_hash(&self, slot: Deployment) -> Option<String> {
        match slot {
            Deployment::Current => self.0.current.lock().unwrap().clone(),
            Deployment::Pending => self.0.pending.lock().unwrap().clone(),
            Deployment::Rollback => None,
        }
    }

    fn deployment_path(&self, _hash: &str) -> Option<PathBuf> {
        None
    }

    fn reload(&self) -> bool {
        true
    }
}

#[derive(Default)]
pub struct FakeTree {
    pub pull_queue: Mutex<VecDeque<InstallationResult>>,
    pub install_queue: Mutex<VecDeque<InstallationResult>>,
    pub pulled_from: Mutex<Vec<String>>,
    pub installs: AtomicUsize,
}

pub struct TreeRef(pub Arc<FakeTree>);

impl TreeTool for TreeRef {
    fn add_remote(&self, _remote: &Remote) -> Result<()> {
        Ok(())
    }

    fn pull(&self, remote: &Remote, _hash: &str) -> InstallationResult {
        self.0.pulled_from.lock().unwrap().push(remote.base_url.clone());
        self.0
            .pull_queue
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| InstallationResult::ok(""))
    }

    fn install(&self, _hash: &str) -> InstallationResult {
        self.0
            .installs
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.0
            .install_queue
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| InstallationResult::need_completion("deployment staged"))
    }
}

// ----------------------------------------------------------------------
// bootloader
// ----------------------------------------------------------------------

pub struct FakeBootloader {
    pub in_progress: Mutex<bool>,
    pub rollback_protection: Mutex<bool>,
    pub current_version: Mutex<Option<String>>,
    pub target_versions: Mutex<HashMap<String, String>>,
}

impl FakeBootloader {
    pub fn plain() -> Self {
        Self {
            in_progress: Mutex::new(false),
            rollback_protection: Mutex::new(false),
            current_version: Mutex::new(None),
            target_versions: Mutex::new(HashMap::new()),
        }
    }
}

pub struct BootloaderRef(pub Arc<FakeBootloader>);

impl BootFwUpdateStatus for BootloaderRef {
    fn is_update_supported(&self) -> bool {
        true
    }

    fn is_update_in_progress(&self) -> bool {
        *self.0.in_progress.lock().unwrap()
    }
}

impl Bootloader for BootloaderRef {
    fn update_notify(&self) {}

    fn install_notify(&self, _target: &Target) {}

    fn is_rollback_protection_enabled(&self) -> bool {
        *self.0.rollback_protection.lock().unwrap()
    }

    fn current_version(&self) -> Option<String> {
        self.0.current_version.lock().unwrap().clone()
    }

    fn target_version(&self, hash: &str) -> Result<String> {
        self.0
            .target_versions
            .lock()
            .unwrap()
            .get(hash)
            .cloned()
            .ok_or_else(|| otad::Error::Unknown(format!("no deployment for {hash}")))
    }
}

pub struct FixedProbe(pub StorageStat);

impl StorageProbe for FixedProbe {
    fn stat(&self, _path: &Path) -> Result<StorageStat> {
        Ok(self.0)
    }
}

// ----------------------------------------------------------------------
// a whole wired device
// ----------------------------------------------------------------------

pub struct Device {
    pub dir: TempDir,
    pub http: Arc<FakeHttp>,
    pub sysroot: Arc<FakeSysroot>,
    pub tree: Arc<FakeTree>,
    pub bootloader: Arc<FakeBootloader>,
    pub client: UpdateClient,
}

impl Device {
    /// Booted on `booted_hash`, with `targets` as the accepted metadata
    pub fn new(targets: Value, booted_hash: &str) -> Self {
        let dir = TempDir::new().unwrap();
        let http = Arc::new(FakeHttp::new());
        let sysroot = Arc::new(FakeSysroot::booted(booted_hash));
        let tree = Arc::new(FakeTree::default());
        let bootloader = Arc::new(FakeBootloader::plain());

        std::fs::write(
            dir.path().join("targets.json"),
            serde_json::to_vec(&serde_json::json!({"signed": {"targets": targets}})).unwrap(),
        )
        .unwrap();

        let rootfs = RootfsTreeManager::new(
            Arc::new(SysrootRef(sysroot.clone())),
            Box::new(TreeRef(tree.clone())),
            Box::new(BootloaderRef(bootloader.clone())),
            Arc::new(HttpRef(http.clone())),
            Box::new(FixedProbe(StorageStat {
                block_count: 1_000_000,
                free_blocks: 900_000,
                block_size: 4096,
            })),
            "https://gateway.example.com",
            None,
            RootfsConfig::default(),
        );
        let apps = AppFetcher::new(
            RegistryClient::new(
                Arc::new(HttpRef(http.clone())),
                "https://gateway.example.com/treehub/api/v3/",
            ),
            AppStore::new(dir.path().join("apps")),
        );
        let tuf = Box::new(JsonTufSource::new(dir.path().join("targets.json")));
        let database = db::init(dir.path().join("sql.db")).unwrap();

        let client = UpdateClient::new(
            Arc::new(HttpRef(http.clone())),
            tuf,
            rootfs,
            apps,
            database,
            "raspberrypi4-64",
            vec!["main".to_string()],
            "https://gateway.example.com",
        );

        Self { dir, http, sysroot, tree, bootloader, client }
    }

    pub fn rewrite_targets(&self, targets: &Value) {
        std::fs::write(
            self.dir.path().join("targets.json"),
            serde_json::to_vec(&serde_json::json!({"signed": {"targets": targets}})).unwrap(),
        )
        .unwrap();
    }
}
