// src/apps.rs

//! Compose-app artifact fetcher
//!
//! Applications referenced by a target are pulled from the registry into
//! a local store: manifests under `manifests/<hash>.json`, blobs under
//! `blobs/sha256/<hash>`. The agent only fetches and verifies content;
//! starting the containers belongs to the runtime. The store layout lets
//! the post-reboot sync check answer "are this target's apps present?"
//! without touching the network.

use crate::error::{Error, Result};
use crate::flow::FlowControlToken;
use crate::registry::{HashedDigest, RegistryClient, Uri};
use crate::target::{Target, TargetApp};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Accept header used for app manifests
pub const MANIFEST_FORMAT: &str = "application/vnd.oci.image.manifest.v1+json";

/// On-disk layout of fetched app content
pub struct AppStore {
    root: PathBuf,
}

impl AppStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest_path(&self, hash: &str) -> PathBuf {
        self.root.join("manifests").join(format!("{hash}.json"))
    }

    pub fn blob_path(&self, hash: &str) -> PathBuf {
        self.root.join("blobs").join("sha256").join(hash)
    }

    /// Is a blob present with the expected size?
    pub fn has_blob(&self, hash: &str, expected_size: u64) -> bool {
        std::fs::metadata(self.blob_path(hash))
            .map(|m| m.is_file() && m.len() == expected_size)
            .unwrap_or(false)
    }

    fn save_manifest(&self, hash: &str, manifest: &Value) -> Result<()> {
        let path = self.manifest_path(hash);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Io(format!("failed to create {}: {e}", parent.display())))?;
        }
        std::fs::write(&path, serde_json::to_vec(manifest)?)
            .map_err(|e| Error::Io(format!("failed to write {}: {e}", path.display())))?;
        Ok(())
    }

    fn load_manifest(&self, hash: &str) -> Option<Value> {
        let bytes = std::fs::read(self.manifest_path(hash)).ok()?;
        serde_json::from_slice(&bytes).ok()
    }
}

/// One content descriptor (config or layer) of an app manifest
struct Descriptor {
    digest: HashedDigest,
    size: u64,
}

fn manifest_descriptors(manifest: &Value) -> Result<Vec<Descriptor>> {
    let mut descriptors = Vec::new();

    let mut entries: Vec<&Value> = Vec::new();
    if let Some(config) = manifest.get("config") {
        entries.push(config);
    }
    if let Some(layers) = manifest.get("layers").and_then(Value::as_array) {
        entries.extend(layers.iter());
    }

    for entry in entries {
        let digest = entry
            .get("digest")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::InvalidArgument("descriptor without digest".to_string()))?;
        let size = entry
            .get("size")
            .and_then(Value::as_u64)
            .ok_or_else(|| Error::InvalidArgument("descriptor without size".to_string()))?;
        descriptors.push(Descriptor {
            digest: HashedDigest::parse(digest)?,
            size,
        });
    }

    Ok(descriptors)
}

/// Pulls app manifests and blobs into the store
pub struct AppFetcher {
    registry: RegistryClient,
    store: AppStore,
}

impl AppFetcher {
    pub fn new(registry: RegistryClient, store: AppStore) -> Self {
        Self { registry, store }
    }

    pub fn store(&self) -> &AppStore {
        &self.store
    }

    /// Fetch one app: manifest plus every referenced blob
    ///
    /// Blobs already present with the right size are skipped. The token
    /// is checked between blobs.
    pub fn fetch_app(&self, app: &TargetApp, token: &FlowControlToken) -> Result<()> {
        let uri = Uri::parse(&app.uri)?;
        info!("Pulling app {} -> {}", app.name, app.uri);

        let manifest = self.registry.manifest(&uri, MANIFEST_FORMAT)?;
        self.store.save_manifest(uri.digest.hash(), &manifest)?;

        for descriptor in manifest_descriptors(&manifest)? {
            if token.is_aborted() {
                return Err(Error::Download("cancelled".to_string()));
            }
            if self.store.has_blob(descriptor.digest.hash(), descriptor.size) {
                debug!("Blob {} already present, skipping", descriptor.digest.short_hash());
                continue;
            }
            self.registry.download_blob(
                &uri.with_digest(descriptor.digest.clone()),
                &self.store.blob_path(descriptor.digest.hash()),
                descriptor.size,
            )?;
        }

        Ok(())
    }

    /// Fetch every app the target references
    pub fn fetch_target_apps(&self, target: &Target, token: &FlowControlToken) -> Result<()> {
        for app in target.apps() {
            self.fetch_app(&app, token)?;
        }
        Ok(())
    }

    /// Are all of the target's apps fully present in the store?
    pub fn target_apps_in_sync(&self, target: &Target) -> bool {
        for app in target.apps() {
            let Ok(uri) = Uri::parse(&app.uri) else {
                warn!("App {} has an unparseable URI: {}", app.name, app.uri);
                return false;
            };
            let Some(manifest) = self.store.load_manifest(uri.digest.hash()) else {
                return false;
            };
            let Ok(descriptors) = manifest_descriptors(&manifest) else {
                return false;
            };
            if !descriptors
                .iter()
                .all(|d| self.store.has_blob(d.digest.hash(), d.size))
            {
                return false;
            }
        }
        true
    }
}
