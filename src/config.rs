// src/config.rs

//! Agent configuration from merged TOML fragments
//!
//! Configuration is assembled from an ordered list of sources; later
//! sources override earlier ones key by key. A source is either a single
//! TOML file or a directory whose `*.toml` entries are merged in sorted
//! order. Keys the core does not model explicitly (the `pacman` extras
//! such as `sysroot_storage_watermark`) are kept in a free-form string
//! map and interpreted by their consumers.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Default configuration sources, lowest precedence first
pub const CONFIG_SOURCES: [&str; 3] = [
    "/usr/lib/sota/conf.d",
    "/var/sota/sota.toml",
    "/etc/sota/conf.d",
];

/// Truthiness rule for free-form config values
///
/// Any string other than `"0"` and `"false"` counts as true.
pub fn is_truthy(val: &str) -> bool {
    val != "0" && val != "false"
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub pacman: PacmanConfig,
    pub provision: ProvisionConfig,
    pub tls: TlsConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PacmanConfig {
    /// Path to the content-addressed tree root
    pub sysroot: PathBuf,
    /// Default base URL for root-filesystem fetch
    pub ostree_server: String,
    /// Stateroot name the tree tool deploys into
    pub os: String,
    /// Comma-separated list of acceptable target tags
    pub tags: String,
    /// Directory the compose-app store lives in
    pub apps_root: PathBuf,
    /// Keys the core maps itself (watermark, bootloader blocker, ...)
    #[serde(flatten)]
    pub extra: HashMap<String, String>,
}

impl Default for PacmanConfig {
    fn default() -> Self {
        Self {
            sysroot: PathBuf::from("/sysroot"),
            ostree_server: String::new(),
            os: String::new(),
            tags: String::new(),
            apps_root: PathBuf::from("/var/sota/apps"),
            extra: HashMap::new(),
        }
    }
}

impl PacmanConfig {
    /// Configured tags as a trimmed list; empty entries dropped
    pub fn tag_list(&self) -> Vec<String> {
        self.tags
            .split(',')
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ProvisionConfig {
    /// Hardware class of the primary ECU
    pub primary_ecu_hardware_id: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct TlsConfig {
    /// Metadata/device-gateway server base URL
    pub server: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding the agent's persistent state
    pub path: PathBuf,
    /// Device TLS material for mutually-authenticated fetch origins
    pub tls_cacert_path: Option<PathBuf>,
    pub tls_clientcert_path: Option<PathBuf>,
    pub tls_pkey_path: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/sota"),
            tls_cacert_path: None,
            tls_clientcert_path: None,
            tls_pkey_path: None,
        }
    }
}

impl StorageConfig {
    pub fn sqldb_path(&self) -> PathBuf {
        self.path.join("sql.db")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.path.join("otad.lock")
    }

    /// Verified targets metadata maintained by the TUF collaborator
    pub fn tuf_targets_path(&self) -> PathBuf {
        self.path.join("import").join("targets.json")
    }
}

impl Config {
    /// Load from the default source list
    pub fn load_default() -> Result<Self> {
        let sources: Vec<PathBuf> = CONFIG_SOURCES.iter().map(PathBuf::from).collect();
        Self::load(&sources)
    }

    /// Load and merge an explicit ordered list of sources
    ///
    /// Missing sources are skipped; an empty result is a valid (default)
    /// configuration.
    pub fn load(sources: &[PathBuf]) -> Result<Self> {
        let mut merged = toml::Value::Table(toml::map::Map::new());

        for source in sources {
            if source.is_dir() {
                let mut entries: Vec<PathBuf> = std::fs::read_dir(source)
                    .map_err(|e| {
                        Error::Io(format!("failed to read {}: {e}", source.display()))
                    })?
                    .filter_map(|e| e.ok().map(|e| e.path()))
                    .filter(|p| p.extension().is_some_and(|ext| ext == "toml"))
                    .collect();
                entries.sort();
                for entry in entries {
                    merge_file(&mut merged, &entry)?;
                }
            } else if source.is_file() {
                merge_file(&mut merged, source)?;
            } else {
                debug!("Config source {} not present, skipping", source.display());
            }
        }

        merged
            .try_into()
            .map_err(|e| Error::InvalidArgument(format!("invalid configuration: {e}")))
    }
}

fn merge_file(base: &mut toml::Value, path: &Path) -> Result<()> {
    debug!("Merging config fragment {}", path.display());
    let text = std::fs::read_to_string(path)
        .map_err(|e| Error::Io(format!("failed to read {}: {e}", path.display())))?;
    let overlay: toml::Value = text
        .parse()
        .map_err(|e| Error::InvalidArgument(format!("bad TOML in {}: {e}", path.display())))?;
    merge_value(base, overlay);
    Ok(())
}

fn merge_value(base: &mut toml::Value, overlay: toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base_table), toml::Value::Table(overlay_table)) => {
            for (key, value) in overlay_table {
                match base_table.get_mut(&key) {
                    Some(existing) => merge_value(existing, value),
                    None => {
                        base_table.insert(key, value);
                    }
                }
            }
        }
        (base_slot, overlay_value) => *base_slot = overlay_value,
    }
}
