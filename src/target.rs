// src/target.rs

//! Update targets
//!
//! A target is a signed, versioned update candidate: an OSTree commit
//! hash plus custom metadata (integer version, hardware ids, tags, the
//! app set, an optional delta-stats reference). Targets are immutable
//! value types; equality is by content hash. All metadata access is a
//! typed, fallible extraction; the custom blob comes off the wire and is
//! never trusted to have the right shape.

use serde_json::Value;
use std::fmt;
use tracing::error;

/// Name used for a deployment the agent has no metadata for
pub const UNKNOWN_NAME: &str = "unknown";

/// A containerized application referenced by a target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetApp {
    pub name: String,
    /// Registry URI, `<host>/<factory>/<app>@sha256:<hash>`
    pub uri: String,
}

/// A signed update candidate
#[derive(Debug, Clone)]
pub struct Target {
    name: String,
    sha256: String,
    version: i64,
    custom: Value,
}

impl Target {
    /// Build a target from TUF metadata fields
    ///
    /// The version is parsed from `custom.version`; an unparseable value
    /// becomes −1 and the target remains usable (it simply sorts first).
    pub fn new(name: impl Into<String>, sha256: impl Into<String>, custom: Value) -> Self {
        let name = name.into();
        let version = match custom.get("version").and_then(Value::as_str) {
            Some(v) => v.trim().parse::<i64>().unwrap_or_else(|_| {
                error!("Invalid version number format: {}", v);
                -1
            }),
            None => -1,
        };
        Self {
            name,
            sha256: sha256.into().to_lowercase(),
            version,
            custom,
        }
    }

    /// Sentinel for "no target known"
    pub fn unknown() -> Self {
        Self {
            name: UNKNOWN_NAME.to_string(),
            sha256: String::new(),
            version: -1,
            custom: Value::Null,
        }
    }

    /// A deployment found on disk with no matching metadata
    pub fn unknown_with_hash(sha256: impl Into<String>) -> Self {
        Self {
            name: UNKNOWN_NAME.to_string(),
            sha256: sha256.into().to_lowercase(),
            version: -1,
            custom: Value::Null,
        }
    }

    /// Synthesize the initial target for a freshly provisioned device
    ///
    /// The factory image was deployed out of band, so the current
    /// deployment hash becomes a version-0 target for the device's
    /// hardware class.
    pub fn initial(sha256: impl Into<String>, hwid: &str) -> Self {
        let sha256 = sha256.into().to_lowercase();
        let custom = serde_json::json!({
            "version": "0",
            "hardwareIds": [hwid],
            "targetFormat": "OSTREE",
        });
        Self {
            name: sha256.clone(),
            sha256,
            version: 0,
            custom,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sha256(&self) -> &str {
        &self.sha256
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn custom(&self) -> &Value {
        &self.custom
    }

    pub fn is_unknown(&self) -> bool {
        self.name == UNKNOWN_NAME || self.name.is_empty()
    }

    /// Hardware ids this target applies to, in metadata order
    pub fn hardware_ids(&self) -> Vec<String> {
        collect_strings(self.custom.get("hardwareIds"))
    }

    /// Tags attached to this target
    pub fn tags(&self) -> Vec<String> {
        collect_strings(self.custom.get("tags"))
    }

    /// Does this target carry at least one of the wanted tags?
    ///
    /// An empty wanted list accepts every target.
    pub fn has_any_tag(&self, wanted: &[String]) -> bool {
        if wanted.is_empty() {
            return true;
        }
        let own = self.tags();
        wanted.iter().any(|t| own.contains(t))
    }

    /// Containerized apps referenced by this target
    pub fn apps(&self) -> Vec<TargetApp> {
        let mut apps = Vec::new();
        if let Some(map) = self
            .custom
            .get("docker_compose_apps")
            .and_then(Value::as_object)
        {
            for (name, entry) in map {
                if let Some(uri) = entry.get("uri").and_then(Value::as_str) {
                    apps.push(TargetApp {
                        name: name.clone(),
                        uri: uri.to_string(),
                    });
                }
            }
        }
        apps
    }
}

impl PartialEq for Target {
    fn eq(&self, other: &Self) -> bool {
        self.sha256 == other.sha256
    }
}

impl Eq for Target {}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let short = if self.sha256.len() >= 7 { &self.sha256[..7] } else { &self.sha256 };
        write!(f, "{} (v{}, {})", self.name, self.version, short)
    }
}

fn collect_strings(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
