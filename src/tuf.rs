// src/tuf.rs

//! Signed-metadata source boundary
//!
//! Signature verification lives in an external TUF library; the engine
//! only consumes its output through [`TufSource`]: refresh the accepted
//! targets set, enumerate it, and re-verify a downloaded artifact against
//! it. [`JsonTufSource`] reads the verified `targets.json` copy that the
//! TUF collaborator maintains on disk, which also serves local/offline
//! check-ins pointed at a local repo directory.

use crate::error::{Error, Result};
use crate::target::Target;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{debug, warn};

/// Source of TUF-accepted update targets
pub trait TufSource: Send + Sync {
    /// Refresh the accepted targets set; an error means the caller may
    /// fall back to the local copy
    fn update(&self) -> Result<()>;

    /// Is a usable local copy of the metadata present?
    fn check_offline(&self) -> bool;

    /// All currently accepted targets
    fn targets(&self) -> Result<Vec<Target>>;

    /// Re-verify a downloaded target against the accepted set
    fn verify_target(&self, target: &Target) -> Result<()>;
}

/// Targets read from a verified `targets.json` maintained out of band
pub struct JsonTufSource {
    path: PathBuf,
    cache: Mutex<Option<Value>>,
}

impl JsonTufSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cache: Mutex::new(None),
        }
    }

    fn load(&self) -> Result<Value> {
        let text = std::fs::read_to_string(&self.path).map_err(|e| {
            Error::Download(format!(
                "failed to read targets metadata {}: {e}",
                self.path.display()
            ))
        })?;
        let json: Value = serde_json::from_str(&text).map_err(|e| {
            Error::Download(format!(
                "malformed targets metadata {}: {e}",
                self.path.display()
            ))
        })?;
        Ok(json)
    }

    fn targets_map(json: &Value) -> Option<&serde_json::Map<String, Value>> {
        // accept both the signed envelope and a bare targets role
        json.get("signed")
            .unwrap_or(json)
            .get("targets")
            .and_then(Value::as_object)
    }
}

impl TufSource for JsonTufSource {
    fn update(&self) -> Result<()> {
        let fresh = self.load()?;
        if Self::targets_map(&fresh).is_none() {
            return Err(Error::Download(format!(
                "no targets role in {}",
                self.path.display()
            )));
        }
        debug!("Refreshed targets metadata from {}", self.path.display());
        *self.cache.lock().unwrap() = Some(fresh);
        Ok(())
    }

    fn check_offline(&self) -> bool {
        if self.cache.lock().unwrap().is_some() {
            return true;
        }
        self.load()
            .ok()
            .filter(|json| Self::targets_map(json).is_some())
            .map(|json| {
                *self.cache.lock().unwrap() = Some(json);
            })
            .is_some()
    }

    fn targets(&self) -> Result<Vec<Target>> {
        let mut cache = self.cache.lock().unwrap();
        let json = match cache.take() {
            Some(json) => json,
            None => self.load()?,
        };

        let map = Self::targets_map(&json).ok_or_else(|| {
            Error::Download(format!("no targets role in {}", self.path.display()))
        })?;

        let mut targets = Vec::new();
        for (name, entry) in map {
            let Some(sha256) = entry
                .get("hashes")
                .and_then(|h| h.get("sha256"))
                .and_then(Value::as_str)
            else {
                warn!("Skipping target {name}: no sha256 hash in metadata");
                continue;
            };
            let custom = entry.get("custom").cloned().unwrap_or(Value::Null);
            targets.push(Target::new(name.clone(), sha256, custom));
        }

        *cache = Some(json);
        Ok(targets)
    }

    fn verify_target(&self, target: &Target) -> Result<()> {
        for known in self.targets()? {
            if known.name() == target.name() {
                if known.sha256() == target.sha256() {
                    return Ok(());
                }
                return Err(Error::Verification(format!(
                    "hash of target {} does not match the accepted metadata: {} != {}",
                    target.name(),
                    target.sha256(),
                    known.sha256()
                )));
            }
        }
        Err(Error::Verification(format!(
            "target {} is not in the accepted metadata",
            target.name()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn hash(c: char) -> String {
        c.to_string().repeat(64)
    }

    fn write_targets(dir: &std::path::Path, body: &Value) -> PathBuf {
        let path = dir.join("targets.json");
        std::fs::write(&path, serde_json::to_vec(body).unwrap()).unwrap();
        path
    }

    fn sample_metadata() -> Value {
        json!({
            "signed": {
                "targets": {
                    "device-lmp-41": {
                        "hashes": {"sha256": hash('a')},
                        "length": 0,
                        "custom": {"version": "41", "hardwareIds": ["raspberrypi4-64"]},
                    },
                    "device-lmp-42": {
                        "hashes": {"sha256": hash('b')},
                        "length": 0,
                        "custom": {"version": "42", "hardwareIds": ["raspberrypi4-64"]},
                    },
                }
            }
        })
    }

    #[test]
    fn test_targets_parsed_from_signed_envelope() {
        let dir = tempfile::tempdir().unwrap();
        let source = JsonTufSource::new(write_targets(dir.path(), &sample_metadata()));

        source.update().unwrap();
        let targets = source.targets().unwrap();
        assert_eq!(targets.len(), 2);
        assert!(targets.iter().any(|t| t.name() == "device-lmp-42" && t.version() == 42));
    }

    #[test]
    fn test_bare_targets_role_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let body = json!({"targets": {"t": {"hashes": {"sha256": hash('a')}, "custom": {"version": "1"}}}});
        let source = JsonTufSource::new(write_targets(dir.path(), &body));

        assert!(source.check_offline());
        assert_eq!(source.targets().unwrap().len(), 1);
    }

    #[test]
    fn test_update_fails_when_file_missing() {
        let dir = tempfile::tempdir().unwrap();
        let source = JsonTufSource::new(dir.path().join("targets.json"));
        assert!(source.update().is_err());
        assert!(!source.check_offline());
    }

    #[test]
    fn test_update_failure_keeps_cached_copy() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_targets(dir.path(), &sample_metadata());
        let source = JsonTufSource::new(path.clone());
        source.update().unwrap();

        std::fs::remove_file(&path).unwrap();
        assert!(source.update().is_err());
        // the cached copy still answers
        assert!(source.check_offline());
        assert_eq!(source.targets().unwrap().len(), 2);
    }

    #[test]
    fn test_target_without_hash_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let body = json!({"targets": {
            "good": {"hashes": {"sha256": hash('a')}, "custom": {"version": "1"}},
            "bad": {"length": 0},
        }});
        let source = JsonTufSource::new(write_targets(dir.path(), &body));
        let targets = source.targets().unwrap();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].name(), "good");
    }

    #[test]
    fn test_verify_target() {
        let dir = tempfile::tempdir().unwrap();
        let source = JsonTufSource::new(write_targets(dir.path(), &sample_metadata()));

        let good = Target::new("device-lmp-41", hash('a'), json!({"version": "41"}));
        assert!(source.verify_target(&good).is_ok());

        let tampered = Target::new("device-lmp-41", hash('c'), json!({"version": "41"}));
        assert!(matches!(
            source.verify_target(&tampered),
            Err(Error::Verification(_))
        ));

        let foreign = Target::new("not-in-metadata", hash('a'), json!({}));
        assert!(matches!(
            source.verify_target(&foreign),
            Err(Error::Verification(_))
        ));
    }
}
