// src/delta.rs

//! Static-delta statistics resolver
//!
//! A target may reference a small JSON sidecar describing the binary
//! deltas that lead to its commit. The sidecar tells the agent how much
//! disk a delta needs before anything is pulled, which feeds the
//! admission check. Everything about the sidecar is untrusted: its
//! reference must be well-typed, its size is capped at 1 MiB, and the
//! fetched bytes must match the referenced digest exactly.
//!
//! Sidecar shape: `{ <toHash>: { <fromHash>: { size, u_size }, ... }, ... }`.

use crate::error::Result;
use crate::hash;
use crate::http::HttpClient;
use crate::remote::Remote;
use serde_json::Value;
use tracing::{error, info};

/// Hard cap on the delta-stats sidecar size (1 MiB)
pub const DELTA_STATS_MAX_SIZE: u64 = 1024 * 1024;

/// Reference to a delta-stats sidecar found in target metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaStatsRef {
    pub sha256: String,
    pub size: u64,
}

/// Byte sizes of one (from → to) delta
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeltaStat {
    /// Compressed (transfer) size
    pub size: u64,
    /// Uncompressed (on-disk) size
    pub u_size: u64,
}

/// Extract the delta-stats reference from target custom metadata
///
/// Returns `None` when the target carries no reference or when the
/// reference is malformed (missing or mistyped fields are logged).
pub fn find_ref(custom: &Value) -> Option<DeltaStatsRef> {
    let stats_ref = custom.get("delta-stats")?;

    let Some(sha256) = stats_ref.get("sha256").and_then(Value::as_str) else {
        error!(
            "Incorrect delta-stats metadata in target: missing `sha256` field or it's not a string"
        );
        return None;
    };
    let Some(size) = stats_ref.get("size").and_then(Value::as_u64) else {
        error!(
            "Incorrect delta-stats metadata in target: missing `size` field or it's not an integer"
        );
        return None;
    };

    Some(DeltaStatsRef {
        sha256: sha256.to_lowercase(),
        size,
    })
}

/// Download and verify the delta-stats sidecar from one origin
///
/// Enforces the 1 MiB cap before any HTTP is issued; the fetched byte
/// count must equal `ref.size` and its SHA-256 must equal `ref.sha256`.
/// Every failure path returns `None`: delta stats are advisory, the
/// update proceeds without the size check.
pub fn download(
    stats_ref: &DeltaStatsRef,
    remote: &Remote,
    http: &dyn HttpClient,
) -> Option<Value> {
    if stats_ref.size > DELTA_STATS_MAX_SIZE {
        error!(
            "Requested delta-stats file is larger than the maximum allowed; requested size: {}, maximum allowed: {}",
            stats_ref.size, DELTA_STATS_MAX_SIZE
        );
        return None;
    }

    let url = format!(
        "{}/delta-stats/{}",
        remote.base_url.trim_end_matches('/'),
        stats_ref.sha256
    );
    info!("Fetching delta stats -> {}", url);

    let resp = match http.get(&url, &remote.headers, stats_ref.size) {
        Ok(resp) if resp.is_ok() => resp,
        Ok(resp) => {
            error!("Failed to fetch delta stats; status: {}", resp.status_line());
            return None;
        }
        Err(e) => {
            error!("Failed to fetch delta stats: {e}");
            return None;
        }
    };

    if resp.body.len() as u64 != stats_ref.size {
        error!(
            "Fetched invalid delta stats, size mismatch; expected: {}, got: {}",
            stats_ref.size,
            resp.body.len()
        );
        return None;
    }

    let received_hash = hash::sha256_hex(&resp.body);
    if received_hash != stats_ref.sha256 {
        error!(
            "Fetched invalid delta stats, hash mismatch; expected: {}, got: {}",
            stats_ref.sha256, received_hash
        );
        return None;
    }

    match resp.json() {
        Ok(json) => Some(json),
        Err(e) => {
            error!("Fetched delta stats are not valid JSON: {e}");
            None
        }
    }
}

/// Look up the stat for updating `from` → `to`
///
/// Both `size` and `u_size` must be unsigned 64-bit integers; missing or
/// mistyped entries yield `None`. Object-key order carries no meaning.
pub fn find_stat(delta_stats: &Value, from: &str, to: &str) -> Option<DeltaStat> {
    let Some(to_entry) = delta_stats.get(to) else {
        error!("Invalid delta stats received; no `to` hash found: {to}");
        return None;
    };

    let found = to_entry.as_object()?.iter().find_map(|(key, value)| {
        if key == from {
            Some(value)
        } else {
            None
        }
    })?;

    let Some(size) = found.get("size").and_then(Value::as_u64) else {
        error!("Invalid delta stat found; `size` field is missing or is not `uint64`: {found}");
        return None;
    };
    let Some(u_size) = found.get("u_size").and_then(Value::as_u64) else {
        error!("Invalid delta stat found; `u_size` field is missing or is not `uint64`: {found}");
        return None;
    };

    Some(DeltaStat { size, u_size })
}

/// Convenience wrapper: resolve the stat for a target from one origin
///
/// Returns `None` when the target carries no reference, the sidecar
/// cannot be fetched or verified, or it lacks a (from, to) entry.
pub fn stat_if_available(
    custom: &Value,
    from_hash: &str,
    to_hash: &str,
    remote: &Remote,
    http: &dyn HttpClient,
) -> Option<DeltaStat> {
    let Some(stats_ref) = find_ref(custom) else {
        info!("No reference to static delta stats found in target");
        return None;
    };

    info!("Found reference to a file with static delta stats, downloading it...");
    let json = download(&stats_ref, remote, http)?;

    info!("File with static delta stats has been downloaded, parsing it...");
    let stat = find_stat(&json, from_hash, to_hash);
    if stat.is_none() {
        error!("No delta stat found between {from_hash} and {to_hash}");
    }
    stat
}
