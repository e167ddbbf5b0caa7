// src/remote.rs

//! Fetch-origin selection for rootfs pulls
//!
//! A pull can be served by the device gateway itself or by presigned
//! object-store URLs the gateway hands out on request. The selector
//! always produces the configured primary origin and, when the gateway
//! cooperates, prepends the presigned origins in the order the gateway
//! returned them. The list order is the fallback precedence: highest
//! first, the primary last.

use crate::http::{Headers, HttpClient};
use serde_json::Value;
use std::path::PathBuf;
use tracing::{debug, warn};

/// Name the tree tool knows the primary origin by
pub const PRIMARY_REMOTE_NAME: &str = "otad-remote";

/// Name given to gateway-issued presigned origins
pub const GCS_REMOTE_NAME: &str = "gcs";

/// TLS client credentials for mutually-authenticated origins
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsMaterial {
    pub ca_file: Option<PathBuf>,
    pub cert_file: Option<PathBuf>,
    pub pkey_file: Option<PathBuf>,
}

/// A fetch origin
#[derive(Debug, Clone)]
pub struct Remote {
    pub name: String,
    pub base_url: String,
    pub headers: Headers,
    pub keys: Option<TlsMaterial>,
    /// Has the tree tool already been configured with this remote?
    pub is_remote_set: bool,
}

impl Remote {
    fn correlation_headers(target_name: &str) -> Headers {
        vec![("X-Correlation-ID".to_string(), target_name.to_string())]
    }
}

/// Produce the ordered origin list for pulling `target_name`
///
/// The gateway is only consulted when the base server is an http(s) URL;
/// a `file://` ostree server gets no additional origins. A gateway
/// failure is logged and ignored.
pub fn get_remotes(
    base_server: &str,
    target_name: &str,
    keys: Option<TlsMaterial>,
    http: &dyn HttpClient,
) -> Vec<Remote> {
    let primary = Remote {
        name: PRIMARY_REMOTE_NAME.to_string(),
        base_url: base_server.to_string(),
        headers: Remote::correlation_headers(target_name),
        keys,
        is_remote_set: false,
    };

    let mut remotes = Vec::new();
    if !base_server.is_empty() && base_server.starts_with("http") {
        remotes = additional_remotes(base_server, target_name, http);
    }
    remotes.push(primary);
    remotes
}

fn additional_remotes(gateway_url: &str, target_name: &str, http: &dyn HttpClient) -> Vec<Remote> {
    let url = format!("{}/download-urls", gateway_url.trim_end_matches('/'));
    let resp = match http.post_json(&url, &vec![], None) {
        Ok(resp) if resp.is_ok() => resp,
        Ok(resp) => {
            warn!(
                "Failed to obtain download URLs from gateway, falling back to download via the gateway: {}",
                resp.status_line()
            );
            return Vec::new();
        }
        Err(e) => {
            warn!(
                "Failed to obtain download URLs from gateway, falling back to download via the gateway: {e}"
            );
            return Vec::new();
        }
    };

    let json = match resp.json() {
        Ok(json) => json,
        Err(e) => {
            warn!("Gateway returned malformed download URLs, ignoring: {e}");
            return Vec::new();
        }
    };

    let mut remotes = Vec::new();
    if let Some(entries) = json.as_array() {
        for entry in entries {
            let download_url = entry.get("download_url").and_then(Value::as_str);
            let access_token = entry.get("access_token").and_then(Value::as_str);
            let (Some(download_url), Some(access_token)) = (download_url, access_token) else {
                warn!("Skipping malformed download-urls entry: {entry}");
                continue;
            };

            let mut headers = Remote::correlation_headers(target_name);
            headers.push((
                "Authorization".to_string(),
                format!("Bearer {access_token}"),
            ));
            remotes.push(Remote {
                name: GCS_REMOTE_NAME.to_string(),
                base_url: download_url.to_string(),
                headers,
                keys: None,
                is_remote_set: false,
            });
        }
    }

    debug!("Gateway offered {} additional fetch origins", remotes.len());
    remotes
}
