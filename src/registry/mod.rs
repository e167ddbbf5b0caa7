// src/registry/mod.rs

//! Container registry access
//!
//! Targets reference their applications by pinned registry URIs of the
//! form `<host>/<factory>/<app>@sha256:<64 hex>`. This module parses
//! those URIs and fetches the content they address (manifests and blobs)
//! with integrity verification; see [`client::RegistryClient`].

mod client;

pub use client::{RegistryClient, MANIFEST_MAX_SIZE};

use crate::error::{Error, Result};
use crate::hash;
use std::fmt;

/// A `sha256:`-prefixed content digest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashedDigest {
    digest: String,
    hash: String,
    short_hash: String,
}

impl HashedDigest {
    pub const TYPE_PREFIX: &'static str = "sha256:";

    /// Parse and validate a digest string
    ///
    /// The input is lowercased; the hash part must be exactly 64 hex
    /// characters.
    pub fn parse(digest: &str) -> Result<Self> {
        let digest = digest.to_lowercase();
        let hash = digest
            .strip_prefix(Self::TYPE_PREFIX)
            .ok_or_else(|| Error::InvalidArgument(format!("unsupported hash type: {digest}")))?
            .to_string();

        if !hash::is_valid_hex_digest(&hash) {
            return Err(Error::InvalidArgument(format!(
                "invalid hash size or characters: {digest}"
            )));
        }

        let short_hash = hash[..7].to_string();
        Ok(Self { digest, hash, short_hash })
    }

    /// The full `sha256:<hash>` form
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// The bare 64-hex hash
    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// First seven hex characters, for log lines
    pub fn short_hash(&self) -> &str {
        &self.short_hash
    }
}

impl fmt::Display for HashedDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.digest)
    }
}

/// Parsed form of a pinned app registry URI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uri {
    pub digest: HashedDigest,
    pub app: String,
    pub factory: String,
    /// `<factory>/<app>`
    pub repo: String,
    pub registry_hostname: String,
}

impl Uri {
    /// Parse `<host>/<factory>/<app>@sha256:<hash>`
    ///
    /// Tokenizes on the final `@`, then walks `/` separators
    /// right-to-left to isolate the app, the factory, and the host (the
    /// host is everything before the factory).
    pub fn parse(uri: &str) -> Result<Self> {
        let at_pos = uri
            .rfind('@')
            .ok_or_else(|| Error::InvalidArgument(format!("'@' not found in app URI: {uri}")))?;

        let digest = HashedDigest::parse(&uri[at_pos + 1..])?;

        let app_sep = uri[..at_pos]
            .rfind('/')
            .ok_or_else(|| Error::InvalidArgument(format!("app name not found in URI: {uri}")))?;
        let app = uri[app_sep + 1..at_pos].to_string();

        let factory_sep = uri[..app_sep].rfind('/').ok_or_else(|| {
            Error::InvalidArgument(format!("factory name not found in URI: {uri}"))
        })?;
        let factory = uri[factory_sep + 1..app_sep].to_string();

        let registry_hostname = uri[..factory_sep].to_string();
        if registry_hostname.is_empty() || app.is_empty() || factory.is_empty() {
            return Err(Error::InvalidArgument(format!("empty URI component in: {uri}")));
        }

        let repo = format!("{factory}/{app}");
        Ok(Self { digest, app, factory, repo, registry_hostname })
    }

    /// The same repository addressed by a different digest
    ///
    /// Used to fetch the blobs a manifest references.
    pub fn with_digest(&self, digest: HashedDigest) -> Self {
        Self {
            digest,
            app: self.app.clone(),
            factory: self.factory.clone(),
            repo: self.repo.clone(),
            registry_hostname: self.registry_hostname.clone(),
        }
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.registry_hostname, self.repo, self.digest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_uri() {
        let hash = "a".repeat(64);
        let uri = Uri::parse(&format!("hub.foundries.io/myfactory/nginx@sha256:{hash}")).unwrap();
        assert_eq!(uri.registry_hostname, "hub.foundries.io");
        assert_eq!(uri.factory, "myfactory");
        assert_eq!(uri.app, "nginx");
        assert_eq!(uri.repo, "myfactory/nginx");
        assert_eq!(uri.digest.hash(), hash);
    }

    #[test]
    fn test_parse_roundtrip() {
        let input = format!("hub.foundries.io/myfactory/nginx@sha256:{}", "b".repeat(64));
        let uri = Uri::parse(&input).unwrap();
        assert_eq!(uri.to_string(), input);
    }

    #[test]
    fn test_rejects_uri_without_path() {
        assert!(Uri::parse("nginx@sha256:aaaa").is_err());
    }

    #[test]
    fn test_rejects_unsupported_digest_type() {
        assert!(Uri::parse("x/y@xyz:abc").is_err());
        assert!(Uri::parse(&format!("host/factory/app@md5:{}", "a".repeat(64))).is_err());
    }

    #[test]
    fn test_rejects_wrong_hash_length() {
        assert!(Uri::parse(&format!("host/factory/app@sha256:{}", "a".repeat(63))).is_err());
        assert!(Uri::parse(&format!("host/factory/app@sha256:{}", "a".repeat(65))).is_err());
    }

    #[test]
    fn test_digest_is_lowercased() {
        let uri = Uri::parse(&format!("host/factory/app@sha256:{}", "A".repeat(64))).unwrap();
        assert_eq!(uri.digest.hash(), "a".repeat(64));
        assert_eq!(uri.digest.short_hash(), "aaaaaaa");
    }

    #[test]
    fn test_rejects_missing_host() {
        assert!(Uri::parse(&format!("/factory/app@sha256:{}", "a".repeat(64))).is_err());
        assert!(Uri::parse(&format!("factory/app@sha256:{}", "a".repeat(64))).is_err());
    }

    #[test]
    fn test_with_digest_keeps_repo() {
        let uri = Uri::parse(&format!("host/factory/app@sha256:{}", "a".repeat(64))).unwrap();
        let other = uri.with_digest(HashedDigest::parse(&format!("sha256:{}", "b".repeat(64))).unwrap());
        assert_eq!(other.repo, "factory/app");
        assert_eq!(other.digest.hash(), "b".repeat(64));
    }
}
