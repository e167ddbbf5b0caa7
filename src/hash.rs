// src/hash.rs

//! SHA-256 helpers for artifact verification
//!
//! Every artifact the agent fetches (registry manifests and blobs, the
//! delta-stats sidecar) is content-addressed by a 256-bit digest rendered
//! as 64 lowercase hex characters. The incremental [`Hasher`] lets the
//! blob downloader hash data as it is written to disk, avoiding a second
//! read pass over large layers.

use crate::error::{Error, Result};
use sha2::{Digest, Sha256};
use std::io::Read;

/// Length of a SHA-256 digest rendered as hex
pub const HEX_LEN: usize = 64;

/// Incremental SHA-256 hasher
pub struct Hasher {
    state: Sha256,
}

impl Hasher {
    pub fn new() -> Self {
        Self { state: Sha256::new() }
    }

    /// Feed more data into the hash
    pub fn update(&mut self, data: &[u8]) {
        self.state.update(data);
    }

    /// Finalize and return the lowercase hex digest
    pub fn finalize(self) -> String {
        format!("{:x}", self.state.finalize())
    }
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Compute the lowercase hex SHA-256 of a byte slice
pub fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// Check that a string looks like a SHA-256 hex digest (64 lowercase hex chars)
pub fn is_valid_hex_digest(s: &str) -> bool {
    s.len() == HEX_LEN && s.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
}

/// Verify bytes match an expected SHA-256 hex digest
///
/// The comparison is case-insensitive on the expected side; fetched data
/// is always hashed to lowercase hex.
pub fn verify_sha256(data: &[u8], expected: &str) -> Result<()> {
    let actual = sha256_hex(data);
    if actual == expected.to_lowercase() {
        Ok(())
    } else {
        Err(Error::Integrity {
            expected: expected.to_string(),
            actual,
        })
    }
}

/// Compute the SHA-256 of data from a reader, streaming in 8 KiB chunks
pub fn hash_reader<R: Read>(reader: &mut R) -> std::io::Result<String> {
    let mut hasher = Hasher::new();
    let mut buffer = [0u8; 8192];

    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_known_value() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_incremental_matches_one_shot() {
        let mut hasher = Hasher::new();
        hasher.update(b"hello ");
        hasher.update(b"world");
        assert_eq!(hasher.finalize(), sha256_hex(b"hello world"));
    }

    #[test]
    fn test_verify_case_insensitive_expected() {
        let digest = sha256_hex(b"data").to_uppercase();
        assert!(verify_sha256(b"data", &digest).is_ok());
    }

    #[test]
    fn test_verify_mismatch_reports_both_digests() {
        let wrong = "0".repeat(64);
        let err = verify_sha256(b"data", &wrong).unwrap_err();
        match err {
            Error::Integrity { expected, actual } => {
                assert_eq!(expected, wrong);
                assert_eq!(actual, sha256_hex(b"data"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_hash_reader() {
        let data = vec![7u8; 100_000];
        let mut cursor = std::io::Cursor::new(&data);
        assert_eq!(hash_reader(&mut cursor).unwrap(), sha256_hex(&data));
    }

    #[test]
    fn test_hex_digest_validation() {
        assert!(is_valid_hex_digest(&"a".repeat(64)));
        assert!(!is_valid_hex_digest(&"a".repeat(63)));
        assert!(!is_valid_hex_digest(&"A".repeat(64)));
        assert!(!is_valid_hex_digest(&"g".repeat(64)));
    }
}
