// src/error.rs

//! Crate-wide error type
//!
//! Every failure the update engine reports up to the controller is one of
//! these kinds; the CLI maps them onto stable exit codes. Conditions that
//! are recovered locally (gateway fallback, unreadable bootloader version,
//! unparseable target versions) are logged warnings and never surface here.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Bad URI, digest, or version string
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Filesystem stat / open / write failure
    #[error("I/O error: {0}")]
    Io(String),

    /// Size or hash mismatch on fetched bytes
    #[error("integrity error: expected {expected}, got {actual}")]
    Integrity { expected: String, actual: String },

    /// Admission or pull-time disk-full
    #[error("insufficient storage available; {0}")]
    NoSpace(String),

    /// Transport failure or 4xx/5xx response
    #[error("download failed: {0}")]
    Download(String),

    /// TUF metadata disagrees with the downloaded artifact
    #[error("verification failed: {0}")]
    Verification(String),

    /// Bootloader update in progress or bootloader rollback attempted
    #[error("blocked by bootloader: {0}")]
    BootloaderBlocked(String),

    /// Tree tool failed to stage the deployment
    #[error("install failed: {0}")]
    InstallFailed(String),

    /// Reboot required to observe the new deployment
    #[error("completion required: {0}")]
    NeedCompletion(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("{0}")]
    Unknown(String),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::InvalidArgument(format!("malformed JSON: {e}"))
    }
}
