// src/flow.rs

//! Flow-control token for long-running downloads
//!
//! The token is checked at safe boundaries only: between remotes during a
//! rootfs pull and between blobs during an app pull. A cancelled pull
//! surfaces as a download failure with description "cancelled"; partial
//! objects are cleaned up by the tree tool's own recovery on the next pull.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative cancellation token shared between a driver and the engine
#[derive(Clone, Default)]
pub struct FlowControlToken {
    aborted: Arc<AtomicBool>,
}

impl FlowControlToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation of the in-flight operation
    pub fn set_abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }

    /// True once cancellation has been requested
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }
}
