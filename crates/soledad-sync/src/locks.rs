//! The synchronizer's two named locks.
//!
//! `send_missing` and `fetch_missing` each run exclusively with respect to
//! themselves (so two concurrent `sync()` calls don't both drain the same
//! upload/download backlog), but independently of each other.

use tokio::sync::Mutex;

/// Holds the synchronizer's two phase-exclusion locks.
#[derive(Default)]
pub struct SyncLocks {
    /// Serializes `send_missing` passes.
    pub send_missing: Mutex<()>,
    /// Serializes `fetch_missing` passes.
    pub fetch_missing: Mutex<()>,
}
