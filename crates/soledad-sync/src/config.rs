//! Tunables shared by [`crate::BlobManager`] and [`crate::Synchronizer`].

/// Concurrency limits and retry budget for a sync session.
#[derive(Debug, Clone, Copy)]
pub struct SyncConfig {
    /// Max concurrent local encrypt+upload / download+decrypt operations.
    pub concurrent_writes_limit: usize,
    /// Max concurrent blob transfers during a `send_missing`/`fetch_missing` pass.
    pub concurrent_transfers_limit: usize,
    /// Retries allowed before a download is marked `FAILED_DOWNLOAD` or an
    /// upload is marked `FAILED_UPLOAD`.
    pub max_decrypt_retries: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self { concurrent_writes_limit: 100, concurrent_transfers_limit: 3, max_decrypt_retries: 3 }
    }
}
