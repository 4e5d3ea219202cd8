//! Drives local and remote blob state to agreement (spec §4.5).
//!
//! `sync()` runs four phases strictly in order — apply deletions the server
//! already knows about, refresh status from the server's listing, pull
//! everything pending download, then push everything pending upload — so
//! each phase observes every effect of the one before it. Each phase
//! re-reads the local store's status index at the start of its own loop
//! iteration rather than working off a snapshot, so a blob that arrives
//! mid-pass is still picked up before the pass ends.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::Semaphore;

use soledad_core::{BlobId, SoledadError, SyncStatus};
use soledad_local_store::SyncProgress;
use telemetry::SyncMetrics;

use crate::blob_manager::BlobManager;
use crate::config::SyncConfig;
use crate::locks::SyncLocks;

/// Coordinates a [`BlobManager`] through the sync state machine.
pub struct Synchronizer {
    manager: Arc<BlobManager>,
    locks: SyncLocks,
    transfer_semaphore: Arc<Semaphore>,
    metrics: SyncMetrics,
}

impl Synchronizer {
    /// Build a synchronizer over `manager`.
    pub fn new(manager: Arc<BlobManager>, config: &SyncConfig) -> Self {
        Self {
            manager,
            locks: SyncLocks::default(),
            transfer_semaphore: Arc::new(Semaphore::new(config.concurrent_transfers_limit)),
            metrics: SyncMetrics::new(),
        }
    }

    /// Upload/download/retry counters accumulated across this
    /// synchronizer's lifetime.
    pub fn metrics(&self) -> &SyncMetrics {
        &self.metrics
    }

    /// Mark newly-remote blobs `PENDING_DOWNLOAD` and newly-local blobs
    /// `PENDING_UPLOAD`. `LOCAL_ONLY` blobs are a terminal opt-out and are
    /// never marked `PENDING_UPLOAD` here.
    #[tracing::instrument(skip(self))]
    pub async fn refresh_sync_status_from_server(&self) -> Result<(), SoledadError> {
        let remote: HashSet<BlobId> = self.manager.remote_list(None, false, None).await?.into_iter().collect();
        let local: HashSet<BlobId> = self.manager.local_list()?.into_iter().collect();

        let pending_download: Vec<BlobId> = remote.difference(&local).cloned().collect();
        if !pending_download.is_empty() {
            tracing::info!(count = pending_download.len(), "found blobs on server not yet tracked locally");
            self.manager.mark_batch_status(&pending_download, SyncStatus::PendingDownload)?;
        }

        let local_only: HashSet<BlobId> = self.manager.local_list_status(SyncStatus::LocalOnly)?.into_iter().collect();
        let pending_upload: Vec<BlobId> = local
            .difference(&remote)
            .filter(|id| !local_only.contains(*id))
            .cloned()
            .collect();
        if !pending_upload.is_empty() {
            tracing::info!(count = pending_upload.len(), "found local blobs the server doesn't have yet");
            self.manager.mark_batch_status(&pending_upload, SyncStatus::PendingUpload)?;
        }
        Ok(())
    }

    /// Remove blobs locally that the server has tombstoned.
    #[tracing::instrument(skip(self))]
    pub async fn apply_deletions_from_server(&self) -> Result<(), SoledadError> {
        let tombstoned = self.manager.remote_list(None, true, None).await?;
        if tombstoned.is_empty() {
            return Ok(());
        }
        tracing::info!(count = tombstoned.len(), "applying server-side deletions locally");
        self.manager.local_batch_delete(&tombstoned)?;
        Ok(())
    }

    /// Upload every `PENDING_UPLOAD`/`FAILED_UPLOAD` blob, looping until a
    /// pass makes no further progress.
    #[tracing::instrument(skip(self))]
    pub async fn send_missing(&self) -> Result<(), SoledadError> {
        let _guard = self.locks.send_missing.lock().await;
        loop {
            let mut batch = self.manager.local_list_status(SyncStatus::PendingUpload)?;
            batch.extend(self.manager.local_list_status(SyncStatus::FailedUpload)?);
            if batch.is_empty() {
                return Ok(());
            }

            let mut tasks = Vec::with_capacity(batch.len());
            for blob_id in batch {
                let manager = Arc::clone(&self.manager);
                let semaphore = Arc::clone(&self.transfer_semaphore);
                let metrics = self.metrics.clone();
                tasks.push(tokio::spawn(async move {
                    let _permit = semaphore.acquire().await.expect("semaphore is never closed");
                    let result = soledad_retry::retry(&blob_id, || manager.send_one(&blob_id)).await;
                    match &result {
                        Ok(()) => metrics.record_upload(),
                        Err(e) => {
                            tracing::warn!(blob_id, error = %e, "upload failed, marking FAILED_UPLOAD");
                            manager.mark_status(&blob_id, SyncStatus::FailedUpload).ok();
                            metrics.record_failure();
                        }
                    }
                    result
                }));
            }

            let mut progressed = false;
            for task in tasks {
                match task.await {
                    Ok(Ok(())) => progressed = true,
                    Ok(Err(_)) => {}
                    Err(join_err) => tracing::error!(error = %join_err, "upload task panicked"),
                }
            }
            if !progressed {
                return Ok(());
            }
        }
    }

    /// Download every `PENDING_DOWNLOAD` blob, looping until a pass makes no
    /// further progress.
    #[tracing::instrument(skip(self))]
    pub async fn fetch_missing(&self) -> Result<(), SoledadError> {
        let _guard = self.locks.fetch_missing.lock().await;
        loop {
            let batch = self.manager.local_list_status(SyncStatus::PendingDownload)?;
            if batch.is_empty() {
                return Ok(());
            }

            let mut tasks = Vec::with_capacity(batch.len());
            for blob_id in batch {
                let manager = Arc::clone(&self.manager);
                let semaphore = Arc::clone(&self.transfer_semaphore);
                let metrics = self.metrics.clone();
                tasks.push(tokio::spawn(async move {
                    let _permit = semaphore.acquire().await.expect("semaphore is never closed");
                    let result = soledad_retry::retry(&blob_id, || manager.get(&blob_id)).await;
                    match &result {
                        Ok(_) => metrics.record_download(),
                        Err(e) => {
                            tracing::warn!(error = %e, "download failed");
                            metrics.record_failure();
                        }
                    }
                    result
                }));
            }

            let mut progressed = false;
            for task in tasks {
                match task.await {
                    Ok(Ok(_)) => progressed = true,
                    Ok(Err(_)) => {}
                    Err(join_err) => tracing::error!(error = %join_err, "download task panicked"),
                }
            }
            if !progressed {
                return Ok(());
            }
        }
    }

    /// Run all four phases in order: apply server-side deletions, refresh
    /// status from the server's listing, pull pending downloads, then push
    /// pending uploads.
    pub async fn sync(&self) -> Result<(), SoledadError> {
        self.apply_deletions_from_server().await?;
        self.refresh_sync_status_from_server().await?;
        self.fetch_missing().await?;
        self.send_missing().await?;
        Ok(())
    }

    /// Per-status counts for this synchronizer's namespace.
    pub fn sync_progress(&self) -> Result<SyncProgress, SoledadError> {
        self.manager.sync_progress()
    }
}
