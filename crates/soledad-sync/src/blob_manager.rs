//! Semaphore-bounded gateway between plaintext callers and the encrypted,
//! locally-stored, remotely-synced blob (spec §4.4).

use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::Semaphore;

use soledad_codec::MasterSecret;
use soledad_core::{BlobId, Flag, SoledadError, SyncStatus};
use soledad_http::HttpTransport;
use soledad_local_store::{LocalStore, SyncProgress};

use crate::config::SyncConfig;

#[derive(Deserialize)]
struct CountResponse {
    count: usize,
}

/// Encrypts/decrypts, talks to the local store and the remote server, and
/// bounds in-flight operations with a semaphore sized by
/// `concurrent_writes_limit`.
pub struct BlobManager {
    local: Arc<LocalStore>,
    http: Arc<HttpTransport>,
    secret: MasterSecret,
    namespace: String,
    semaphore: Arc<Semaphore>,
    max_decrypt_retries: u32,
}

impl BlobManager {
    /// Build a manager scoped to `namespace` (`""` for the default namespace).
    pub fn new(
        local: Arc<LocalStore>,
        http: Arc<HttpTransport>,
        secret: MasterSecret,
        namespace: impl Into<String>,
        config: &SyncConfig,
    ) -> Self {
        Self {
            local,
            http,
            secret,
            namespace: namespace.into(),
            semaphore: Arc::new(Semaphore::new(config.concurrent_writes_limit)),
            max_decrypt_retries: config.max_decrypt_retries,
        }
    }

    fn blob_path(&self, blob_id: &str) -> String {
        format!("blobs/{blob_id}")
    }

    fn list_query(&self, order_by: Option<&str>, deleted: bool, filter_flag: Option<&Flag>) -> Vec<(String, String)> {
        let mut query = soledad_http::optional_query_param("namespace", &self.namespace);
        if let Some(order_by) = order_by {
            query.push(("order_by".to_string(), order_by.to_string()));
        }
        if deleted {
            query.push(("deleted".to_string(), "true".to_string()));
        }
        if let Some(flag) = filter_flag {
            query.push(("filter_flag".to_string(), flag.as_str().to_string()));
        }
        query
    }

    /// Encrypt `plaintext`, persist the ciphertext locally, and (unless
    /// `local_only`) upload it.
    ///
    /// Fails with [`SoledadError::BlobAlreadyExists`] if a blob with this id
    /// already exists locally. When `local_only` is set, the blob is written
    /// locally and marked [`SyncStatus::LocalOnly`] — a terminal opt-out the
    /// synchronizer must never try to upload — without ever contacting the
    /// server. Otherwise the local write happens before the upload attempt,
    /// so a crash or a transient network failure never loses data: the blob
    /// stays `PENDING_UPLOAD` and a later `sync()` picks it up via
    /// [`crate::Synchronizer::send_missing`].
    #[tracing::instrument(skip(self, plaintext), fields(namespace = %self.namespace, blob_id, local_only))]
    pub async fn put(&self, blob_id: &str, plaintext: &[u8], local_only: bool) -> Result<(), SoledadError> {
        let _permit = self.semaphore.acquire().await.expect("semaphore is never closed");
        if self.local.exists(&self.namespace, blob_id)? {
            return Err(SoledadError::BlobAlreadyExists(blob_id.to_string()));
        }
        let wire = soledad_codec::encrypt(blob_id, soledad_core::FIXED_REV, &self.secret, plaintext)?;
        self.local.put(&self.namespace, blob_id, &wire)?;

        if local_only {
            self.local.update_sync_status(&self.namespace, blob_id, SyncStatus::LocalOnly)?;
            return Ok(());
        }

        let resp = self.http.put(&self.blob_path(blob_id), wire).await?;
        soledad_http::ensure_ok(&resp, &blob_id.to_string(), &[])?;
        self.local.update_sync_status(&self.namespace, blob_id, SyncStatus::Synced)?;
        Ok(())
    }

    /// Return a blob's plaintext.
    ///
    /// If the blob exists locally, it is decrypted and returned without ever
    /// contacting the server (Invariant: local-first get). Otherwise it is
    /// downloaded, decrypted, and cached locally.
    ///
    /// A tag or preamble failure, local or remote, is never returned raw: it
    /// is classified against the retry budget and re-raised as
    /// [`SoledadError::RetriableTransfer`] (try again later) or
    /// [`SoledadError::MaximumRetries`] (terminal; the blob is marked
    /// `FAILED_DOWNLOAD`).
    #[tracing::instrument(skip(self), fields(namespace = %self.namespace, blob_id))]
    pub async fn get(&self, blob_id: &str) -> Result<Vec<u8>, SoledadError> {
        let _permit = self.semaphore.acquire().await.expect("semaphore is never closed");
        let result = if self.local.exists(&self.namespace, blob_id)? {
            let wire = self.local.get(&self.namespace, blob_id)?;
            soledad_codec::decrypt(&self.secret, &wire).map(|(plaintext, _)| plaintext)
        } else {
            self.download_and_decrypt(blob_id).await
        };

        match result {
            Ok(plaintext) => Ok(plaintext),
            Err(SoledadError::InvalidBlob) => {
                let retries = self.local.increment_retries(&self.namespace, blob_id).unwrap_or(1);
                tracing::error!(
                    blob_id,
                    retries,
                    max_retries = self.max_decrypt_retries,
                    "blob failed integrity check on download, possibly tampered or corrupted"
                );
                if retries >= self.max_decrypt_retries {
                    self.local.update_sync_status(&self.namespace, blob_id, SyncStatus::FailedDownload)?;
                    Err(SoledadError::MaximumRetries {
                        blob_id: blob_id.to_string(),
                        retries,
                        source: Box::new(SoledadError::InvalidBlob),
                    })
                } else {
                    Err(SoledadError::RetriableTransfer(Box::new(SoledadError::InvalidBlob)))
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Downloads, decrypts and persists the ciphertext locally. Requires a
    /// `Tag` response header; a response missing it is treated the same as
    /// a failed integrity check (`InvalidBlob`), subject to the same retry
    /// budget as a bad GCM tag.
    async fn download_and_decrypt(&self, blob_id: &str) -> Result<Vec<u8>, SoledadError> {
        let resp = self.http.get(&self.blob_path(blob_id), &[]).await?;
        soledad_http::ensure_ok(&resp, &blob_id.to_string(), &[])?;
        if resp.tag().is_none() {
            return Err(SoledadError::InvalidBlob);
        }
        let wire = resp.bytes().await?.to_vec();
        let (plaintext, _) = soledad_codec::decrypt(&self.secret, &wire)?;
        self.local.overwrite(&self.namespace, blob_id, &wire)?;
        self.local.update_sync_status(&self.namespace, blob_id, SyncStatus::Synced)?;
        Ok(plaintext)
    }

    /// Fetch a byte range of a blob's raw ciphertext directly from the
    /// server, for partial/resumable transfers (spec §6 Range requests). A
    /// malformed or unsatisfiable range comes back as a `416` from the
    /// server; `check_http_status` doesn't carry range semantics, so that
    /// case is handled here rather than folded into the generic mapping.
    pub async fn fetch_range(&self, blob_id: &str, range_start: u64) -> Result<Vec<u8>, SoledadError> {
        let resp = self.http.get_range(&self.blob_path(blob_id), range_start).await?;
        if resp.status() == 416 {
            return Err(SoledadError::Server(format!(
                "unsatisfiable range starting at {range_start} for blob {blob_id}"
            )));
        }
        soledad_http::ensure_ok(&resp, &blob_id.to_string(), &[])?;
        Ok(resp.bytes().await?.to_vec())
    }

    /// Re-upload ciphertext already held locally (used by `send_missing`,
    /// which never has the plaintext on hand).
    pub(crate) async fn send_one(&self, blob_id: &str) -> Result<(), SoledadError> {
        let wire = self.local.get(&self.namespace, blob_id)?;
        let resp = self.http.put(&self.blob_path(blob_id), wire).await?;
        soledad_http::ensure_ok(&resp, &blob_id.to_string(), &[])?;
        self.local.update_sync_status(&self.namespace, blob_id, SyncStatus::Synced)?;
        Ok(())
    }

    /// Mark `PENDING_DELETE`, delete remotely, then locally. A 404 from the
    /// server propagates as [`SoledadError::BlobNotFound`] rather than
    /// silently succeeding. Marking `PENDING_DELETE` first means a crash
    /// between the successful remote delete and the local row removal
    /// leaves a resumable marker instead of a stale `SYNCED` row pointing at
    /// ciphertext the server no longer has.
    #[tracing::instrument(skip(self), fields(namespace = %self.namespace, blob_id))]
    pub async fn delete(&self, blob_id: &str) -> Result<(), SoledadError> {
        let _permit = self.semaphore.acquire().await.expect("semaphore is never closed");
        if self.local.exists(&self.namespace, blob_id)? {
            self.local.update_sync_status(&self.namespace, blob_id, SyncStatus::PendingDelete)?;
        }
        let resp = self.http.delete(&self.blob_path(blob_id)).await?;
        soledad_http::ensure_ok(&resp, &blob_id.to_string(), &[])?;
        if self.local.exists(&self.namespace, blob_id)? {
            self.local.delete(&self.namespace, blob_id)?;
        }
        Ok(())
    }

    /// Set a blob's server-side flags.
    pub async fn set_flags(&self, blob_id: &str, flags: &[Flag]) -> Result<(), SoledadError> {
        let flag_strs: Vec<String> = flags.iter().map(|f| f.as_str().to_string()).collect();
        let resp = self.http.post_json(&format!("blobs/{blob_id}/flags"), &flag_strs).await?;
        soledad_http::ensure_ok(&resp, &blob_id.to_string(), &flag_strs)?;
        Ok(())
    }

    /// Read a blob's server-side flags.
    pub async fn get_flags(&self, blob_id: &str) -> Result<Vec<Flag>, SoledadError> {
        let resp = self.http.get(&format!("blobs/{blob_id}/flags"), &[]).await?;
        soledad_http::ensure_ok(&resp, &blob_id.to_string(), &[])?;
        let raw: Vec<String> = resp.json().await?;
        Ok(raw.into_iter().map(Flag::from).collect())
    }

    /// List blob ids the server has in this namespace.
    ///
    /// `order_by` is `"date"`/`"+date"` (ascending) or `"-date"` (descending);
    /// `deleted` lists tombstones instead of live blobs; `filter_flag`
    /// restricts the listing to blobs bearing that flag.
    pub async fn remote_list(
        &self,
        order_by: Option<&str>,
        deleted: bool,
        filter_flag: Option<&Flag>,
    ) -> Result<Vec<BlobId>, SoledadError> {
        let query = self.list_query(order_by, deleted, filter_flag);
        let resp = self.http.get("blobs", &query).await?;
        soledad_http::ensure_ok(&resp, &String::new(), &[])?;
        resp.json().await
    }

    /// Count of blobs the server has in this namespace; a shorthand for
    /// `remote_list` with `only_count=true` added to the same query.
    pub async fn count(
        &self,
        order_by: Option<&str>,
        deleted: bool,
        filter_flag: Option<&Flag>,
    ) -> Result<usize, SoledadError> {
        let mut query = self.list_query(order_by, deleted, filter_flag);
        query.push(("only_count".to_string(), "true".to_string()));
        let resp = self.http.get("blobs", &query).await?;
        soledad_http::ensure_ok(&resp, &String::new(), &[])?;
        let body: CountResponse = resp.json().await?;
        Ok(body.count)
    }

    /// Every blob id tracked locally, regardless of status.
    pub fn local_list(&self) -> Result<Vec<BlobId>, SoledadError> {
        self.local.list(&self.namespace)
    }

    /// Blob ids locally at `status`.
    pub fn local_list_status(&self, status: SyncStatus) -> Result<Vec<BlobId>, SoledadError> {
        self.local.list_status(&self.namespace, status)
    }

    /// A blob's current local sync status.
    pub fn local_sync_status(&self, blob_id: &str) -> Result<SyncStatus, SoledadError> {
        self.local.get_sync_status(&self.namespace, blob_id)
    }

    /// Overwrite a blob's local sync status.
    pub fn mark_status(&self, blob_id: &str, status: SyncStatus) -> Result<(), SoledadError> {
        self.local.update_sync_status(&self.namespace, blob_id, status)
    }

    /// Overwrite several blobs' local sync status in one call.
    pub fn mark_batch_status(&self, blob_ids: &[BlobId], status: SyncStatus) -> Result<(), SoledadError> {
        self.local.update_batch_sync_status(&self.namespace, blob_ids, status)
    }

    /// Remove several blobs from the local store without touching the server.
    pub fn local_batch_delete(&self, blob_ids: &[BlobId]) -> Result<(), SoledadError> {
        self.local.batch_delete(&self.namespace, blob_ids)
    }

    /// Per-status counts for this namespace.
    pub fn sync_progress(&self) -> Result<SyncProgress, SoledadError> {
        self.local.get_sync_progress(&self.namespace)
    }

    /// Release the local store handle.
    pub fn close(&self) -> Result<(), SoledadError> {
        self.local.close()
    }
}
