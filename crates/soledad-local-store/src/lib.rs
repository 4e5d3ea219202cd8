//! Durable on-disk blob storage and the per-blob sync-status index (spec §4.2).
//!
//! Blob bytes (the already-encrypted wire form produced by `soledad-codec`)
//! live one file per `(namespace, blob_id)` under a root directory. A single
//! JSON sidecar (`index.json`) tracks each blob's [`SyncStatus`] and retry
//! counter. Every mutation re-persists the index with the same
//! write-to-tmp/fsync/rename sequence used for the blob files themselves, so
//! a crash never leaves a half-written file visible under its final name.

#![deny(unsafe_code)]

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use soledad_core::{BlobId, SoledadError, SyncStatus};

const DEFAULT_NAMESPACE_DIR: &str = "_default";
const INDEX_FILE: &str = "index.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Entry {
    status: SyncStatus,
    retries: u32,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Index {
    /// namespace -> blob_id -> entry
    namespaces: HashMap<String, HashMap<BlobId, Entry>>,
}

/// Per-namespace status counts, as reported to callers polling `sync()`'s progress.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncProgress {
    /// Blobs in sync with the server.
    pub synced: usize,
    /// Blobs waiting to be uploaded.
    pub pending_upload: usize,
    /// Blobs waiting to be downloaded.
    pub pending_download: usize,
    /// Blobs waiting to be deleted remotely.
    pub pending_delete: usize,
    /// Blobs that will never be uploaded.
    pub local_only: usize,
    /// Blobs that exhausted their download retry budget.
    pub failed_download: usize,
    /// Blobs that failed to upload.
    pub failed_upload: usize,
}

/// Durable blob storage rooted at a directory on disk.
pub struct LocalStore {
    root: PathBuf,
    index: Mutex<Index>,
}

impl LocalStore {
    /// Open (creating if absent) a local store rooted at `root`.
    #[tracing::instrument(skip(root), fields(root = %root.as_ref().display()))]
    pub fn open(root: impl AsRef<Path>) -> Result<Self, SoledadError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        let index_path = root.join(INDEX_FILE);
        let index = if index_path.exists() {
            let bytes = fs::read(&index_path)?;
            serde_json::from_slice(&bytes)
                .map_err(|e| SoledadError::Server(format!("corrupt local store index: {e}")))?
        } else {
            Index::default()
        };
        Ok(Self { root, index: Mutex::new(index) })
    }

    fn namespace_dir(&self, namespace: &str) -> PathBuf {
        let dir = if namespace.is_empty() { DEFAULT_NAMESPACE_DIR } else { namespace };
        self.root.join(dir)
    }

    fn blob_path(&self, namespace: &str, blob_id: &str) -> PathBuf {
        self.namespace_dir(namespace).join(blob_id)
    }

    fn persist_index_locked(&self, index: &Index) -> Result<(), SoledadError> {
        let bytes = serde_json::to_vec_pretty(index)
            .map_err(|e| SoledadError::Server(format!("failed to serialize index: {e}")))?;
        atomic_write(&self.root.join(INDEX_FILE), &bytes)
    }

    /// Store a new blob, starting it `PENDING_UPLOAD`. Fails with
    /// [`SoledadError::BlobAlreadyExists`] if a blob with this id is already
    /// stored in this namespace.
    #[tracing::instrument(skip(self, data), fields(namespace, blob_id))]
    pub fn put(&self, namespace: &str, blob_id: &str, data: &[u8]) -> Result<(), SoledadError> {
        if self.exists(namespace, blob_id)? {
            return Err(SoledadError::BlobAlreadyExists(blob_id.to_string()));
        }
        let dir = self.namespace_dir(namespace);
        fs::create_dir_all(&dir)?;
        atomic_write(&self.blob_path(namespace, blob_id), data)?;

        let mut index = self.index.lock().unwrap();
        let ns = index.namespaces.entry(namespace.to_string()).or_default();
        ns.entry(blob_id.to_string()).or_insert(Entry { status: SyncStatus::PendingUpload, retries: 0 });
        self.persist_index_locked(&index)
    }

    /// Write a blob's bytes unconditionally, overwriting any existing
    /// content. Used by the sync machinery to land already-negotiated
    /// server state locally (a download is not a duplicate `put`); does not
    /// touch the status index, since the caller always follows with an
    /// explicit `update_sync_status`.
    #[tracing::instrument(skip(self, data), fields(namespace, blob_id))]
    pub fn overwrite(&self, namespace: &str, blob_id: &str, data: &[u8]) -> Result<(), SoledadError> {
        let dir = self.namespace_dir(namespace);
        fs::create_dir_all(&dir)?;
        atomic_write(&self.blob_path(namespace, blob_id), data)
    }

    /// Read a blob's bytes.
    pub fn get(&self, namespace: &str, blob_id: &str) -> Result<Vec<u8>, SoledadError> {
        let path = self.blob_path(namespace, blob_id);
        fs::read(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => SoledadError::BlobNotFound(blob_id.to_string()),
            _ => SoledadError::Io(e),
        })
    }

    /// True if a blob with this id exists in this namespace.
    pub fn exists(&self, namespace: &str, blob_id: &str) -> Result<bool, SoledadError> {
        Ok(self.blob_path(namespace, blob_id).exists())
    }

    /// Remove a blob's bytes and its status entry.
    #[tracing::instrument(skip(self), fields(namespace, blob_id))]
    pub fn delete(&self, namespace: &str, blob_id: &str) -> Result<(), SoledadError> {
        let path = self.blob_path(namespace, blob_id);
        if !path.exists() {
            return Err(SoledadError::BlobNotFound(blob_id.to_string()));
        }
        fs::remove_file(&path)?;

        let mut index = self.index.lock().unwrap();
        if let Some(ns) = index.namespaces.get_mut(namespace) {
            ns.remove(blob_id);
        }
        self.persist_index_locked(&index)
    }

    /// Remove several blobs in one call; the index is persisted once at the end.
    pub fn batch_delete(&self, namespace: &str, blob_ids: &[BlobId]) -> Result<(), SoledadError> {
        let mut index = self.index.lock().unwrap();
        for blob_id in blob_ids {
            let path = self.blob_path(namespace, blob_id);
            if path.exists() {
                fs::remove_file(&path)?;
            }
            if let Some(ns) = index.namespaces.get_mut(namespace) {
                ns.remove(blob_id);
            }
        }
        self.persist_index_locked(&index)
    }

    /// All blob ids stored under `namespace`.
    pub fn list(&self, namespace: &str) -> Result<Vec<BlobId>, SoledadError> {
        let index = self.index.lock().unwrap();
        Ok(index.namespaces.get(namespace).map(|ns| ns.keys().cloned().collect()).unwrap_or_default())
    }

    /// Blob ids under `namespace` currently at `status`.
    pub fn list_status(&self, namespace: &str, status: SyncStatus) -> Result<Vec<BlobId>, SoledadError> {
        let index = self.index.lock().unwrap();
        Ok(index
            .namespaces
            .get(namespace)
            .map(|ns| ns.iter().filter(|(_, e)| e.status == status).map(|(id, _)| id.clone()).collect())
            .unwrap_or_default())
    }

    /// Set a blob's sync status, resetting its retry counter to zero.
    #[tracing::instrument(skip(self), fields(namespace, blob_id, %status))]
    pub fn update_sync_status(&self, namespace: &str, blob_id: &str, status: SyncStatus) -> Result<(), SoledadError> {
        let mut index = self.index.lock().unwrap();
        let ns = index.namespaces.entry(namespace.to_string()).or_default();
        let entry = ns.entry(blob_id.to_string()).or_insert(Entry { status, retries: 0 });
        entry.status = status;
        entry.retries = 0;
        self.persist_index_locked(&index)
    }

    /// Set the same sync status on several blobs at once.
    pub fn update_batch_sync_status(&self, namespace: &str, blob_ids: &[BlobId], status: SyncStatus) -> Result<(), SoledadError> {
        let mut index = self.index.lock().unwrap();
        let ns = index.namespaces.entry(namespace.to_string()).or_default();
        for blob_id in blob_ids {
            let entry = ns.entry(blob_id.clone()).or_insert(Entry { status, retries: 0 });
            entry.status = status;
            entry.retries = 0;
        }
        self.persist_index_locked(&index)
    }

    /// The current sync status of a blob.
    pub fn get_sync_status(&self, namespace: &str, blob_id: &str) -> Result<SyncStatus, SoledadError> {
        let index = self.index.lock().unwrap();
        index
            .namespaces
            .get(namespace)
            .and_then(|ns| ns.get(blob_id))
            .map(|e| e.status)
            .ok_or_else(|| SoledadError::BlobNotFound(blob_id.to_string()))
    }

    /// Bump a blob's retry counter and return the new value.
    pub fn increment_retries(&self, namespace: &str, blob_id: &str) -> Result<u32, SoledadError> {
        let mut index = self.index.lock().unwrap();
        let entry = index
            .namespaces
            .get_mut(namespace)
            .and_then(|ns| ns.get_mut(blob_id))
            .ok_or_else(|| SoledadError::BlobNotFound(blob_id.to_string()))?;
        entry.retries += 1;
        let retries = entry.retries;
        self.persist_index_locked(&index)?;
        Ok(retries)
    }

    /// Per-status counts for `namespace`, for progress reporting.
    pub fn get_sync_progress(&self, namespace: &str) -> Result<SyncProgress, SoledadError> {
        let index = self.index.lock().unwrap();
        let mut progress = SyncProgress::default();
        if let Some(ns) = index.namespaces.get(namespace) {
            for entry in ns.values() {
                match entry.status {
                    SyncStatus::Synced => progress.synced += 1,
                    SyncStatus::PendingUpload => progress.pending_upload += 1,
                    SyncStatus::PendingDownload => progress.pending_download += 1,
                    SyncStatus::PendingDelete => progress.pending_delete += 1,
                    SyncStatus::LocalOnly => progress.local_only += 1,
                    SyncStatus::FailedDownload => progress.failed_download += 1,
                    SyncStatus::FailedUpload => progress.failed_upload += 1,
                }
            }
        }
        Ok(progress)
    }

    /// Flush the index to disk. The store remains usable afterward.
    pub fn close(&self) -> Result<(), SoledadError> {
        let index = self.index.lock().unwrap();
        self.persist_index_locked(&index)
    }
}

fn atomic_write(path: &Path, data: &[u8]) -> Result<(), SoledadError> {
    let tmp_path = path.with_extension("tmp");
    {
        let mut tmp = fs::File::create(&tmp_path)?;
        use std::io::Write;
        tmp.write_all(data)?;
        tmp.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;
    Ok(())
}
