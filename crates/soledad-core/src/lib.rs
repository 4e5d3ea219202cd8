//! Shared primitives for the encrypted blob sync engine: ids, the
//! namespace/blob-id/flag/sync-status vocabulary, and the error taxonomy
//! every other crate in the workspace builds on.

#![deny(unsafe_code)]

use std::fmt;

use thiserror::Error;

/// Opaque, printable blob identifier, unique within `(user, namespace)`.
pub type BlobId = String;

/// A namespace partitions blob ids. `""` is the default namespace.
pub type Namespace = str;

/// Blob content is immutable; every blob carries this sentinel revision.
pub const FIXED_REV: &str = "ImmutableRevision";

pub mod ids {
    //! Timestamp helpers used by the codec preamble and local store.

    use std::time::{SystemTime, UNIX_EPOCH};

    /// Seconds since the UNIX epoch, as stored in the codec preamble.
    pub fn now_secs() -> u64 {
        SystemTime::now().duration_since(UNIX_EPOCH).expect("system clock before epoch").as_secs()
    }

}

/// A flag tags a remote blob with orthogonal, server-validated metadata.
///
/// The vocabulary is closed on the server; the client does not pre-validate
/// it locally (`Custom` carries whatever the caller asked for). Flags just
/// round-trip to/from the wire and let the server's 406 response become
/// [`SoledadError::InvalidFlags`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Flag {
    /// Awaiting processing.
    Pending,
    /// Currently being processed.
    Processing,
    /// Any other flag string the server may recognize.
    Custom(String),
}

impl Flag {
    /// The wire representation of this flag.
    pub fn as_str(&self) -> &str {
        match self {
            Flag::Pending => "PENDING",
            Flag::Processing => "PROCESSING",
            Flag::Custom(s) => s,
        }
    }
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for Flag {
    fn from(s: &str) -> Self {
        match s {
            "PENDING" => Flag::Pending,
            "PROCESSING" => Flag::Processing,
            other => Flag::Custom(other.to_string()),
        }
    }
}

impl From<String> for Flag {
    fn from(s: String) -> Self {
        Flag::from(s.as_str())
    }
}

impl serde::Serialize for Flag {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> serde::Deserialize<'de> for Flag {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(Flag::from(s))
    }
}

/// Per-`(namespace, blob_id)` position in the client-side sync state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    /// Local ciphertext and server ciphertext agree.
    Synced,
    /// Written locally, not yet uploaded.
    PendingUpload,
    /// Observed remotely, not yet downloaded.
    PendingDownload,
    /// Delete requested, not yet confirmed against the server.
    PendingDelete,
    /// Terminal opt-out: the synchronizer must never upload this blob.
    LocalOnly,
    /// Download attempted `max_decrypt_retries` times, all failed integrity checks.
    FailedDownload,
    /// Upload attempted and failed; eligible for another `send_missing` pass.
    FailedUpload,
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncStatus::Synced => "SYNCED",
            SyncStatus::PendingUpload => "PENDING_UPLOAD",
            SyncStatus::PendingDownload => "PENDING_DOWNLOAD",
            SyncStatus::PendingDelete => "PENDING_DELETE",
            SyncStatus::LocalOnly => "LOCAL_ONLY",
            SyncStatus::FailedDownload => "FAILED_DOWNLOAD",
            SyncStatus::FailedUpload => "FAILED_UPLOAD",
        };
        f.write_str(s)
    }
}

/// The unified error taxonomy shared by every crate in the workspace.
///
/// [`SoledadError::RetriableTransfer`] is the canonical "please retry"
/// signal: HTTP transport errors (connect failures, closed connections) and
/// decrypt failures under the retry budget are wrapped into it at their
/// origin, so the retry loop utility's classifier only has to match one
/// variant.
#[derive(Debug, Error)]
pub enum SoledadError {
    /// Remote or local store says the id is absent.
    #[error("blob not found: {0}")]
    BlobNotFound(BlobId),

    /// `put` onto an id that already exists.
    #[error("blob already exists: {0}")]
    BlobAlreadyExists(BlobId),

    /// Server rejected the flag set for this blob.
    #[error("invalid flags for blob {blob_id}: {flags:?}")]
    InvalidFlags {
        /// Target blob id.
        blob_id: BlobId,
        /// The rejected flags.
        flags: Vec<String>,
    },

    /// GCM tag verification failed or the preamble was malformed.
    #[error("invalid blob: authentication tag or preamble verification failed")]
    InvalidBlob,

    /// Preamble names a scheme this codec does not implement.
    #[error("encryption scheme not implemented: {0}")]
    EncryptionSchemeNotImplemented(u8),

    /// Transient failure; the caller should retry.
    #[error("retriable transfer error: {0}")]
    RetriableTransfer(#[source] Box<SoledadError>),

    /// Retry budget exhausted; terminal until operator intervention.
    #[error("maximum retries ({retries}) exceeded for blob {blob_id}")]
    MaximumRetries {
        /// Target blob id.
        blob_id: BlobId,
        /// Retries attempted.
        retries: u32,
        /// The failure that triggered the final attempt.
        #[source]
        source: Box<SoledadError>,
    },

    /// Catch-all for unmapped server responses.
    #[error("server error: {0}")]
    Server(String),

    /// Underlying I/O failure (local store).
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl SoledadError {
    /// True for the single class of error the retry loop utility (§4.6)
    /// classifies as transient and worth re-dispatching.
    pub fn is_retriable(&self) -> bool {
        matches!(self, SoledadError::RetriableTransfer(_))
    }
}
