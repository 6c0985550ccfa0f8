//! Error types
//!
//! Three layers, each with descriptive messages:
//! - [`StorageError`] for the local data file
//! - [`DocumentError`] for remote document-store drivers
//! - [`StoreError`] for what the coordinator surfaces to callers
//!
//! Expected failure modes (missing keys, empty results, an offline backend)
//! never reach callers as errors; they are absorbed by the fallback paths.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while reading or writing the local data file
#[derive(Error, Debug)]
pub enum StorageError {
    /// Failed to create data directory
    #[error("Failed to create data directory '{path}': {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Permission denied accessing path
    #[error("Permission denied: cannot access '{path}'. Check file permissions.")]
    PermissionDenied {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Disk is full or quota exceeded
    #[error(
        "Disk full or quota exceeded while writing to '{path}'. Free up disk space and try again."
    )]
    DiskFull {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Failed to read file
    #[error("Failed to read '{path}': {source}")]
    ReadError {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Failed to write file
    #[error("Failed to write '{path}': {source}")]
    WriteError {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Data file could not be parsed and was moved aside
    #[error("Data file '{path}' is corrupted: {details}. A backup has been created at '{backup_path}'.")]
    CorruptDocument {
        path: PathBuf,
        backup_path: PathBuf,
        details: String,
    },

    /// Snapshot could not be serialized
    #[error("Failed to serialize snapshot: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Atomic write failed during rename
    #[error("Atomic write failed: could not rename '{from}' to '{to}': {source}")]
    AtomicWriteFailed {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl StorageError {
    /// Create an error from an I/O error with path context
    ///
    /// Classifies the error based on its kind (permission, disk full, etc.)
    pub fn from_io(error: io::Error, path: PathBuf) -> Self {
        match error.kind() {
            io::ErrorKind::PermissionDenied => StorageError::PermissionDenied {
                path,
                source: error,
            },
            _ if is_disk_full_error(&error) => StorageError::DiskFull {
                path,
                source: error,
            },
            _ => StorageError::WriteError {
                path,
                source: error,
            },
        }
    }

    /// Whether retrying after operator action can succeed
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            StorageError::DiskFull { .. }
                | StorageError::PermissionDenied { .. }
                | StorageError::CreateDirectory { .. }
        )
    }

    /// What an operator can do about this error
    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            StorageError::DiskFull { .. } => {
                Some("Free space on the volume holding the data directory; pending writes are kept in memory until the next flush.")
            }
            StorageError::PermissionDenied { .. } | StorageError::CreateDirectory { .. } => {
                Some("Make the data directory writable, or point DEPOT_DATA_DIR somewhere that is.")
            }
            StorageError::CorruptDocument { .. } => {
                Some("The unreadable data file was kept as depot.json.corrupt.backup; the store started from defaults.")
            }
            _ => None,
        }
    }
}

/// Check if an I/O error indicates disk full condition
fn is_disk_full_error(error: &io::Error) -> bool {
    let msg = error.to_string().to_lowercase();
    msg.contains("no space left")
        || msg.contains("disk full")
        || msg.contains("quota exceeded")
        || msg.contains("not enough space")
}

/// Errors reported by a remote document-store driver
///
/// Drivers map their native error shapes onto these variants. In particular
/// every driver must report a unique-key collision as [`DocumentError::DuplicateKey`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DocumentError {
    /// Insert collided with an existing document on a unique key
    #[error("Duplicate key in collection '{collection}': {key}")]
    DuplicateKey { collection: String, key: String },

    /// The request never got a response
    #[error("Transport error: {0}")]
    Transport(String),

    /// The server answered with an error
    #[error("Request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// The response could not be decoded
    #[error("Invalid response: {0}")]
    Decode(String),

    /// The operation did not finish in time
    #[error("Timed out after {0} ms")]
    Timeout(u64),
}

impl DocumentError {
    pub fn is_duplicate_key(&self) -> bool {
        matches!(self, DocumentError::DuplicateKey { .. })
    }
}

impl From<reqwest::Error> for DocumentError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            DocumentError::Timeout(0)
        } else if error.is_decode() {
            DocumentError::Decode(error.to_string())
        } else {
            DocumentError::Transport(error.to_string())
        }
    }
}

/// Errors returned by [`crate::Store`] operations
#[derive(Error, Debug)]
pub enum StoreError {
    /// The caller passed a value of the wrong shape for the key
    #[error("Invalid value for '{key}': {reason}")]
    InvalidArgument { key: String, reason: String },

    /// A collection record lacks its reconciliation key
    #[error("Record {index} in '{collection}' has no '{field}' field")]
    MissingKeyField {
        collection: String,
        field: String,
        index: usize,
    },

    /// Local file failure during an explicit flush
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Remote driver failure during an explicit flush
    #[error(transparent)]
    Document(#[from] DocumentError),
}

impl StoreError {
    /// Whether a later flush can succeed without changing the call
    pub fn is_recoverable(&self) -> bool {
        match self {
            StoreError::Storage(e) => e.is_recoverable(),
            StoreError::Document(e) => !e.is_duplicate_key(),
            StoreError::InvalidArgument { .. } | StoreError::MissingKeyField { .. } => false,
        }
    }

    /// What an operator can do about this error
    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            StoreError::Storage(e) => e.recovery_suggestion(),
            StoreError::Document(DocumentError::Transport(_) | DocumentError::Timeout(_)) => {
                Some("Check DEPOT_CONNECTION_STRING and that the remote store is reachable; unsent writes are retried on every flush.")
            }
            StoreError::Document(DocumentError::Rejected { .. }) => {
                Some("Check DEPOT_API_KEY and DEPOT_DATABASE.")
            }
            _ => None,
        }
    }

    pub(crate) fn invalid(key: &str, reason: impl Into<String>) -> Self {
        StoreError::InvalidArgument {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Result type for coordinator operations
pub type StoreResult<T> = Result<T, StoreError>;
