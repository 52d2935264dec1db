//! Error types for the storage subsystem.

use thiserror::Error;

/// Result type alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Error variants for storage operations.
///
/// Absence (`NoFile`, `NoStorage`) is part of the normal result vocabulary:
/// callers are expected to reconstruct or skip, not to treat these as faults.
/// Checksum mismatches are reported as `NoFile`/`CorruptedData` so that
/// corrupt and missing data take the same recovery path.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The requested file does not exist, is dead, or failed verification.
    #[error("no file for id {file_id:#018x}")]
    NoFile {
        /// The packed file identifier that was not found.
        file_id: u64,
    },

    /// No storage shard is registered under the given id.
    #[error("no storage with id {storage_id}")]
    NoStorage {
        /// The storage id that did not resolve.
        storage_id: u16,
    },

    /// No directory shard could be prepared or created.
    #[error("no directory available")]
    NoDirectoryAvailable,

    /// A write failed after bounded retries.
    #[error("write error on {path}: {reason}")]
    WriteError {
        /// Path of the file that failed to write.
        path: String,
        /// Description of the underlying failure.
        reason: String,
    },

    /// A read failed, or the data on disk failed verification.
    #[error("read error on {path}: {reason}")]
    ReadError {
        /// Path of the file that failed to read.
        path: String,
        /// Description of the underlying failure.
        reason: String,
    },

    /// A delete failed for a reason other than the file being absent.
    #[error("delete error on {path}")]
    DeleteError {
        /// Path of the file that failed to delete.
        path: String,
    },

    /// Persisted data failed its hash check.
    #[error("corrupted data: {context}")]
    CorruptedData {
        /// What was being verified when the mismatch was found.
        context: String,
    },

    /// Persisted data passed its hash check but could not be decoded.
    #[error("deserialize error: {context}")]
    DeserializeError {
        /// What was being decoded.
        context: String,
    },

    /// The document is still referenced elsewhere and cannot be unloaded.
    #[error("data is locked")]
    DataIsLocked,

    /// The in-memory copy is older than what another holder has persisted.
    #[error("data is obsolete")]
    DataIsObsolete,

    /// The operator chose to abort at a query checkpoint.
    #[error("aborted by query callback")]
    Aborted,

    /// Wraps standard I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
