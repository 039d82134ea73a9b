//! # Error Taxonomy
//!
//! Every fallible operation of the engine returns one of the kinds below.
//! Errors surface to the caller immediately; the engine never retries
//! silently. The one scheduled exception is garbage collection: a pass
//! that cannot allocate a fill page abandons the pass (logged) and the
//! driver retries on its next wakeup.
//!
//! Callers are expected to branch on kinds: a `WriteConflict` is retried
//! by the application with a fresh transaction, a `DuplicateKey` is a
//! semantic outcome, an `OutOfMemory` is fatal for the operation.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, Error)]
pub enum StorageError {
    /// The page pool (or the hash table's slot budget) is exhausted.
    #[error("out of memory: {0}")]
    OutOfMemory(&'static str),

    /// A concurrent transaction published a newer version of the key
    /// first. First-committer-wins: the loser of the newest-pointer CAS
    /// observes this.
    #[error("write conflict on key {key}")]
    WriteConflict { key: u64 },

    /// Insert with `fail_on_exists` found a live visible version.
    #[error("duplicate key {key}")]
    DuplicateKey { key: u64 },

    /// The target key is absent or tombstoned for this snapshot.
    #[error("key {key} not found")]
    NotFound { key: u64 },

    /// The tuple does not match the table schema.
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    /// Malformed query buffer, unknown table, or invalid parameter.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The scan was cancelled by its initiator.
    #[error("scan cancelled")]
    Cancelled,
}

impl StorageError {
    /// True for conditions the caller can resolve by retrying with a new
    /// snapshot.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::WriteConflict { .. })
    }
}
