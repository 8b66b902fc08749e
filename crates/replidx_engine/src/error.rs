//! Error types for the reconciliation engine.

use crate::types::{InstanceId, UniqueId};
use thiserror::Error;

/// Result type for engine operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during a synchronization pass.
///
/// A mapper that cannot turn a payload into a record is not an error; it
/// is recovered locally and surfaces as an [`Outcome`](crate::Outcome).
#[derive(Error, Debug)]
pub enum SyncError {
    /// The index store could not be consulted during conflict resolution.
    #[error("lookup failed for {unique_id}: {message}")]
    Lookup {
        /// Id being looked up.
        unique_id: UniqueId,
        /// Error message.
        message: String,
    },

    /// The index store rejected the staged batch.
    #[error("commit rejected: {0}")]
    Commit(String),

    /// An update would leave two records with the same id in the index.
    #[error("duplicate unique id in index: {0}")]
    DuplicateKey(UniqueId),

    /// The watermark store could not be read or written.
    #[error("watermark store error: {0}")]
    Watermark(String),

    /// A pass was committed under a different instance than it started with.
    #[error("pass started for instance {started} but committed for {committed}")]
    InstanceMismatch {
        /// Instance passed to `start`.
        started: InstanceId,
        /// Instance passed to `commit`.
        committed: InstanceId,
    },

    /// An earlier event of the pass failed; the pass can only be aborted.
    #[error("pass already failed: {0}")]
    Poisoned(String),

    /// The source feed failed while driving a pass.
    #[error("source feed error: {0}")]
    Feed(String),

    /// I/O error in a file-backed store.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error in a file-backed store.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SyncError {
    /// Creates a lookup failure.
    pub fn lookup(unique_id: &UniqueId, message: impl Into<String>) -> Self {
        Self::Lookup {
            unique_id: unique_id.clone(),
            message: message.into(),
        }
    }

    /// Creates a commit failure.
    pub fn commit(message: impl Into<String>) -> Self {
        Self::Commit(message.into())
    }

    /// Creates a source feed failure.
    pub fn feed(message: impl Into<String>) -> Self {
        Self::Feed(message.into())
    }

    /// Returns true if this error was raised by the index store on commit.
    pub fn is_commit_failure(&self) -> bool {
        matches!(self, SyncError::Commit(_) | SyncError::DuplicateKey(_))
    }
}
