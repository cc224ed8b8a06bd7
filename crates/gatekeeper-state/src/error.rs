//! Error types for gatekeeper-state

use thiserror::Error;

/// Errors that can occur in the persistence layer
#[derive(Error, Debug)]
pub enum StorageError {
    /// Record not found
    #[error("{kind} not found: {key}")]
    NotFound { kind: &'static str, key: String },

    /// A conditional write lost the optimistic race
    #[error("version conflict on {key}: expected {expected:?}, found {actual:?}")]
    VersionConflict {
        key: String,
        expected: Option<u64>,
        actual: Option<u64>,
    },

    /// Attempt to rewrite an append-only record
    #[error("append-only violation: audit entry {id} already exists")]
    AppendOnlyViolation { id: String },

    /// Serialization error
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Backend failure (connection, poisoned state, I/O)
    #[error("storage backend failure: {0}")]
    Backend(String),
}

impl StorageError {
    /// Whether this error is an optimistic-concurrency conflict that a
    /// caller may retry after re-reading.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::VersionConflict { .. })
    }
}
