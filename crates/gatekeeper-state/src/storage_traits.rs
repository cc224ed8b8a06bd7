//! Storage trait definitions for Gatekeeper
//!
//! These traits define the repository abstractions the engine writes through:
//! - `LockStore`: one versioned lock record per environment
//! - `ApprovalStore`: versioned approval requests, idempotent per deployment context
//! - `AuditStore`: append-only audit log, scanned newest first
//!
//! Every mutable record carries a version. Writes are conditioned on the
//! version the caller read and fail with `StorageError::VersionConflict` when
//! another writer got there first, so several stateless engine instances can
//! share one backend. In-memory fakes live in the `fakes` module.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::schema::{ApprovalId, ApprovalRequest, AuditEntry, EnvironmentLock};

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// A record together with the version it was read at.
///
/// Versions start at 1 on creation and increase by one on every write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Versioned<T> {
    pub version: u64,
    pub record: T,
}

// ---------------------------------------------------------------------------
// LockStore
// ---------------------------------------------------------------------------

/// Environment lock repository.
///
/// Guarantees:
/// - At most one record per `environment_id`.
/// - `put` with `expected_version = None` creates and fails if a record exists.
/// - `put` with `Some(v)` replaces only if the stored version is `v`.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Read the lock record for an environment, if one exists.
    async fn get(&self, environment_id: &str) -> StorageResult<Option<Versioned<EnvironmentLock>>>;

    /// Conditionally create or replace a lock record.
    async fn put(
        &self,
        lock: EnvironmentLock,
        expected_version: Option<u64>,
    ) -> StorageResult<Versioned<EnvironmentLock>>;

    /// Conditionally remove a record. Only used to undo a create whose audit
    /// entry could not be written.
    async fn remove(&self, environment_id: &str, expected_version: u64) -> StorageResult<()>;

    /// All lock records.
    async fn list(&self) -> StorageResult<Vec<Versioned<EnvironmentLock>>>;
}

// ---------------------------------------------------------------------------
// ApprovalStore
// ---------------------------------------------------------------------------

/// Approval request repository.
///
/// Semantics:
/// - `create_or_get` is atomic per `(environment, commit_sha)`: if the latest
///   request for that context is live (anything but `Expired`) it is returned
///   with `false`; otherwise the given request is stored and returned with
///   `true`.
/// - `update` replaces only if the stored version matches.
#[async_trait]
pub trait ApprovalStore: Send + Sync {
    /// Create a request unless a live one exists for the same context.
    async fn create_or_get(
        &self,
        request: ApprovalRequest,
    ) -> StorageResult<(Versioned<ApprovalRequest>, bool)>;

    /// Read a request by ID.
    async fn get(&self, id: &ApprovalId) -> StorageResult<Option<Versioned<ApprovalRequest>>>;

    /// Latest request for a deployment context, whatever its status.
    async fn find_latest(
        &self,
        environment: &str,
        commit_sha: &str,
    ) -> StorageResult<Option<Versioned<ApprovalRequest>>>;

    /// Conditionally replace a request.
    async fn update(
        &self,
        request: ApprovalRequest,
        expected_version: u64,
    ) -> StorageResult<Versioned<ApprovalRequest>>;

    /// Conditionally remove a just-created request whose audit entry could
    /// not be written.
    async fn discard(&self, id: &ApprovalId, expected_version: u64) -> StorageResult<()>;

    /// Requests not yet in a terminal status.
    async fn list_open(&self) -> StorageResult<Vec<Versioned<ApprovalRequest>>>;
}

// ---------------------------------------------------------------------------
// AuditStore
// ---------------------------------------------------------------------------

/// Filters for audit queries. `None` fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuditFilter {
    pub resource_id: Option<String>,
    pub action: Option<String>,
    pub user_id: Option<String>,
    /// Inclusive lower bound.
    pub from: Option<DateTime<Utc>>,
    /// Inclusive upper bound.
    pub to: Option<DateTime<Utc>>,
}

impl AuditFilter {
    pub fn matches(&self, entry: &AuditEntry) -> bool {
        self.resource_id
            .as_deref()
            .is_none_or(|r| entry.resource_id == r)
            && self.action.as_deref().is_none_or(|a| entry.action == a)
            && self.user_id.as_deref().is_none_or(|u| entry.user_id == u)
            && self.from.is_none_or(|f| entry.timestamp >= f)
            && self.to.is_none_or(|t| entry.timestamp <= t)
    }
}

/// Position in a newest-first scan: the last entry already returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditCursor {
    pub timestamp: DateTime<Utc>,
    pub seq: u64,
}

impl AuditCursor {
    pub fn of(entry: &AuditEntry) -> Self {
        Self {
            timestamp: entry.timestamp,
            seq: entry.seq,
        }
    }

    /// Whether `entry` sorts strictly after this cursor in newest-first order.
    pub fn precedes(&self, entry: &AuditEntry) -> bool {
        (entry.timestamp, entry.seq) < (self.timestamp, self.seq)
    }
}

/// Append-only audit log.
///
/// Guarantees:
/// - `append` seals the entry's digest, assigns a monotonically increasing
///   `seq` and never overwrites; re-appending an existing `id` fails with
///   `AppendOnlyViolation`. A digest that cannot be computed fails with
///   `Serialization` and nothing is stored.
/// - There is no update or delete.
/// - `scan` returns entries ordered by `(timestamp, seq)` descending,
///   starting strictly after `after`, at most `limit` of them.
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Append an entry, returning it sealed and with its assigned `seq`.
    async fn append(&self, entry: AuditEntry) -> StorageResult<AuditEntry>;

    /// Read one page of matching entries, newest first.
    async fn scan(
        &self,
        filter: &AuditFilter,
        after: Option<AuditCursor>,
        limit: usize,
    ) -> StorageResult<Vec<AuditEntry>>;
}
