//! In-memory implementations of the storage traits
//!
//! Provides `MemoryLockStore`, `MemoryApprovalStore`, and `MemoryAuditStore`
//! that satisfy the trait contracts without any external dependencies. They
//! back the test suites and the daemon when no external store is wired in.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use crate::error::StorageError;
use crate::schema::{ApprovalId, ApprovalRequest, ApprovalStatus, AuditEntry, EnvironmentLock};
use crate::storage_traits::*;

fn guard<T>(m: &Mutex<T>) -> StorageResult<MutexGuard<'_, T>> {
    m.lock()
        .map_err(|_| StorageError::Backend("in-memory store mutex poisoned".to_string()))
}

// ---------------------------------------------------------------------------
// MemoryLockStore
// ---------------------------------------------------------------------------

/// In-memory lock store backed by a `HashMap<environment_id, Versioned<_>>`.
#[derive(Debug, Default)]
pub struct MemoryLockStore {
    locks: Mutex<HashMap<String, Versioned<EnvironmentLock>>>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn get(&self, environment_id: &str) -> StorageResult<Option<Versioned<EnvironmentLock>>> {
        let locks = guard(&self.locks)?;
        Ok(locks.get(environment_id).cloned())
    }

    async fn put(
        &self,
        lock: EnvironmentLock,
        expected_version: Option<u64>,
    ) -> StorageResult<Versioned<EnvironmentLock>> {
        let mut locks = guard(&self.locks)?;
        let actual = locks.get(&lock.environment_id).map(|v| v.version);
        if actual != expected_version {
            return Err(StorageError::VersionConflict {
                key: lock.environment_id.clone(),
                expected: expected_version,
                actual,
            });
        }
        let stored = Versioned {
            version: actual.map_or(1, |v| v + 1),
            record: lock,
        };
        locks.insert(stored.record.environment_id.clone(), stored.clone());
        Ok(stored)
    }

    async fn remove(&self, environment_id: &str, expected_version: u64) -> StorageResult<()> {
        let mut locks = guard(&self.locks)?;
        let actual = locks.get(environment_id).map(|v| v.version);
        if actual != Some(expected_version) {
            return Err(StorageError::VersionConflict {
                key: environment_id.to_string(),
                expected: Some(expected_version),
                actual,
            });
        }
        locks.remove(environment_id);
        Ok(())
    }

    async fn list(&self) -> StorageResult<Vec<Versioned<EnvironmentLock>>> {
        let locks = guard(&self.locks)?;
        let mut all: Vec<_> = locks.values().cloned().collect();
        all.sort_by(|a, b| a.record.environment_id.cmp(&b.record.environment_id));
        Ok(all)
    }
}

// ---------------------------------------------------------------------------
// MemoryApprovalStore
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct ApprovalState {
    requests: HashMap<ApprovalId, Versioned<ApprovalRequest>>,
    /// Request history per `(environment, commit_sha)`, oldest first.
    by_context: HashMap<(String, String), Vec<ApprovalId>>,
}

impl ApprovalState {
    fn latest(&self, key: &(String, String)) -> Option<&Versioned<ApprovalRequest>> {
        self.by_context
            .get(key)
            .and_then(|ids| ids.last())
            .and_then(|id| self.requests.get(id))
    }
}

/// In-memory approval store with a per-context index.
#[derive(Debug, Default)]
pub struct MemoryApprovalStore {
    state: Mutex<ApprovalState>,
}

impl MemoryApprovalStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ApprovalStore for MemoryApprovalStore {
    async fn create_or_get(
        &self,
        request: ApprovalRequest,
    ) -> StorageResult<(Versioned<ApprovalRequest>, bool)> {
        let mut state = guard(&self.state)?;
        let key = request.context_key();
        if let Some(existing) = state.latest(&key) {
            if existing.record.status != ApprovalStatus::Expired {
                return Ok((existing.clone(), false));
            }
        }
        let stored = Versioned {
            version: 1,
            record: request,
        };
        let id = stored.record.id;
        state.requests.insert(id, stored.clone());
        state.by_context.entry(key).or_default().push(id);
        Ok((stored, true))
    }

    async fn get(&self, id: &ApprovalId) -> StorageResult<Option<Versioned<ApprovalRequest>>> {
        let state = guard(&self.state)?;
        Ok(state.requests.get(id).cloned())
    }

    async fn find_latest(
        &self,
        environment: &str,
        commit_sha: &str,
    ) -> StorageResult<Option<Versioned<ApprovalRequest>>> {
        let state = guard(&self.state)?;
        let key = (environment.to_string(), commit_sha.to_string());
        Ok(state.latest(&key).cloned())
    }

    async fn update(
        &self,
        request: ApprovalRequest,
        expected_version: u64,
    ) -> StorageResult<Versioned<ApprovalRequest>> {
        let mut state = guard(&self.state)?;
        let current = state
            .requests
            .get_mut(&request.id)
            .ok_or_else(|| StorageError::NotFound {
                kind: "approval request",
                key: request.id.to_string(),
            })?;
        if current.version != expected_version {
            return Err(StorageError::VersionConflict {
                key: request.id.to_string(),
                expected: Some(expected_version),
                actual: Some(current.version),
            });
        }
        current.version += 1;
        current.record = request;
        Ok(current.clone())
    }

    async fn discard(&self, id: &ApprovalId, expected_version: u64) -> StorageResult<()> {
        let mut state = guard(&self.state)?;
        let (actual, key) = match state.requests.get(id) {
            Some(v) => (v.version, v.record.context_key()),
            None => {
                return Err(StorageError::NotFound {
                    kind: "approval request",
                    key: id.to_string(),
                })
            }
        };
        if actual != expected_version {
            return Err(StorageError::VersionConflict {
                key: id.to_string(),
                expected: Some(expected_version),
                actual: Some(actual),
            });
        }
        state.requests.remove(id);
        if let Some(ids) = state.by_context.get_mut(&key) {
            ids.retain(|i| i != id);
        }
        Ok(())
    }

    async fn list_open(&self) -> StorageResult<Vec<Versioned<ApprovalRequest>>> {
        let state = guard(&self.state)?;
        let mut open: Vec<_> = state
            .requests
            .values()
            .filter(|v| !v.record.status.is_terminal())
            .cloned()
            .collect();
        open.sort_by_key(|v| (v.record.created_at, v.record.id));
        Ok(open)
    }
}

// ---------------------------------------------------------------------------
// MemoryAuditStore
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct AuditState {
    entries: Vec<AuditEntry>,
    next_seq: u64,
}

/// In-memory append-only audit log.
#[derive(Debug, Default)]
pub struct MemoryAuditStore {
    state: Mutex<AuditState>,
}

impl MemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries appended so far.
    pub fn len(&self) -> usize {
        self.state.lock().map(|s| s.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl AuditStore for MemoryAuditStore {
    async fn append(&self, mut entry: AuditEntry) -> StorageResult<AuditEntry> {
        let mut state = guard(&self.state)?;
        if state.entries.iter().any(|e| e.id == entry.id) {
            return Err(StorageError::AppendOnlyViolation {
                id: entry.id.to_string(),
            });
        }
        entry.seal()?;
        state.next_seq += 1;
        entry.seq = state.next_seq;
        state.entries.push(entry.clone());
        Ok(entry)
    }

    async fn scan(
        &self,
        filter: &AuditFilter,
        after: Option<AuditCursor>,
        limit: usize,
    ) -> StorageResult<Vec<AuditEntry>> {
        let state = guard(&self.state)?;
        let mut page: Vec<AuditEntry> = state
            .entries
            .iter()
            .filter(|e| filter.matches(e))
            .filter(|e| after.is_none_or(|c| c.precedes(e)))
            .cloned()
            .collect();
        page.sort_by(|a, b| (b.timestamp, b.seq).cmp(&(a.timestamp, a.seq)));
        page.truncate(limit);
        Ok(page)
    }
}
