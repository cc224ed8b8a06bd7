//! Gatekeeper-State: persistence layer for the governance engine
//!
//! This crate owns the records the engine persists and the repository
//! traits it persists them through. Storage technology is pluggable; the
//! `fakes` module ships in-memory implementations used by tests and by the
//! daemon when no external store is configured.
//!
//! ## Layer 0 - Data/Persistence
//!
//! Focus: per-resource versioning, conditional writes, append-only audit.
//!
//! ## Key Components
//!
//! - `LockStore`: one versioned `EnvironmentLock` per environment
//! - `ApprovalStore`: versioned `ApprovalRequest`s, idempotent per `(environment, commit)`
//! - `AuditStore`: append-only `AuditEntry` log, scanned newest first

mod error;
pub mod fakes;
mod schema;
pub mod storage_traits;

pub use error::StorageError;
pub use schema::{
    ApprovalId, ApprovalRequest, ApprovalStatus, ApprovalVote, AuditEntry, AuditResult,
    EnvironmentLock, LockType, ParseEnumError, Resolution, ResourceType, Role, ScheduledWindow,
    VoteDecision, WindowKind,
};
pub use storage_traits::{
    ApprovalStore, AuditCursor, AuditFilter, AuditStore, LockStore, StorageResult, Versioned,
};
