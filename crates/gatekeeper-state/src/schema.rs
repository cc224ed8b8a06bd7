//! Record definitions persisted by the governance engine
//!
//! Records:
//! - EnvironmentLock: manual lock state plus scheduled windows, one per environment
//! - ApprovalRequest: a votable sign-off object for one `(environment, commit)`
//! - AuditEntry: immutable record of one decision or transition

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::StorageError;

/// Error returned when parsing one of the record enums from text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

// ---------------------------------------------------------------------------
// Roles
// ---------------------------------------------------------------------------

/// A requester or reviewer role.
///
/// Roles are flat: what a role may do comes from the permission matrix, not
/// from any ordering between roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Viewer,
    Developer,
    Operator,
    Approver,
    Admin,
}

impl Role {
    pub const ALL: [Role; 5] = [
        Role::Viewer,
        Role::Developer,
        Role::Operator,
        Role::Approver,
        Role::Admin,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Viewer => "viewer",
            Self::Developer => "developer",
            Self::Operator => "operator",
            Self::Approver => "approver",
            Self::Admin => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Role::ALL
            .into_iter()
            .find(|r| r.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ParseEnumError {
                kind: "role",
                value: s.to_string(),
            })
    }
}

// ---------------------------------------------------------------------------
// Environment locks
// ---------------------------------------------------------------------------

/// Deployability of an environment.
///
/// Ordered by restrictiveness so overlapping windows can pick the strictest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockType {
    /// Deployments proceed subject to RBAC and rule approvals.
    Unlocked,
    /// Deployments require an approved request.
    SoftLocked,
    /// Nothing deploys, regardless of role.
    HardLocked,
}

impl LockType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unlocked => "unlocked",
            Self::SoftLocked => "soft_locked",
            Self::HardLocked => "hard_locked",
        }
    }

    pub fn is_locked(self) -> bool {
        !matches!(self, Self::Unlocked)
    }
}

impl fmt::Display for LockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LockType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "unlocked" => Ok(Self::Unlocked),
            "soft_locked" | "soft" => Ok(Self::SoftLocked),
            "hard_locked" | "hard" => Ok(Self::HardLocked),
            _ => Err(ParseEnumError {
                kind: "lock type",
                value: s.to_string(),
            }),
        }
    }
}

/// When a scheduled window applies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WindowKind {
    /// A one-off half-open interval `[start, end)`.
    Range {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    /// A weekly window in UTC. If `end_time <= start_time` the window spans
    /// midnight and belongs to the weekday it starts on.
    Recurring {
        weekdays: Vec<Weekday>,
        start_time: NaiveTime,
        end_time: NaiveTime,
    },
}

/// A time window that forces a lock type while active.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledWindow {
    pub id: Uuid,
    pub kind: WindowKind,
    pub lock_type: LockType,
    pub reason: String,
}

impl ScheduledWindow {
    pub fn new(kind: WindowKind, lock_type: LockType, reason: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            lock_type,
            reason: reason.into(),
        }
    }
}

/// Lock record for one environment.
///
/// `lock_type` is the manually set state. The effective state at a given
/// instant overlays `scheduled_windows` on top of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentLock {
    pub environment_id: String,
    pub lock_type: LockType,
    pub reason: String,
    pub set_by: String,
    pub set_at: DateTime<Utc>,
    /// When set, the sweep restores `relock_to` at or after this instant.
    pub auto_relock_at: Option<DateTime<Utc>>,
    pub relock_to: Option<LockType>,
    /// Scheduled windows are ignored until this instant (emergency unlock).
    pub emergency_override_until: Option<DateTime<Utc>>,
    pub ticket_id: Option<String>,
    pub scheduled_windows: Vec<ScheduledWindow>,
}

impl EnvironmentLock {
    /// A fresh record in the given state with no schedules.
    pub fn new(
        environment_id: impl Into<String>,
        lock_type: LockType,
        reason: impl Into<String>,
        set_by: impl Into<String>,
        set_at: DateTime<Utc>,
    ) -> Self {
        Self {
            environment_id: environment_id.into(),
            lock_type,
            reason: reason.into(),
            set_by: set_by.into(),
            set_at,
            auto_relock_at: None,
            relock_to: None,
            emergency_override_until: None,
            ticket_id: None,
            scheduled_windows: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Approval requests
// ---------------------------------------------------------------------------

/// Unique identifier for an approval request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ApprovalId(pub Uuid);

impl ApprovalId {
    /// Generate a new random ApprovalId
    pub fn new() -> Self {
        ApprovalId(Uuid::new_v4())
    }
}

impl Default for ApprovalId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ApprovalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ApprovalId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(ApprovalId)
    }
}

/// The decision of a single vote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteDecision {
    /// Approve the deployment.
    Approve,
    /// Veto the deployment.
    Reject,
    /// Ask for changes without vetoing.
    RequestChanges,
}

impl VoteDecision {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Reject => "reject",
            Self::RequestChanges => "request_changes",
        }
    }
}

/// A single vote cast on an approval request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalVote {
    pub user_id: String,
    pub role: Role,
    pub decision: VoteDecision,
    pub comment: Option<String>,
    pub cast_at: DateTime<Utc>,
}

/// Lifecycle status of an approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    /// Created; reviewers not yet informed.
    Pending,
    /// Reviewers have been informed.
    Notified,
    /// At least one vote has been cast.
    Voting,
    Approved,
    Rejected,
    Expired,
}

impl ApprovalStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Approved | Self::Rejected | Self::Expired)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Notified => "notified",
            Self::Voting => "voting",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Expired => "expired",
        }
    }
}

impl fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How and when a request reached its terminal status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub reason_code: String,
    pub resolved_by: Option<String>,
    pub resolved_at: DateTime<Utc>,
}

/// A tracked, votable sign-off for one deployment context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: ApprovalId,
    /// Opaque reference to the execution being gated (`environment@commit`).
    pub execution_ref: String,
    pub environment: String,
    pub commit_sha: String,
    /// The user whose deployment request opened this approval.
    pub requested_by: String,
    pub required_approvals: u32,
    /// Roles whose approvals count toward the quorum. Empty means any role.
    pub required_roles: BTreeSet<Role>,
    pub votes: Vec<ApprovalVote>,
    pub status: ApprovalStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub block_self_approval: bool,
    pub require_distinct_approvers: bool,
    pub resolution: Option<Resolution>,
}

impl ApprovalRequest {
    /// Idempotency key: one live request per environment and commit.
    pub fn context_key(&self) -> (String, String) {
        (self.environment.clone(), self.commit_sha.clone())
    }
}

// ---------------------------------------------------------------------------
// Audit
// ---------------------------------------------------------------------------

/// Kind of resource an audit entry is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Deployment,
    EnvironmentLock,
    ApprovalRequest,
}

/// Outcome recorded on an audit entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditResult {
    Success,
    Denied,
    Blocked,
    Pending,
}

/// Immutable record of one decision or state transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    /// Append order assigned by the store; zero until appended.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub action: String,
    pub resource_type: ResourceType,
    pub resource_id: String,
    pub user_id: String,
    pub role: Option<Role>,
    pub result: AuditResult,
    pub reason_code: Option<String>,
    pub details: serde_json::Value,
    /// SHA-256 over the entry content excluding `seq` and `digest`.
    pub digest: String,
}

#[derive(Serialize)]
struct DigestView<'a> {
    id: &'a Uuid,
    timestamp: &'a DateTime<Utc>,
    action: &'a str,
    resource_type: ResourceType,
    resource_id: &'a str,
    user_id: &'a str,
    role: Option<Role>,
    result: AuditResult,
    reason_code: Option<&'a str>,
    details: &'a serde_json::Value,
}

impl AuditEntry {
    /// Build an unsealed entry. The store seals it on append.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        timestamp: DateTime<Utc>,
        action: impl Into<String>,
        resource_type: ResourceType,
        resource_id: impl Into<String>,
        user_id: impl Into<String>,
        role: Option<Role>,
        result: AuditResult,
        reason_code: Option<String>,
        details: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            seq: 0,
            timestamp,
            action: action.into(),
            resource_type,
            resource_id: resource_id.into(),
            user_id: user_id.into(),
            role,
            result,
            reason_code,
            details,
            digest: String::new(),
        }
    }

    /// Compute and store the content digest.
    pub fn seal(&mut self) -> Result<(), StorageError> {
        self.digest = self.compute_digest()?;
        Ok(())
    }

    /// Recompute the content digest.
    pub fn compute_digest(&self) -> Result<String, StorageError> {
        let view = DigestView {
            id: &self.id,
            timestamp: &self.timestamp,
            action: &self.action,
            resource_type: self.resource_type,
            resource_id: &self.resource_id,
            user_id: &self.user_id,
            role: self.role,
            result: self.result,
            reason_code: self.reason_code.as_deref(),
            details: &self.details,
        };
        let bytes = serde_json::to_vec(&view)?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }

    /// Whether the entry is sealed and its digest still matches the content.
    pub fn verify(&self) -> bool {
        !self.digest.is_empty() && self.compute_digest().is_ok_and(|d| d == self.digest)
    }
}
