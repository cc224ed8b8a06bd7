//! Governance error taxonomy.

use gatekeeper_state::{ApprovalId, ApprovalStatus, Role, StorageError};

use super::reason::ReasonCode;
use crate::rbac::Capability;

/// Errors produced by the governance engine.
///
/// Every variant maps to a stable [`ReasonCode`] via [`GovernanceError::reason_code`].
#[derive(Debug, thiserror::Error)]
pub enum GovernanceError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("role {role} lacks {capability} on {environment}")]
    Authorization {
        role: Role,
        environment: String,
        capability: Capability,
    },

    #[error("environment {environment} is hard locked")]
    LockViolation { environment: String },

    #[error("approval {request_id} required (status {status})")]
    ApprovalRequired {
        request_id: ApprovalId,
        status: ApprovalStatus,
    },

    #[error("approval {request_id} expired")]
    ApprovalExpired { request_id: ApprovalId },

    #[error("{user_id} cannot vote on their own approval {request_id}")]
    SelfApprovalBlocked {
        request_id: ApprovalId,
        user_id: String,
    },

    #[error("{user_id} has already voted on approval {request_id}")]
    DuplicateVoterBlocked {
        request_id: ApprovalId,
        user_id: String,
    },

    #[error("approval {request_id} is {status} and accepts no votes")]
    RequestNotVotable {
        request_id: ApprovalId,
        status: ApprovalStatus,
    },

    #[error("emergency unlock of {environment} denied: {reason}")]
    EmergencyUnlockDenied { environment: String, reason: String },

    #[error("write to {resource} lost {attempts} optimistic races")]
    Conflict { resource: String, attempts: u32 },

    #[error("{kind} not found: {key}")]
    NotFound { kind: &'static str, key: String },

    #[error("audit write failed, operation rolled back: {0}")]
    AuditWriteFailed(#[source] StorageError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl GovernanceError {
    pub fn reason_code(&self) -> ReasonCode {
        match self {
            Self::Configuration(_) => ReasonCode::NoBranchMapping,
            Self::Authorization { .. } => ReasonCode::RbacDenied,
            Self::LockViolation { .. } => ReasonCode::EnvironmentHardLocked,
            Self::ApprovalRequired { status, .. } => match status {
                ApprovalStatus::Rejected => ReasonCode::ApprovalRejected,
                _ => ReasonCode::ApprovalRequired,
            },
            Self::ApprovalExpired { .. } => ReasonCode::ApprovalExpired,
            Self::SelfApprovalBlocked { .. } => ReasonCode::SelfApprovalBlocked,
            Self::DuplicateVoterBlocked { .. } => ReasonCode::DuplicateVoterBlocked,
            Self::RequestNotVotable { .. } => ReasonCode::RequestNotVotable,
            Self::EmergencyUnlockDenied { .. } => ReasonCode::EmergencyUnlockDenied,
            Self::Conflict { .. } => ReasonCode::Conflict,
            Self::NotFound { .. } => ReasonCode::NotFound,
            Self::AuditWriteFailed(_) => ReasonCode::AuditWriteFailed,
            Self::Storage(_) => ReasonCode::StorageFailure,
            Self::InvalidConfig(_) => ReasonCode::InvalidConfig,
        }
    }
}

/// Result type for governance operations.
pub type Result<T> = std::result::Result<T, GovernanceError>;
