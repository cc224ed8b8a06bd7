//! Stable reason codes carried by every decision, error, and audit entry.

use serde::{Deserialize, Serialize};

/// Machine-readable reason attached to a verdict or failure.
///
/// The string form is part of the external contract: callers render and log
/// it, audit entries persist it. Never rename a variant's string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonCode {
    Allowed,
    NoBranchMapping,
    EnvironmentHardLocked,
    RbacDenied,
    ApprovalRequired,
    ApprovalRejected,
    ApprovalExpired,
    ApprovalQuorumMet,
    SelfApprovalBlocked,
    DuplicateVoterBlocked,
    RequestNotVotable,
    EmergencyUnlockDenied,
    EmergencyUnlock,
    AutoRelock,
    Cancelled,
    Conflict,
    NotFound,
    AuditWriteFailed,
    StorageFailure,
    InvalidConfig,
}

impl ReasonCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Allowed => "ALLOWED",
            Self::NoBranchMapping => "NO_BRANCH_MAPPING",
            Self::EnvironmentHardLocked => "ENVIRONMENT_HARD_LOCKED",
            Self::RbacDenied => "RBAC_DENIED",
            Self::ApprovalRequired => "APPROVAL_REQUIRED",
            Self::ApprovalRejected => "APPROVAL_REJECTED",
            Self::ApprovalExpired => "APPROVAL_EXPIRED",
            Self::ApprovalQuorumMet => "APPROVAL_QUORUM_MET",
            Self::SelfApprovalBlocked => "SELF_APPROVAL_BLOCKED",
            Self::DuplicateVoterBlocked => "DUPLICATE_VOTER_BLOCKED",
            Self::RequestNotVotable => "REQUEST_NOT_VOTABLE",
            Self::EmergencyUnlockDenied => "EMERGENCY_UNLOCK_DENIED",
            Self::EmergencyUnlock => "EMERGENCY_UNLOCK",
            Self::AutoRelock => "AUTO_RELOCK",
            Self::Cancelled => "CANCELLED",
            Self::Conflict => "CONFLICT",
            Self::NotFound => "NOT_FOUND",
            Self::AuditWriteFailed => "AUDIT_WRITE_FAILED",
            Self::StorageFailure => "STORAGE_FAILURE",
            Self::InvalidConfig => "INVALID_CONFIG",
        }
    }
}

impl std::fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<ReasonCode> for String {
    fn from(code: ReasonCode) -> Self {
        code.as_str().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serde_matches_as_str() {
        for code in [
            ReasonCode::NoBranchMapping,
            ReasonCode::EnvironmentHardLocked,
            ReasonCode::RbacDenied,
            ReasonCode::Cancelled,
        ] {
            let json = serde_json::to_string(&code).unwrap();
            assert_eq!(json, format!("\"{}\"", code.as_str()));
        }
    }
}
