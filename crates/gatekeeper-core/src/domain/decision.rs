//! Deployment requests and the verdicts the engine returns for them.

use gatekeeper_state::{ApprovalId, ApprovalStatus, Role};
use serde::{Deserialize, Serialize};

use super::error::{GovernanceError, Result};
use super::reason::ReasonCode;
use crate::rbac::Capability;

/// A proposed deployment as submitted by the CI runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentRequest {
    pub branch: String,
    pub commit_sha: String,
    /// Set when the commit is tagged; enables tagged-only branch rules.
    #[serde(default)]
    pub tag: Option<String>,
    pub requesting_user_id: String,
    pub requesting_role: Role,
}

impl DeploymentRequest {
    pub fn new(
        branch: impl Into<String>,
        commit_sha: impl Into<String>,
        requesting_user_id: impl Into<String>,
        requesting_role: Role,
    ) -> Self {
        Self {
            branch: branch.into(),
            commit_sha: commit_sha.into(),
            tag: None,
            requesting_user_id: requesting_user_id.into(),
            requesting_role,
        }
    }

    /// Mark the request as a tagged ref (builder pattern).
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn is_tagged(&self) -> bool {
        self.tag.is_some()
    }
}

/// Verdict kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionStatus {
    Allowed,
    Blocked,
    PendingApproval,
}

/// The final verdict for one deployment request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GovernanceDecision {
    pub status: DecisionStatus,
    /// Target environment, when the branch resolved to one.
    pub environment: Option<String>,
    pub reason_code: ReasonCode,
    pub approval_request_id: Option<ApprovalId>,
    pub approval_status: Option<ApprovalStatus>,
}

impl GovernanceDecision {
    pub fn allowed(environment: impl Into<String>) -> Self {
        Self {
            status: DecisionStatus::Allowed,
            environment: Some(environment.into()),
            reason_code: ReasonCode::Allowed,
            approval_request_id: None,
            approval_status: None,
        }
    }

    pub fn blocked(environment: Option<String>, reason_code: ReasonCode) -> Self {
        Self {
            status: DecisionStatus::Blocked,
            environment,
            reason_code,
            approval_request_id: None,
            approval_status: None,
        }
    }

    pub fn pending(
        environment: impl Into<String>,
        request_id: ApprovalId,
        status: ApprovalStatus,
    ) -> Self {
        let reason_code = match status {
            ApprovalStatus::Rejected => ReasonCode::ApprovalRejected,
            _ => ReasonCode::ApprovalRequired,
        };
        Self {
            status: DecisionStatus::PendingApproval,
            environment: Some(environment.into()),
            reason_code,
            approval_request_id: Some(request_id),
            approval_status: Some(status),
        }
    }

    pub fn is_allowed(&self) -> bool {
        self.status == DecisionStatus::Allowed
    }

    /// Convert a non-`Allowed` verdict for `request` into the matching typed
    /// error so a caller can short-circuit with `?`.
    pub fn into_result(self, request: &DeploymentRequest) -> Result<Self> {
        match self.status {
            DecisionStatus::Allowed => Ok(self),
            DecisionStatus::PendingApproval => match (self.approval_request_id, self.approval_status) {
                (Some(request_id), Some(status)) => {
                    Err(GovernanceError::ApprovalRequired { request_id, status })
                }
                _ => Err(GovernanceError::InvalidConfig(
                    "pending decision without approval request".to_string(),
                )),
            },
            DecisionStatus::Blocked => {
                let environment = self.environment.clone().unwrap_or_default();
                Err(match self.reason_code {
                    ReasonCode::EnvironmentHardLocked => {
                        GovernanceError::LockViolation { environment }
                    }
                    ReasonCode::NoBranchMapping => GovernanceError::Configuration(format!(
                        "no branch rule matches {}",
                        request.branch
                    )),
                    ReasonCode::RbacDenied => GovernanceError::Authorization {
                        role: request.requesting_role,
                        environment,
                        capability: Capability::Deploy,
                    },
                    other => GovernanceError::InvalidConfig(format!(
                        "blocked on {environment}: {other}"
                    )),
                })
            }
        }
    }
}
