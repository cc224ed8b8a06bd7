//! Approval state machine: vote admission and status evaluation.
//!
//! Pure functions over an [`ApprovalRequest`]; persistence and auditing live
//! in the engine.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use gatekeeper_state::{ApprovalRequest, ApprovalStatus, ApprovalVote, VoteDecision};

use crate::domain::{GovernanceError, Result};

/// Whether the deadline has passed on a request that is still open.
pub fn is_expired_at(request: &ApprovalRequest, now: DateTime<Utc>) -> bool {
    !request.status.is_terminal() && now > request.expires_at
}

/// Check whether `vote` may be applied.
///
/// Expiry is checked by the caller first, since it commits a transition.
///
/// # Errors
///
/// Returns `RequestNotVotable` on a terminal request,
/// `SelfApprovalBlocked` when the requester votes on their own request and
/// `DuplicateVoterBlocked` when distinct approvers are required and the
/// voter already voted.
pub fn admit_vote(request: &ApprovalRequest, vote: &ApprovalVote) -> Result<()> {
    if request.status.is_terminal() {
        return Err(GovernanceError::RequestNotVotable {
            request_id: request.id,
            status: request.status,
        });
    }

    if request.block_self_approval && vote.user_id == request.requested_by {
        return Err(GovernanceError::SelfApprovalBlocked {
            request_id: request.id,
            user_id: vote.user_id.clone(),
        });
    }

    if request.require_distinct_approvers
        && request.votes.iter().any(|v| v.user_id == vote.user_id)
    {
        return Err(GovernanceError::DuplicateVoterBlocked {
            request_id: request.id,
            user_id: vote.user_id.clone(),
        });
    }

    Ok(())
}

/// Distinct users whose approvals count toward the quorum.
///
/// Repeat approvals from one user count once, whether or not the request
/// rejects them at admission.
pub fn qualifying_approvals(request: &ApprovalRequest) -> u32 {
    let approvers: BTreeSet<&str> = request
        .votes
        .iter()
        .filter(|v| {
            v.decision == VoteDecision::Approve
                && (request.required_roles.is_empty() || request.required_roles.contains(&v.role))
        })
        .map(|v| v.user_id.as_str())
        .collect();
    u32::try_from(approvers.len()).unwrap_or(u32::MAX)
}

/// Status implied by the votes of an open request.
///
/// A single `Reject` wins over any number of approvals. Terminal requests
/// keep their status.
pub fn evaluate(request: &ApprovalRequest) -> ApprovalStatus {
    if request.status.is_terminal() {
        return request.status;
    }
    if request
        .votes
        .iter()
        .any(|v| v.decision == VoteDecision::Reject)
    {
        return ApprovalStatus::Rejected;
    }
    if qualifying_approvals(request) >= request.required_approvals.max(1) {
        return ApprovalStatus::Approved;
    }
    if request.votes.is_empty() {
        request.status
    } else {
        ApprovalStatus::Voting
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use gatekeeper_state::{ApprovalId, Role};

    fn request(required: u32, roles: &[Role]) -> ApprovalRequest {
        let now = Utc::now();
        ApprovalRequest {
            id: ApprovalId::new(),
            execution_ref: "staging@abc".to_string(),
            environment: "staging".to_string(),
            commit_sha: "abc".to_string(),
            requested_by: "dev".to_string(),
            required_approvals: required,
            required_roles: roles.iter().copied().collect(),
            votes: Vec::new(),
            status: ApprovalStatus::Notified,
            created_at: now,
            expires_at: now + Duration::hours(1),
            block_self_approval: true,
            require_distinct_approvers: true,
            resolution: None,
        }
    }

    fn vote(user: &str, role: Role, decision: VoteDecision) -> ApprovalVote {
        ApprovalVote {
            user_id: user.to_string(),
            role,
            decision,
            comment: None,
            cast_at: Utc::now(),
        }
    }

    #[test]
    fn test_quorum_of_required_roles_approves() {
        let mut r = request(2, &[Role::Admin]);
        r.votes.push(vote("a1", Role::Admin, VoteDecision::Approve));
        assert_eq!(evaluate(&r), ApprovalStatus::Voting);
        r.votes.push(vote("a2", Role::Admin, VoteDecision::Approve));
        assert_eq!(evaluate(&r), ApprovalStatus::Approved);
    }

    #[test]
    fn test_other_roles_do_not_count() {
        let mut r = request(1, &[Role::Operator]);
        r.votes.push(vote("d1", Role::Developer, VoteDecision::Approve));
        assert_eq!(evaluate(&r), ApprovalStatus::Voting);
    }

    #[test]
    fn test_single_reject_wins() {
        let mut r = request(1, &[]);
        r.votes.push(vote("a1", Role::Admin, VoteDecision::Approve));
        r.votes.push(vote("o1", Role::Operator, VoteDecision::Reject));
        assert_eq!(evaluate(&r), ApprovalStatus::Rejected);
    }

    #[test]
    fn test_request_changes_does_not_reject() {
        let mut r = request(1, &[]);
        r.votes.push(vote("o1", Role::Operator, VoteDecision::RequestChanges));
        assert_eq!(evaluate(&r), ApprovalStatus::Voting);
    }

    #[test]
    fn test_self_vote_blocked() {
        let r = request(1, &[]);
        let err = admit_vote(&r, &vote("dev", Role::Admin, VoteDecision::Approve)).unwrap_err();
        assert!(matches!(err, GovernanceError::SelfApprovalBlocked { .. }));
    }

    #[test]
    fn test_duplicate_vote_blocked() {
        let mut r = request(2, &[]);
        r.votes.push(vote("a1", Role::Admin, VoteDecision::Approve));
        let err = admit_vote(&r, &vote("a1", Role::Admin, VoteDecision::Approve)).unwrap_err();
        assert!(matches!(err, GovernanceError::DuplicateVoterBlocked { .. }));
    }

    #[test]
    fn test_repeat_approvals_count_once() {
        let mut r = request(2, &[]);
        r.require_distinct_approvers = false;
        let repeat = vote("a1", Role::Admin, VoteDecision::Approve);
        r.votes.push(repeat.clone());
        admit_vote(&r, &repeat).unwrap();
        r.votes.push(repeat);
        assert_eq!(qualifying_approvals(&r), 1);
        assert_eq!(evaluate(&r), ApprovalStatus::Voting);

        r.votes.push(vote("a2", Role::Admin, VoteDecision::Approve));
        assert_eq!(evaluate(&r), ApprovalStatus::Approved);
    }

    #[test]
    fn test_terminal_request_not_votable() {
        let mut r = request(1, &[]);
        r.status = ApprovalStatus::Approved;
        let err = admit_vote(&r, &vote("a1", Role::Admin, VoteDecision::Approve)).unwrap_err();
        assert!(matches!(err, GovernanceError::RequestNotVotable { .. }));
    }

    #[test]
    fn test_expiry_is_strictly_after_deadline() {
        let r = request(1, &[]);
        assert!(!is_expired_at(&r, r.expires_at));
        assert!(is_expired_at(&r, r.expires_at + Duration::seconds(1)));
    }
}
