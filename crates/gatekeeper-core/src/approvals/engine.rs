//! Approval Workflow Engine: persists requests and drives their state machine.
//!
//! Every mutation is one conditional write followed by exactly one audit
//! entry. Lost races are retried from a fresh read.
//!
//! The state write lands before its audit entry. Until the entry is
//! appended, a concurrent reader such as `decide` may observe the new
//! status; if the append fails the write is undone. The undo is itself
//! conditioned on the version this call wrote, so it never overwrites a
//! later writer. When it loses that race the request keeps the newer state
//! and `audit.compensation_failed` is logged.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use gatekeeper_state::{
    ApprovalId, ApprovalRequest, ApprovalStatus, ApprovalStore, ApprovalVote, AuditEntry,
    AuditResult, LockType, Resolution, ResourceType, Role, Versioned, VoteDecision,
};
use serde_json::json;

use super::notification::{NotificationEvent, NotificationSink};
use super::workflow::{admit_vote, evaluate, is_expired_at, qualifying_approvals};
use crate::audit::{AuditRecorder, SYSTEM_USER};
use crate::branch_rules::BranchRule;
use crate::config::ApprovalSettings;
use crate::domain::{GovernanceError, ReasonCode, Result};
use crate::metrics::METRICS;
use crate::obs::{emit_approval_transition, emit_compensation_failed, emit_vote_cast};
use crate::rbac::{Actor, AuthzDecision, Capability, PermissionMatrix};

/// Upper bound on request lifetime (ten years).
const MAX_TTL_SECS: u64 = 10 * 365 * 86_400;

/// What a deployment context needs before it may proceed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalContext {
    pub environment: String,
    pub commit_sha: String,
    pub requested_by: String,
    pub required_approvals: u32,
    pub required_roles: BTreeSet<Role>,
}

impl ApprovalContext {
    /// Requirements for a deployment matched by `rule`, or `None` when
    /// neither the rule nor the effective lock demands sign-off.
    ///
    /// Rule requirements take precedence; a soft lock alone falls back to the
    /// configured defaults.
    pub fn for_rule(
        rule: &BranchRule,
        lock_type: LockType,
        settings: &ApprovalSettings,
        commit_sha: &str,
        requested_by: &str,
    ) -> Option<Self> {
        let (required_approvals, required_roles) = if rule.requires_approval {
            (rule.required_approvers, rule.required_roles.clone())
        } else if lock_type == LockType::SoftLocked {
            (
                settings.soft_lock_required_approvals,
                settings.soft_lock_required_roles.clone(),
            )
        } else {
            return None;
        };
        Some(Self {
            environment: rule.environment.clone(),
            commit_sha: commit_sha.to_string(),
            requested_by: requested_by.to_string(),
            required_approvals,
            required_roles,
        })
    }
}

/// Outcome of planning one write.
enum Plan {
    /// Write `next`, record `entry`, then return `Ok` or the deferred error.
    Write {
        next: ApprovalRequest,
        entry: AuditEntry,
        fail_after: Option<GovernanceError>,
    },
    /// Nothing to write.
    Keep,
}

/// Runs approval requests through `Pending -> Notified -> Voting -> terminal`.
pub struct ApprovalEngine {
    store: Arc<dyn ApprovalStore>,
    audit: AuditRecorder,
    notifier: Arc<dyn NotificationSink>,
    permissions: Arc<PermissionMatrix>,
    settings: ApprovalSettings,
    max_conflict_retries: u32,
}

impl ApprovalEngine {
    pub fn new(
        store: Arc<dyn ApprovalStore>,
        audit: AuditRecorder,
        notifier: Arc<dyn NotificationSink>,
        permissions: Arc<PermissionMatrix>,
        settings: ApprovalSettings,
        max_conflict_retries: u32,
    ) -> Self {
        Self {
            store,
            audit,
            notifier,
            permissions,
            settings,
            max_conflict_retries,
        }
    }

    pub fn settings(&self) -> &ApprovalSettings {
        &self.settings
    }

    /// Return the live request for this context, creating one if needed.
    ///
    /// Idempotent per `(environment, commit_sha)`. An expired request is
    /// superseded by a fresh one; a rejected request is returned as is.
    pub async fn open_or_get(
        &self,
        context: &ApprovalContext,
        now: DateTime<Utc>,
    ) -> Result<Versioned<ApprovalRequest>> {
        let attempts = self.max_conflict_retries + 1;
        for _ in 0..attempts {
            let (stored, created) = self
                .store
                .create_or_get(self.new_request(context, now))
                .await?;

            if created {
                let entry = approval_entry(
                    now,
                    "approval.created",
                    &stored.record,
                    &context.requested_by,
                    None,
                    (AuditResult::Pending, ReasonCode::ApprovalRequired),
                    json!({
                        "environment": context.environment,
                        "commit_sha": context.commit_sha,
                        "required_approvals": context.required_approvals,
                        "required_roles": context.required_roles,
                        "expires_at": stored.record.expires_at,
                    }),
                );
                if let Err(err) = self.audit.record(entry).await {
                    if let Err(e) = self.store.discard(&stored.record.id, stored.version).await {
                        emit_compensation_failed(&stored.record.id.to_string(), &e);
                    }
                    return Err(err);
                }
                tracing::info!(
                    event = "approval.created",
                    request_id = %stored.record.id,
                    environment = %context.environment,
                    commit_sha = %context.commit_sha,
                );
                return self.notify(stored, now).await;
            }

            let current = self.expire_if_due(stored, now).await?;
            if current.record.status != ApprovalStatus::Expired {
                return Ok(current);
            }
            // Expired: the next create_or_get supersedes it.
        }
        Err(GovernanceError::Conflict {
            resource: format!("approval {}@{}", context.environment, context.commit_sha),
            attempts,
        })
    }

    /// Read a request, expiring it first if its deadline passed.
    pub async fn get(&self, id: &ApprovalId, now: DateTime<Utc>) -> Result<Versioned<ApprovalRequest>> {
        let stored = self.load(id).await?;
        self.expire_if_due(stored, now).await
    }

    /// Latest request for a deployment context, with lazy expiry.
    pub async fn find(
        &self,
        environment: &str,
        commit_sha: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Versioned<ApprovalRequest>>> {
        match self.store.find_latest(environment, commit_sha).await? {
            Some(stored) => Ok(Some(self.expire_if_due(stored, now).await?)),
            None => Ok(None),
        }
    }

    /// Cast a vote. Vote application and status computation are one
    /// conditional write.
    pub async fn cast_vote(
        &self,
        id: &ApprovalId,
        voter: &Actor,
        decision: VoteDecision,
        comment: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Versioned<ApprovalRequest>> {
        let current = self.load(id).await?;
        if let Err(err) = self.require_approve(voter, &current.record.environment) {
            self.record_denial(&current.record, voter, "approval.vote_cast", &err, now)
                .await?;
            return Err(err);
        }

        let vote = ApprovalVote {
            user_id: voter.user_id.clone(),
            role: voter.role,
            decision,
            comment,
            cast_at: now,
        };

        let mut transition = None;
        let outcome = self
            .commit(id, |current| {
                let request = &current.record;
                if is_expired_at(request, now) {
                    transition = Some((request.status, ApprovalStatus::Expired));
                    return Ok(Plan::Write {
                        next: expired(request, now),
                        entry: expiry_entry(request, now),
                        fail_after: Some(GovernanceError::ApprovalExpired {
                            request_id: request.id,
                        }),
                    });
                }
                admit_vote(request, &vote)?;

                let mut next = request.clone();
                next.votes.push(vote.clone());
                let status = evaluate(&next);
                next.status = status;
                transition = Some((request.status, status));

                let (action, result, code) = match status {
                    ApprovalStatus::Approved => {
                        ("approval.approved", AuditResult::Success, ReasonCode::ApprovalQuorumMet)
                    }
                    ApprovalStatus::Rejected => {
                        ("approval.rejected", AuditResult::Blocked, ReasonCode::ApprovalRejected)
                    }
                    _ => ("approval.vote_cast", AuditResult::Pending, ReasonCode::ApprovalRequired),
                };
                if status.is_terminal() {
                    next.resolution = Some(Resolution {
                        reason_code: code.to_string(),
                        resolved_by: Some(vote.user_id.clone()),
                        resolved_at: now,
                    });
                }
                let entry = approval_entry(
                    now,
                    action,
                    &next,
                    &vote.user_id,
                    Some(vote.role),
                    (result, code),
                    json!({
                        "decision": vote.decision,
                        "comment": vote.comment,
                        "from": request.status,
                        "to": status,
                        "qualifying_approvals": qualifying_approvals(&next),
                        "required_approvals": next.required_approvals,
                    }),
                );
                Ok(Plan::Write {
                    next,
                    entry,
                    fail_after: None,
                })
            })
            .await;

        match outcome {
            Ok(stored) => {
                METRICS.inc_votes();
                emit_vote_cast(id, &voter.user_id, voter.role, decision);
                if let Some((from, to)) = transition.filter(|(from, to)| from != to) {
                    emit_approval_transition(id, from, to);
                }
                Ok(stored)
            }
            Err(err @ GovernanceError::ApprovalExpired { .. }) => {
                if let Some((from, to)) = transition {
                    emit_approval_transition(id, from, to);
                }
                Err(err)
            }
            Err(
                err @ (GovernanceError::SelfApprovalBlocked { .. }
                | GovernanceError::DuplicateVoterBlocked { .. }
                | GovernanceError::RequestNotVotable { .. }),
            ) => {
                let latest = self.load(id).await?;
                self.record_denial(&latest.record, voter, "approval.vote_cast", &err, now)
                    .await?;
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    pub async fn approve(
        &self,
        id: &ApprovalId,
        voter: &Actor,
        comment: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Versioned<ApprovalRequest>> {
        self.cast_vote(id, voter, VoteDecision::Approve, comment, now).await
    }

    /// Veto the request. A rejection always carries an explanation.
    pub async fn reject(
        &self,
        id: &ApprovalId,
        voter: &Actor,
        comment: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<Versioned<ApprovalRequest>> {
        self.cast_vote(id, voter, VoteDecision::Reject, Some(comment.into()), now)
            .await
    }

    pub async fn request_changes(
        &self,
        id: &ApprovalId,
        voter: &Actor,
        comment: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<Versioned<ApprovalRequest>> {
        self.cast_vote(id, voter, VoteDecision::RequestChanges, Some(comment.into()), now)
            .await
    }

    /// Administratively close an open request as `Rejected` with `CANCELLED`.
    pub async fn cancel(
        &self,
        id: &ApprovalId,
        actor: &Actor,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Versioned<ApprovalRequest>> {
        let current = self.load(id).await?;
        if let Err(err) = self.require_approve(actor, &current.record.environment) {
            self.record_denial(&current.record, actor, "approval.cancelled", &err, now)
                .await?;
            return Err(err);
        }

        let mut from = None;
        let stored = self
            .commit(id, |current| {
                let request = &current.record;
                if request.status.is_terminal() {
                    return Err(GovernanceError::RequestNotVotable {
                        request_id: request.id,
                        status: request.status,
                    });
                }
                from = Some(request.status);
                let mut next = request.clone();
                next.status = ApprovalStatus::Rejected;
                next.resolution = Some(Resolution {
                    reason_code: ReasonCode::Cancelled.to_string(),
                    resolved_by: Some(actor.user_id.clone()),
                    resolved_at: now,
                });
                let entry = approval_entry(
                    now,
                    "approval.cancelled",
                    &next,
                    &actor.user_id,
                    Some(actor.role),
                    (AuditResult::Blocked, ReasonCode::Cancelled),
                    json!({ "from": request.status, "reason": reason }),
                );
                Ok(Plan::Write {
                    next,
                    entry,
                    fail_after: None,
                })
            })
            .await?;

        if let Some(from) = from {
            emit_approval_transition(id, from, ApprovalStatus::Rejected);
        }
        Ok(stored)
    }

    /// Commit `Expired` if the request is open and past its deadline.
    /// Requests that are not due are returned unchanged, so lazy reads and
    /// the sweep converge on one transition.
    pub async fn expire_if_due(
        &self,
        stored: Versioned<ApprovalRequest>,
        now: DateTime<Utc>,
    ) -> Result<Versioned<ApprovalRequest>> {
        if !is_expired_at(&stored.record, now) {
            return Ok(stored);
        }
        let id = stored.record.id;
        let mut from = None;
        let stored = self
            .commit(&id, |current| {
                let request = &current.record;
                if !is_expired_at(request, now) {
                    return Ok(Plan::Keep);
                }
                from = Some(request.status);
                Ok(Plan::Write {
                    next: expired(request, now),
                    entry: expiry_entry(request, now),
                    fail_after: None,
                })
            })
            .await?;
        if let Some(from) = from {
            emit_approval_transition(&id, from, ApprovalStatus::Expired);
        }
        Ok(stored)
    }

    /// Publish a notification for a `Pending` request and move it to
    /// `Notified`. A failed publish leaves it `Pending` for the sweep.
    pub async fn notify(
        &self,
        stored: Versioned<ApprovalRequest>,
        now: DateTime<Utc>,
    ) -> Result<Versioned<ApprovalRequest>> {
        if stored.record.status != ApprovalStatus::Pending {
            return Ok(stored);
        }
        if let Err(e) = self
            .notifier
            .publish(NotificationEvent::from(&stored.record))
            .await
        {
            tracing::warn!(
                event = "approval.notify_failed",
                request_id = %stored.record.id,
                error = %e,
            );
            return Ok(stored);
        }

        let id = stored.record.id;
        let mut advanced = false;
        let stored = self
            .commit(&id, |current| {
                let request = &current.record;
                if request.status != ApprovalStatus::Pending {
                    return Ok(Plan::Keep);
                }
                advanced = true;
                let mut next = request.clone();
                next.status = ApprovalStatus::Notified;
                let entry = approval_entry(
                    now,
                    "approval.notified",
                    &next,
                    SYSTEM_USER,
                    None,
                    (AuditResult::Pending, ReasonCode::ApprovalRequired),
                    json!({ "required_roles": next.required_roles }),
                );
                Ok(Plan::Write {
                    next,
                    entry,
                    fail_after: None,
                })
            })
            .await?;
        if advanced {
            emit_approval_transition(&id, ApprovalStatus::Pending, ApprovalStatus::Notified);
        }
        Ok(stored)
    }

    /// Requests not yet terminal.
    pub async fn list_open(&self) -> Result<Vec<Versioned<ApprovalRequest>>> {
        Ok(self.store.list_open().await?)
    }

    fn new_request(&self, context: &ApprovalContext, now: DateTime<Utc>) -> ApprovalRequest {
        let ttl = self.settings.ttl_secs.min(MAX_TTL_SECS) as i64;
        ApprovalRequest {
            id: ApprovalId::new(),
            execution_ref: format!("{}@{}", context.environment, context.commit_sha),
            environment: context.environment.clone(),
            commit_sha: context.commit_sha.clone(),
            requested_by: context.requested_by.clone(),
            required_approvals: context.required_approvals,
            required_roles: context.required_roles.clone(),
            votes: Vec::new(),
            status: ApprovalStatus::Pending,
            created_at: now,
            expires_at: now + Duration::seconds(ttl),
            block_self_approval: self.settings.block_self_approval,
            require_distinct_approvers: self.settings.require_distinct_approvers,
            resolution: None,
        }
    }

    async fn load(&self, id: &ApprovalId) -> Result<Versioned<ApprovalRequest>> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| GovernanceError::NotFound {
                kind: "approval request",
                key: id.to_string(),
            })
    }

    fn require_approve(&self, actor: &Actor, environment: &str) -> Result<()> {
        match self
            .permissions
            .authorize(actor.role, environment, Capability::Approve)
        {
            AuthzDecision::Allowed => Ok(()),
            AuthzDecision::Denied { .. } => Err(GovernanceError::Authorization {
                role: actor.role,
                environment: environment.to_string(),
                capability: Capability::Approve,
            }),
        }
    }

    async fn record_denial(
        &self,
        request: &ApprovalRequest,
        actor: &Actor,
        action: &str,
        err: &GovernanceError,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let entry = approval_entry(
            now,
            action,
            request,
            &actor.user_id,
            Some(actor.role),
            (AuditResult::Denied, err.reason_code()),
            json!({ "error": err.to_string(), "status": request.status }),
        );
        self.audit.record(entry).await.map(|_| ())
    }

    /// Read, plan, conditionally write, then audit; retried on version
    /// conflicts. A failed audit append restores the previous record.
    async fn commit<F>(&self, id: &ApprovalId, mut plan: F) -> Result<Versioned<ApprovalRequest>>
    where
        F: FnMut(&Versioned<ApprovalRequest>) -> Result<Plan>,
    {
        let attempts = self.max_conflict_retries + 1;
        for attempt in 1..=attempts {
            let current = self.load(id).await?;
            let (next, entry, fail_after) = match plan(&current)? {
                Plan::Keep => return Ok(current),
                Plan::Write {
                    next,
                    entry,
                    fail_after,
                } => (next, entry, fail_after),
            };

            let stored = match self.store.update(next, current.version).await {
                Ok(stored) => stored,
                Err(e) if e.is_conflict() => {
                    METRICS.inc_conflicts();
                    tracing::debug!(
                        event = "approval.write_conflict",
                        request_id = %id,
                        attempt = attempt,
                    );
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            if let Err(err) = self.audit.record(entry).await {
                if let Err(e) = self.store.update(current.record, stored.version).await {
                    emit_compensation_failed(&id.to_string(), &e);
                }
                return Err(err);
            }
            return match fail_after {
                Some(err) => Err(err),
                None => Ok(stored),
            };
        }
        Err(GovernanceError::Conflict {
            resource: format!("approval {id}"),
            attempts,
        })
    }
}

fn expired(request: &ApprovalRequest, now: DateTime<Utc>) -> ApprovalRequest {
    let mut next = request.clone();
    next.status = ApprovalStatus::Expired;
    next.resolution = Some(Resolution {
        reason_code: ReasonCode::ApprovalExpired.to_string(),
        resolved_by: None,
        resolved_at: now,
    });
    next
}

fn expiry_entry(request: &ApprovalRequest, now: DateTime<Utc>) -> AuditEntry {
    approval_entry(
        now,
        "approval.expired",
        request,
        SYSTEM_USER,
        None,
        (AuditResult::Blocked, ReasonCode::ApprovalExpired),
        json!({ "from": request.status, "expires_at": request.expires_at }),
    )
}

fn approval_entry(
    now: DateTime<Utc>,
    action: &str,
    request: &ApprovalRequest,
    user_id: &str,
    role: Option<Role>,
    (result, code): (AuditResult, ReasonCode),
    details: serde_json::Value,
) -> AuditEntry {
    AuditEntry::new(
        now,
        action,
        ResourceType::ApprovalRequest,
        request.id.to_string(),
        user_id,
        role,
        result,
        Some(code.to_string()),
        details,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approvals::notification::LogNotifier;
    use gatekeeper_state::fakes::{MemoryApprovalStore, MemoryAuditStore};

    fn engine() -> (ApprovalEngine, Arc<MemoryAuditStore>) {
        let audit = Arc::new(MemoryAuditStore::new());
        let permissions = PermissionMatrix::new()
            .grant("*", Role::Operator, [Capability::Approve])
            .grant("*", Role::Admin, Capability::ALL);
        let engine = ApprovalEngine::new(
            Arc::new(MemoryApprovalStore::new()),
            AuditRecorder::new(audit.clone(), 50),
            Arc::new(LogNotifier),
            Arc::new(permissions),
            ApprovalSettings::default(),
            3,
        );
        (engine, audit)
    }

    fn context() -> ApprovalContext {
        ApprovalContext {
            environment: "staging".to_string(),
            commit_sha: "abc123".to_string(),
            requested_by: "dev".to_string(),
            required_approvals: 1,
            required_roles: BTreeSet::from([Role::Operator]),
        }
    }

    #[tokio::test]
    async fn test_open_notifies_and_is_idempotent() {
        let (engine, audit) = engine();
        let now = Utc::now();
        let first = engine.open_or_get(&context(), now).await.unwrap();
        assert_eq!(first.record.status, ApprovalStatus::Notified);

        let again = engine.open_or_get(&context(), now).await.unwrap();
        assert_eq!(again.record.id, first.record.id);
        // created + notified
        assert_eq!(audit.len(), 2);
    }

    #[tokio::test]
    async fn test_vote_requires_approve_capability() {
        let (engine, _) = engine();
        let now = Utc::now();
        let request = engine.open_or_get(&context(), now).await.unwrap();
        let viewer = Actor::new("vic", Role::Viewer);

        let err = engine
            .approve(&request.record.id, &viewer, None, now)
            .await
            .unwrap_err();
        assert!(matches!(err, GovernanceError::Authorization { .. }));
    }

    #[tokio::test]
    async fn test_vote_after_deadline_commits_expiry() {
        let (engine, _) = engine();
        let now = Utc::now();
        let request = engine.open_or_get(&context(), now).await.unwrap();
        let late = request.record.expires_at + Duration::seconds(1);
        let op = Actor::new("olga", Role::Operator);

        let err = engine
            .approve(&request.record.id, &op, None, late)
            .await
            .unwrap_err();
        assert!(matches!(err, GovernanceError::ApprovalExpired { .. }));

        let stored = engine.get(&request.record.id, late).await.unwrap();
        assert_eq!(stored.record.status, ApprovalStatus::Expired);
    }

    #[tokio::test]
    async fn test_cancel_rejects_with_cancelled() {
        let (engine, _) = engine();
        let now = Utc::now();
        let request = engine.open_or_get(&context(), now).await.unwrap();
        let admin = Actor::new("root", Role::Admin);

        let cancelled = engine
            .cancel(&request.record.id, &admin, "superseded", now)
            .await
            .unwrap();
        assert_eq!(cancelled.record.status, ApprovalStatus::Rejected);
        assert_eq!(
            cancelled.record.resolution.unwrap().reason_code,
            "CANCELLED"
        );
    }

    #[test]
    fn test_soft_lock_falls_back_to_defaults() {
        let rule = BranchRule::new("main", "staging");
        let settings = ApprovalSettings::default();
        assert!(ApprovalContext::for_rule(&rule, LockType::Unlocked, &settings, "abc", "dev").is_none());

        let ctx = ApprovalContext::for_rule(&rule, LockType::SoftLocked, &settings, "abc", "dev").unwrap();
        assert_eq!(ctx.required_approvals, 1);
        assert!(ctx.required_roles.contains(&Role::Approver));
    }
}
