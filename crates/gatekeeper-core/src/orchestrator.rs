//! Governance Decision Orchestrator.
//!
//! Composes branch resolution, lock state, RBAC and the approval workflow
//! into one verdict per deployment request:
//!
//! 1. resolve the branch; no rule → `Blocked(NO_BRANCH_MAPPING)`
//! 2. effective lock state; `HardLocked` → `Blocked(ENVIRONMENT_HARD_LOCKED)`
//! 3. RBAC `Deploy`; denied → `Blocked(RBAC_DENIED)`
//! 4. approval needed and not yet `Approved` → `PendingApproval`
//! 5. `Allowed`
//!
//! No lock is held across steps; every call records exactly one
//! `governance.decision` audit entry.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use gatekeeper_state::fakes::{MemoryApprovalStore, MemoryAuditStore, MemoryLockStore};
use gatekeeper_state::{
    ApprovalId, ApprovalRequest, ApprovalStatus, ApprovalStore, AuditEntry, AuditFilter,
    AuditResult, AuditStore, EnvironmentLock, LockStore, LockType, ResourceType, Role,
    ScheduledWindow, Versioned, WindowKind,
};
use serde_json::json;

use crate::approvals::{ApprovalContext, ApprovalEngine, NotificationSink};
use crate::audit::{AuditQuery, AuditRecorder};
use crate::branch_rules::{BranchResolution, BranchResolver, BranchRule, RuleOverlap, TieBreak};
use crate::config::GovernanceConfig;
use crate::domain::{DecisionStatus, DeploymentRequest, GovernanceDecision, ReasonCode, Result};
use crate::locks::{EffectiveLock, EmergencyUnlock, LockRegistry};
use crate::metrics::METRICS;
use crate::obs::{emit_decision, DecisionSpan};
use crate::rbac::{Actor, AuthzDecision, Capability, PermissionMatrix};
use crate::sweep::Sweeper;

/// The three repositories the engine writes through.
#[derive(Clone)]
pub struct Stores {
    pub locks: Arc<dyn LockStore>,
    pub approvals: Arc<dyn ApprovalStore>,
    pub audit: Arc<dyn AuditStore>,
}

impl Stores {
    /// Fresh in-memory stores.
    pub fn in_memory() -> Self {
        Self {
            locks: Arc::new(MemoryLockStore::new()),
            approvals: Arc::new(MemoryApprovalStore::new()),
            audit: Arc::new(MemoryAuditStore::new()),
        }
    }
}

/// Entry point for deployment decisions and governance administration.
pub struct GovernanceEngine {
    resolver: BranchResolver,
    locks: Arc<LockRegistry>,
    approvals: Arc<ApprovalEngine>,
    audit: AuditRecorder,
    permissions: Arc<PermissionMatrix>,
    sweep_interval_secs: u64,
}

impl GovernanceEngine {
    /// Build an engine from a validated configuration.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` when the configuration does not validate.
    pub fn new(
        config: GovernanceConfig,
        stores: Stores,
        notifier: Arc<dyn NotificationSink>,
    ) -> Result<Self> {
        for warning in config.validate()? {
            tracing::warn!(event = "config.warning", warning = %warning);
        }

        let GovernanceConfig {
            engine,
            approvals,
            branch_rules,
            permissions,
        } = config;
        let (resolver, _) = BranchResolver::from_rules(branch_rules, engine.tie_break)?;
        let permissions = Arc::new(permissions);
        let audit = AuditRecorder::new(stores.audit, engine.audit_page_size);

        let locks = LockRegistry::new(
            stores.locks,
            audit.clone(),
            Arc::clone(&permissions),
            engine.max_conflict_retries,
        );
        let approvals = ApprovalEngine::new(
            stores.approvals,
            audit.clone(),
            notifier,
            Arc::clone(&permissions),
            approvals,
            engine.max_conflict_retries,
        );

        Ok(Self {
            resolver,
            locks: Arc::new(locks),
            approvals: Arc::new(approvals),
            audit,
            permissions,
            sweep_interval_secs: engine.sweep_interval_secs,
        })
    }

    /// Decide whether a deployment may proceed.
    ///
    /// Storage failures and audit failures surface as errors; a verdict is
    /// only returned once its audit entry is persisted.
    pub async fn decide(
        &self,
        request: &DeploymentRequest,
        now: DateTime<Utc>,
    ) -> Result<GovernanceDecision> {
        let _span = DecisionSpan::enter(request);
        let started = Instant::now();
        METRICS.inc_decisions();

        let decision = self.evaluate(request, now).await?;

        self.audit.record(decision_entry(request, &decision, now)).await?;
        emit_decision(request, &decision, started.elapsed().as_millis() as u64);
        Ok(decision)
    }

    async fn evaluate(&self, request: &DeploymentRequest, now: DateTime<Utc>) -> Result<GovernanceDecision> {
        let rules = self.resolver.snapshot();
        let matched = match rules.resolve_ref(&request.branch, request.is_tagged()) {
            BranchResolution::Matched(m) => m,
            BranchResolution::NoMatch => {
                return Ok(GovernanceDecision::blocked(None, ReasonCode::NoBranchMapping));
            }
        };
        let environment = matched.environment.as_str();

        self.locks
            .ensure_initialized(environment, matched.rule.lock_type, now)
            .await?;
        let lock = self.locks.current_state(environment, now).await?;
        if lock.is_hard_locked() {
            return Ok(GovernanceDecision::blocked(
                Some(environment.to_string()),
                ReasonCode::EnvironmentHardLocked,
            ));
        }

        if let AuthzDecision::Denied { reason_code, .. } =
            self.permissions
                .authorize(request.requesting_role, environment, Capability::Deploy)
        {
            return Ok(GovernanceDecision::blocked(Some(environment.to_string()), reason_code));
        }

        let context = ApprovalContext::for_rule(
            &matched.rule,
            lock.lock_type,
            self.approvals.settings(),
            &request.commit_sha,
            &request.requesting_user_id,
        );
        if let Some(context) = context {
            let approval = self.approvals.open_or_get(&context, now).await?;
            if approval.record.status != ApprovalStatus::Approved {
                return Ok(GovernanceDecision::pending(
                    environment,
                    approval.record.id,
                    approval.record.status,
                ));
            }
        }

        Ok(GovernanceDecision::allowed(environment))
    }

    // -----------------------------------------------------------------------
    // Approvals
    // -----------------------------------------------------------------------

    pub async fn approve(
        &self,
        id: &ApprovalId,
        voter: &Actor,
        comment: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Versioned<ApprovalRequest>> {
        self.approvals.approve(id, voter, comment, now).await
    }

    pub async fn reject(
        &self,
        id: &ApprovalId,
        voter: &Actor,
        comment: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<Versioned<ApprovalRequest>> {
        self.approvals.reject(id, voter, comment, now).await
    }

    pub async fn request_changes(
        &self,
        id: &ApprovalId,
        voter: &Actor,
        comment: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<Versioned<ApprovalRequest>> {
        self.approvals.request_changes(id, voter, comment, now).await
    }

    pub async fn cancel(
        &self,
        id: &ApprovalId,
        actor: &Actor,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Versioned<ApprovalRequest>> {
        self.approvals.cancel(id, actor, reason, now).await
    }

    /// Read an approval request, expiring it lazily.
    pub async fn approval(&self, id: &ApprovalId, now: DateTime<Utc>) -> Result<Versioned<ApprovalRequest>> {
        self.approvals.get(id, now).await
    }

    // -----------------------------------------------------------------------
    // Locks
    // -----------------------------------------------------------------------

    pub async fn set_lock(
        &self,
        actor: &Actor,
        environment_id: &str,
        lock_type: LockType,
        reason: &str,
        auto_relock_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<Versioned<EnvironmentLock>> {
        self.locks
            .set_lock(actor, environment_id, lock_type, reason, auto_relock_at, now)
            .await
    }

    pub async fn emergency_unlock(
        &self,
        actor: &Actor,
        request: &EmergencyUnlock,
        now: DateTime<Utc>,
    ) -> Result<Versioned<EnvironmentLock>> {
        self.locks.emergency_unlock(actor, request, now).await
    }

    pub async fn schedule_lock(
        &self,
        actor: &Actor,
        environment_id: &str,
        kind: WindowKind,
        lock_type: LockType,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<ScheduledWindow> {
        self.locks
            .schedule_lock(actor, environment_id, kind, lock_type, reason, now)
            .await
    }

    pub async fn lock_state(&self, environment_id: &str, now: DateTime<Utc>) -> Result<EffectiveLock> {
        self.locks.current_state(environment_id, now).await
    }

    // -----------------------------------------------------------------------
    // Rules, permissions, audit
    // -----------------------------------------------------------------------

    /// Pure capability check, for UIs deciding what to offer.
    pub fn authorize(&self, role: Role, environment: &str, capability: Capability) -> AuthzDecision {
        self.permissions.authorize(role, environment, capability)
    }

    /// Atomically swap in a new rule snapshot.
    pub fn replace_rules(&self, rules: Vec<BranchRule>, tie_break: TieBreak) -> Result<Vec<RuleOverlap>> {
        self.resolver.replace(rules, tie_break)
    }

    pub fn resolve(&self, branch: &str, tagged: bool) -> BranchResolution {
        self.resolver.resolve_ref(branch, tagged)
    }

    pub fn query_audit(&self, filter: AuditFilter) -> AuditQuery {
        self.audit.query(filter)
    }

    /// A sweeper sharing this engine's registry and approval engine.
    pub fn sweeper(&self) -> Sweeper {
        Sweeper::new(
            Arc::clone(&self.locks),
            Arc::clone(&self.approvals),
            self.sweep_interval_secs,
        )
    }
}

fn decision_entry(request: &DeploymentRequest, decision: &GovernanceDecision, now: DateTime<Utc>) -> AuditEntry {
    let result = match (decision.status, decision.reason_code) {
        (DecisionStatus::Allowed, _) => AuditResult::Success,
        (DecisionStatus::PendingApproval, _) => AuditResult::Pending,
        (DecisionStatus::Blocked, ReasonCode::RbacDenied) => AuditResult::Denied,
        (DecisionStatus::Blocked, _) => AuditResult::Blocked,
    };
    AuditEntry::new(
        now,
        "governance.decision",
        ResourceType::Deployment,
        request.commit_sha.clone(),
        request.requesting_user_id.clone(),
        Some(request.requesting_role),
        result,
        Some(decision.reason_code.to_string()),
        json!({
            "branch": request.branch,
            "tag": request.tag,
            "environment": decision.environment,
            "status": decision.status,
            "approval_request_id": decision.approval_request_id,
            "approval_status": decision.approval_status,
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approvals::LogNotifier;

    fn engine() -> GovernanceEngine {
        let config = GovernanceConfig {
            branch_rules: vec![BranchRule::new("feature/*", "development")],
            permissions: PermissionMatrix::new().grant(
                "development",
                Role::Developer,
                [Capability::View, Capability::Deploy],
            ),
            ..GovernanceConfig::default()
        };
        GovernanceEngine::new(config, Stores::in_memory(), Arc::new(LogNotifier)).unwrap()
    }

    #[tokio::test]
    async fn test_unmapped_branch_blocked() {
        let engine = engine();
        let request = DeploymentRequest::new("hotfix/x", "abc", "dev", Role::Developer);
        let decision = engine.decide(&request, Utc::now()).await.unwrap();
        assert_eq!(decision.status, DecisionStatus::Blocked);
        assert_eq!(decision.reason_code, ReasonCode::NoBranchMapping);
        assert_eq!(decision.environment, None);
    }

    #[tokio::test]
    async fn test_rbac_denied_blocked() {
        let engine = engine();
        let request = DeploymentRequest::new("feature/x", "abc", "vic", Role::Viewer);
        let decision = engine.decide(&request, Utc::now()).await.unwrap();
        assert_eq!(decision.reason_code, ReasonCode::RbacDenied);
    }

    #[tokio::test]
    async fn test_every_decision_audited_once() {
        let engine = engine();
        let now = Utc::now();
        let request = DeploymentRequest::new("feature/x", "abc", "dev", Role::Developer);
        engine.decide(&request, now).await.unwrap();
        engine.decide(&request, now).await.unwrap();

        let decisions = engine
            .query_audit(AuditFilter {
                action: Some("governance.decision".to_string()),
                ..AuditFilter::default()
            })
            .collect()
            .await
            .unwrap();
        assert_eq!(decisions.len(), 2);
    }
}
