//! Structured observability hooks for governance events.
//!
//! This module provides:
//! - Decision-scoped tracing spans via the `DecisionSpan` RAII guard
//! - Emission functions for decisions, lock changes, votes, approval
//!   transitions and sweeps
//!
//! Events are emitted at `info!` level (filter with `GATEKEEPER_LOG` or
//! `RUST_LOG`). They complement the audit log and never replace it.

use gatekeeper_state::{ApprovalId, ApprovalStatus, LockType, Role, VoteDecision};
use tracing::info;

use crate::domain::{DeploymentRequest, GovernanceDecision};
use crate::sweep::SweepReport;

/// RAII guard that enters a decision-scoped span for one `decide()` call.
///
/// # Example
///
/// ```ignore
/// let _span = DecisionSpan::enter(&request);
/// // every event below carries branch and commit_sha
/// ```
pub struct DecisionSpan {
    _span: tracing::span::EnteredSpan,
}

impl DecisionSpan {
    pub fn enter(request: &DeploymentRequest) -> Self {
        let span = tracing::info_span!(
            "gatekeeper.decide",
            branch = %request.branch,
            commit_sha = %request.commit_sha,
            user_id = %request.requesting_user_id,
        );
        Self {
            _span: span.entered(),
        }
    }
}

/// Emit event: a deployment verdict was produced.
pub fn emit_decision(request: &DeploymentRequest, decision: &GovernanceDecision, duration_ms: u64) {
    info!(
        event = "governance.decision",
        branch = %request.branch,
        commit_sha = %request.commit_sha,
        role = %request.requesting_role,
        environment = decision.environment.as_deref().unwrap_or("-"),
        status = ?decision.status,
        reason_code = %decision.reason_code,
        duration_ms = duration_ms,
    );
}

/// Emit event: an environment's manual lock state changed.
pub fn emit_lock_changed(environment: &str, action: &str, from: Option<LockType>, to: LockType, user_id: &str) {
    info!(
        event = "lock.changed",
        environment = %environment,
        action = %action,
        from = from.map_or("none", LockType::as_str),
        to = %to,
        user_id = %user_id,
    );
}

/// Emit event: a vote was accepted.
pub fn emit_vote_cast(request_id: &ApprovalId, user_id: &str, role: Role, decision: VoteDecision) {
    info!(
        event = "approval.vote_cast",
        request_id = %request_id,
        user_id = %user_id,
        role = %role,
        decision = decision.as_str(),
    );
}

/// Emit event: an approval request changed status.
pub fn emit_approval_transition(request_id: &ApprovalId, from: ApprovalStatus, to: ApprovalStatus) {
    info!(
        event = "approval.transition",
        request_id = %request_id,
        from = %from,
        to = %to,
    );
}

/// Emit event: one sweep pass finished.
pub fn emit_sweep_completed(report: &SweepReport, duration_ms: u64) {
    info!(
        event = "sweep.completed",
        relocked = report.relocked,
        expired = report.expired,
        renotified = report.renotified,
        errors = report.errors,
        duration_ms = duration_ms,
    );
}

/// Emit event: a state write could not be undone after its audit entry
/// failed to persist (warning level).
pub fn emit_compensation_failed(resource: &str, error: &dyn std::fmt::Display) {
    tracing::warn!(event = "audit.compensation_failed", resource = %resource, error = %error);
}
