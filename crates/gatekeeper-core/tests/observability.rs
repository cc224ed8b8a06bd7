//! Observability tests for governance tracing.
//!
//! These tests verify that structured tracing events are emitted for the
//! decision lifecycle, lock changes, votes and sweeps.

use std::sync::Arc;

use chrono::Utc;
use gatekeeper_core::{
    emit_approval_transition, emit_decision, emit_lock_changed, emit_sweep_completed,
    emit_vote_cast, ApprovalId, ApprovalStatus, BranchRule, Capability, DecisionSpan,
    DeploymentRequest, GovernanceConfig, GovernanceDecision, GovernanceEngine, LockType,
    LogNotifier, PermissionMatrix, Role, Stores, SweepReport, VoteDecision,
};
use tracing_test::traced_test;

#[traced_test]
#[test]
fn emit_decision_logs_reason_code() {
    let request = DeploymentRequest::new("main", "abc123", "alice", Role::Developer);
    let _span = DecisionSpan::enter(&request);
    emit_decision(&request, &GovernanceDecision::allowed("staging"), 4);

    assert!(logs_contain("governance.decision"));
    assert!(logs_contain("ALLOWED"));
}

#[traced_test]
#[test]
fn emit_lock_changed_logs_transition() {
    emit_lock_changed("production", "set", Some(LockType::HardLocked), LockType::Unlocked, "root");

    assert!(logs_contain("lock.changed"));
    assert!(logs_contain("hard_locked"));
}

#[traced_test]
#[test]
fn emit_vote_and_transition_events() {
    let id = ApprovalId::new();
    emit_vote_cast(&id, "olga", Role::Operator, VoteDecision::Approve);
    emit_approval_transition(&id, ApprovalStatus::Voting, ApprovalStatus::Approved);

    assert!(logs_contain("approval.vote_cast"));
    assert!(logs_contain("approval.transition"));
    assert!(logs_contain(&id.to_string()));
}

#[traced_test]
#[test]
fn emit_sweep_completed_logs_counts() {
    let report = SweepReport {
        relocked: 2,
        expired: 1,
        renotified: 0,
        errors: 0,
    };
    emit_sweep_completed(&report, 12);

    assert!(logs_contain("sweep.completed"));
    assert!(logs_contain("relocked=2"));
}

#[traced_test]
#[tokio::test]
async fn decide_emits_span_and_event() {
    let config = GovernanceConfig {
        branch_rules: vec![BranchRule::new("feature/*", "development")],
        permissions: PermissionMatrix::new().grant(
            "*",
            Role::Developer,
            [Capability::View, Capability::Deploy],
        ),
        ..GovernanceConfig::default()
    };
    let engine = GovernanceEngine::new(config, Stores::in_memory(), Arc::new(LogNotifier)).unwrap();
    let request = DeploymentRequest::new("feature/obs", "cafe01", "dave", Role::Developer);

    engine.decide(&request, Utc::now()).await.unwrap();

    assert!(logs_contain("gatekeeper.decide"));
    assert!(logs_contain("cafe01"));
    assert!(logs_contain("lock.changed"));
}
