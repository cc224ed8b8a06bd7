//! Environment locks through the engine: manual changes, break-glass
//! unlocks, scheduled windows and automatic relock by the sweep.

use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveTime, TimeZone, Utc, Weekday};
use gatekeeper_core::{
    Actor, AuditFilter, AuditResult, BranchRule, Capability, DecisionStatus, DeploymentRequest,
    EmergencyUnlock, GovernanceConfig, GovernanceEngine, GovernanceError, LockSource, LockType,
    LogNotifier, PermissionMatrix, ReasonCode, Role, Stores, WindowKind,
};

fn engine() -> GovernanceEngine {
    let config = GovernanceConfig {
        branch_rules: vec![BranchRule::new("main", "production").with_lock_type(LockType::HardLocked)],
        permissions: PermissionMatrix::new()
            .grant("*", Role::Admin, Capability::ALL)
            .grant("*", Role::Operator, [Capability::View, Capability::Deploy]),
        ..GovernanceConfig::default()
    };
    GovernanceEngine::new(config, Stores::in_memory(), Arc::new(LogNotifier)).unwrap()
}

fn admin() -> Actor {
    Actor::new("root", Role::Admin)
}

/// Friday 2026-03-06 14:00 UTC.
fn friday_afternoon() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 6, 14, 0, 0).unwrap()
}

fn break_glass(minutes: i64) -> EmergencyUnlock {
    EmergencyUnlock {
        environment_id: "production".to_string(),
        reason: "payment outage hotfix".to_string(),
        ticket_id: "INC-4411".to_string(),
        mfa_verified: true,
        auto_relock_minutes: minutes,
    }
}

async fn count(engine: &GovernanceEngine, action: &str) -> usize {
    engine
        .query_audit(AuditFilter {
            action: Some(action.to_string()),
            ..AuditFilter::default()
        })
        .collect()
        .await
        .unwrap()
        .len()
}

// ── Manual locks ──

#[tokio::test]
async fn operator_cannot_change_locks() {
    let engine = engine();
    let now = friday_afternoon();

    let err = engine
        .set_lock(&Actor::new("olga", Role::Operator), "production", LockType::Unlocked, "please", None, now)
        .await
        .unwrap_err();
    assert!(matches!(err, GovernanceError::Authorization { .. }));

    let denials = engine
        .query_audit(AuditFilter {
            action: Some("lock.set".to_string()),
            ..AuditFilter::default()
        })
        .collect()
        .await
        .unwrap();
    assert_eq!(denials.len(), 1);
    assert_eq!(denials[0].result, AuditResult::Denied);
}

#[tokio::test]
async fn timed_unlock_is_restored_by_sweep() {
    let engine = engine();
    let now = friday_afternoon();
    let request = DeploymentRequest::new("main", "abc", "olga", Role::Operator);
    engine.decide(&request, now).await.unwrap();

    let until = now + Duration::minutes(30);
    engine
        .set_lock(&admin(), "production", LockType::Unlocked, "deploy window", Some(until), now)
        .await
        .unwrap();
    assert_eq!(
        engine.decide(&request, now).await.unwrap().status,
        DecisionStatus::Allowed
    );

    let report = engine.sweeper().run_once(until).await;
    assert_eq!(report.relocked, 1);
    assert_eq!(
        engine.lock_state("production", until).await.unwrap().lock_type,
        LockType::HardLocked
    );

    // A second pass has nothing left to do.
    assert_eq!(engine.sweeper().run_once(until).await.relocked, 0);
    assert_eq!(count(&engine, "lock.auto_relock").await, 1);
}

// ── Emergency unlock ──

#[tokio::test]
async fn emergency_unlock_requires_mfa_and_ticket() {
    let engine = engine();
    let now = friday_afternoon();

    let mut no_mfa = break_glass(60);
    no_mfa.mfa_verified = false;
    let err = engine.emergency_unlock(&admin(), &no_mfa, now).await.unwrap_err();
    assert_eq!(err.reason_code(), ReasonCode::EmergencyUnlockDenied);

    let mut no_ticket = break_glass(60);
    no_ticket.ticket_id = "  ".to_string();
    assert!(engine.emergency_unlock(&admin(), &no_ticket, now).await.is_err());

    assert!(engine.emergency_unlock(&admin(), &break_glass(0), now).await.is_err());
    assert!(engine
        .emergency_unlock(&admin(), &break_glass(7 * 24 * 60 + 1), now)
        .await
        .is_err());

    let entries = engine
        .query_audit(AuditFilter {
            action: Some("lock.emergency_unlock".to_string()),
            ..AuditFilter::default()
        })
        .collect()
        .await
        .unwrap();
    assert_eq!(entries.len(), 4);
    assert!(entries.iter().all(|e| e.result == AuditResult::Denied));
}

#[tokio::test]
async fn emergency_unlock_overrides_windows_then_relocks() {
    let engine = engine();
    let now = friday_afternoon();
    engine
        .set_lock(&admin(), "production", LockType::HardLocked, "default", None, now)
        .await
        .unwrap();
    engine
        .schedule_lock(
            &admin(),
            "production",
            WindowKind::Range {
                start: now - Duration::hours(1),
                end: now + Duration::hours(5),
            },
            LockType::HardLocked,
            "quarter close",
            now,
        )
        .await
        .unwrap();

    let unlocked = engine
        .emergency_unlock(&admin(), &break_glass(60), now)
        .await
        .unwrap();
    assert_eq!(unlocked.record.ticket_id.as_deref(), Some("INC-4411"));

    let state = engine.lock_state("production", now).await.unwrap();
    assert_eq!(state.lock_type, LockType::Unlocked);
    assert_eq!(state.source, LockSource::EmergencyOverride);

    let later = now + Duration::minutes(61);
    assert_eq!(engine.sweeper().run_once(later).await.relocked, 1);
    let relocked = engine.lock_state("production", later).await.unwrap();
    assert_eq!(relocked.lock_type, LockType::HardLocked);
}

#[tokio::test]
async fn emergency_unlock_inside_window_restores_manual_unlocked_state() {
    let engine = engine();
    let now = friday_afternoon();
    engine
        .set_lock(&admin(), "production", LockType::Unlocked, "open", None, now)
        .await
        .unwrap();
    let window = engine
        .schedule_lock(
            &admin(),
            "production",
            WindowKind::Recurring {
                weekdays: vec![Weekday::Fri],
                start_time: NaiveTime::from_hms_opt(12, 0, 0).unwrap(),
                end_time: NaiveTime::from_hms_opt(18, 0, 0).unwrap(),
            },
            LockType::HardLocked,
            "no friday deploys",
            now,
        )
        .await
        .unwrap();

    let unlocked = engine
        .emergency_unlock(&admin(), &break_glass(30), now)
        .await
        .unwrap();
    assert_eq!(unlocked.record.relock_to, Some(LockType::Unlocked));

    // The freeze is still running after the relock.
    let later = now + Duration::minutes(31);
    assert_eq!(engine.sweeper().run_once(later).await.relocked, 1);
    let state = engine.lock_state("production", later).await.unwrap();
    assert_eq!(state.lock_type, LockType::HardLocked);
    assert_eq!(state.source, LockSource::Window { window_id: window.id });

    // Monday 2026-03-09 10:00 UTC: no window, manual state is unlocked again.
    let monday = Utc.with_ymd_and_hms(2026, 3, 9, 10, 0, 0).unwrap();
    let state = engine.lock_state("production", monday).await.unwrap();
    assert_eq!(state.lock_type, LockType::Unlocked);
    assert_eq!(state.source, LockSource::Manual);

    let request = DeploymentRequest::new("main", "abc", "olga", Role::Operator);
    assert_eq!(
        engine.decide(&request, monday).await.unwrap().status,
        DecisionStatus::Allowed
    );
}

// ── Scheduled windows ──

#[tokio::test]
async fn friday_freeze_window_locks_only_while_active() {
    let engine = engine();
    let now = friday_afternoon();
    engine
        .set_lock(&admin(), "production", LockType::Unlocked, "open", None, now)
        .await
        .unwrap();
    let window = engine
        .schedule_lock(
            &admin(),
            "production",
            WindowKind::Recurring {
                weekdays: vec![Weekday::Fri],
                start_time: NaiveTime::from_hms_opt(12, 0, 0).unwrap(),
                end_time: NaiveTime::from_hms_opt(18, 0, 0).unwrap(),
            },
            LockType::HardLocked,
            "no friday deploys",
            now,
        )
        .await
        .unwrap();

    let request = DeploymentRequest::new("main", "abc", "olga", Role::Operator);
    let blocked = engine.decide(&request, now).await.unwrap();
    assert_eq!(blocked.reason_code, ReasonCode::EnvironmentHardLocked);
    let state = engine.lock_state("production", now).await.unwrap();
    assert_eq!(state.source, LockSource::Window { window_id: window.id });

    let evening = now + Duration::hours(5);
    assert_eq!(
        engine.decide(&request, evening).await.unwrap().status,
        DecisionStatus::Allowed
    );
}

#[tokio::test]
async fn inverted_range_window_is_rejected() {
    let engine = engine();
    let now = friday_afternoon();
    let err = engine
        .schedule_lock(
            &admin(),
            "production",
            WindowKind::Range {
                start: now,
                end: now - Duration::hours(1),
            },
            LockType::HardLocked,
            "backwards",
            now,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, GovernanceError::InvalidConfig(_)));
}
