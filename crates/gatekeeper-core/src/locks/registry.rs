//! Environment Lock Registry: versioned lock records with audited transitions.
//!
//! Writes are visible to readers before their audit entry is appended. A
//! failed append undoes the write only if the record still holds the
//! version this call wrote.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use gatekeeper_state::{
    AuditEntry, AuditResult, EnvironmentLock, LockStore, LockType, ResourceType, ScheduledWindow,
    Versioned, WindowKind,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::overlay::{effective_lock, EffectiveLock};
use crate::audit::{AuditRecorder, SYSTEM_USER};
use crate::domain::{GovernanceError, ReasonCode, Result};
use crate::metrics::METRICS;
use crate::obs::{emit_compensation_failed, emit_lock_changed};
use crate::rbac::{Actor, AuthzDecision, Capability, PermissionMatrix};

/// Parameters of an emergency unlock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmergencyUnlock {
    pub environment_id: String,
    pub reason: String,
    pub ticket_id: String,
    pub mfa_verified: bool,
    pub auto_relock_minutes: i64,
}

/// Longest emergency unlock window (one week).
const MAX_EMERGENCY_MINUTES: i64 = 7 * 24 * 60;

type Plan = Option<(EnvironmentLock, AuditEntry)>;

/// Tracks the lock record of every environment.
pub struct LockRegistry {
    store: Arc<dyn LockStore>,
    audit: AuditRecorder,
    permissions: Arc<PermissionMatrix>,
    max_conflict_retries: u32,
}

impl LockRegistry {
    pub fn new(
        store: Arc<dyn LockStore>,
        audit: AuditRecorder,
        permissions: Arc<PermissionMatrix>,
        max_conflict_retries: u32,
    ) -> Self {
        Self {
            store,
            audit,
            permissions,
            max_conflict_retries,
        }
    }

    /// The stored record, if any.
    pub async fn get(&self, environment_id: &str) -> Result<Option<Versioned<EnvironmentLock>>> {
        Ok(self.store.get(environment_id).await?)
    }

    /// Effective lock at `now`. Unknown environments are `Unlocked`.
    pub async fn current_state(&self, environment_id: &str, now: DateTime<Utc>) -> Result<EffectiveLock> {
        let record = self.store.get(environment_id).await?;
        Ok(effective_lock(
            environment_id,
            record.as_ref().map(|v| &v.record),
            now,
        ))
    }

    /// Create the record with `default_lock_type` unless one exists.
    pub async fn ensure_initialized(
        &self,
        environment_id: &str,
        default_lock_type: LockType,
        now: DateTime<Utc>,
    ) -> Result<Versioned<EnvironmentLock>> {
        if let Some(existing) = self.store.get(environment_id).await? {
            return Ok(existing);
        }

        let created = self
            .commit(environment_id, |current| {
                if current.is_some() {
                    return Ok(None);
                }
                let lock = EnvironmentLock::new(
                    environment_id,
                    default_lock_type,
                    "initialized from branch rule",
                    SYSTEM_USER,
                    now,
                );
                let entry = lock_entry(
                    now,
                    "lock.initialized",
                    environment_id,
                    SYSTEM_USER,
                    None,
                    None,
                    json!({ "lock_type": default_lock_type }),
                );
                Ok(Some((lock, entry)))
            })
            .await?;

        match created {
            Some(stored) => {
                emit_lock_changed(environment_id, "initialized", None, default_lock_type, SYSTEM_USER);
                Ok(stored)
            }
            // Another instance created it between our read and write.
            None => self
                .store
                .get(environment_id)
                .await?
                .ok_or_else(|| GovernanceError::NotFound {
                    kind: "environment lock",
                    key: environment_id.to_string(),
                }),
        }
    }

    /// Set the manual lock type. With `auto_relock_at`, the sweep later
    /// restores the type that was in place before this call.
    pub async fn set_lock(
        &self,
        actor: &Actor,
        environment_id: &str,
        lock_type: LockType,
        reason: &str,
        auto_relock_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<Versioned<EnvironmentLock>> {
        self.require_unlock(actor, environment_id, "lock.set", now).await?;

        let mut previous = None;
        let stored = self
            .commit(environment_id, |current| {
                previous = current.map(|v| v.record.lock_type);
                let mut next = match current {
                    Some(v) => v.record.clone(),
                    None => EnvironmentLock::new(environment_id, lock_type, reason, &actor.user_id, now),
                };
                next.lock_type = lock_type;
                next.reason = reason.to_string();
                next.set_by = actor.user_id.clone();
                next.set_at = now;
                next.auto_relock_at = auto_relock_at;
                next.relock_to = auto_relock_at.map(|_| previous.unwrap_or(LockType::Unlocked));
                next.emergency_override_until = None;
                next.ticket_id = None;

                let entry = lock_entry(
                    now,
                    "lock.set",
                    environment_id,
                    &actor.user_id,
                    Some(actor),
                    None,
                    json!({
                        "from": previous,
                        "to": lock_type,
                        "reason": reason,
                        "auto_relock_at": auto_relock_at,
                    }),
                );
                Ok(Some((next, entry)))
            })
            .await?
            .ok_or_else(|| GovernanceError::NotFound {
                kind: "environment lock",
                key: environment_id.to_string(),
            })?;

        emit_lock_changed(environment_id, "set", previous, lock_type, &actor.user_id);
        Ok(stored)
    }

    /// Break-glass unlock. Suppresses scheduled windows and schedules a
    /// relock to the manual type in effect before the unlock.
    pub async fn emergency_unlock(
        &self,
        actor: &Actor,
        request: &EmergencyUnlock,
        now: DateTime<Utc>,
    ) -> Result<Versioned<EnvironmentLock>> {
        let environment_id = request.environment_id.as_str();
        let refusal = if !request.mfa_verified {
            Some("multi-factor verification required")
        } else if request.reason.trim().is_empty() {
            Some("a reason is required")
        } else if request.ticket_id.trim().is_empty() {
            Some("a ticket id is required")
        } else if !(1..=MAX_EMERGENCY_MINUTES).contains(&request.auto_relock_minutes) {
            Some("auto relock minutes must be between 1 and 10080")
        } else {
            None
        };
        if let Some(reason) = refusal {
            self.audit
                .record(lock_entry(
                    now,
                    "lock.emergency_unlock",
                    environment_id,
                    &actor.user_id,
                    Some(actor),
                    Some((AuditResult::Denied, ReasonCode::EmergencyUnlockDenied)),
                    json!({ "refusal": reason, "ticket_id": request.ticket_id }),
                ))
                .await?;
            return Err(GovernanceError::EmergencyUnlockDenied {
                environment: environment_id.to_string(),
                reason: reason.to_string(),
            });
        }
        self.require_unlock(actor, environment_id, "lock.emergency_unlock", now)
            .await?;

        let relock_at = now + Duration::minutes(request.auto_relock_minutes);
        let mut previous = None;
        let stored = self
            .commit(environment_id, |current| {
                previous = current.map(|v| v.record.lock_type);
                // Only the manual type is restored; windows apply again
                // through the overlay once the override ends.
                let restore = match current {
                    Some(v) if v.record.lock_type.is_locked() => v.record.lock_type,
                    // Already inside a timed unlock: keep its relock target.
                    Some(v) => v.record.relock_to.unwrap_or(LockType::Unlocked),
                    None => LockType::Unlocked,
                };
                let mut next = match current {
                    Some(v) => v.record.clone(),
                    None => EnvironmentLock::new(
                        environment_id,
                        LockType::Unlocked,
                        &request.reason,
                        &actor.user_id,
                        now,
                    ),
                };
                next.lock_type = LockType::Unlocked;
                next.reason = request.reason.clone();
                next.set_by = actor.user_id.clone();
                next.set_at = now;
                next.auto_relock_at = Some(relock_at);
                next.relock_to = Some(restore);
                next.emergency_override_until = Some(relock_at);
                next.ticket_id = Some(request.ticket_id.clone());

                let entry = lock_entry(
                    now,
                    "lock.emergency_unlock",
                    environment_id,
                    &actor.user_id,
                    Some(actor),
                    Some((AuditResult::Success, ReasonCode::EmergencyUnlock)),
                    json!({
                        "from": previous,
                        "relock_to": restore,
                        "auto_relock_at": relock_at,
                        "ticket_id": request.ticket_id,
                        "reason": request.reason,
                    }),
                );
                Ok(Some((next, entry)))
            })
            .await?
            .ok_or_else(|| GovernanceError::NotFound {
                kind: "environment lock",
                key: environment_id.to_string(),
            })?;

        tracing::warn!(
            event = "lock.emergency_unlock",
            environment = %environment_id,
            user_id = %actor.user_id,
            ticket_id = %request.ticket_id,
            relock_at = %relock_at,
        );
        emit_lock_changed(environment_id, "emergency_unlock", previous, LockType::Unlocked, &actor.user_id);
        Ok(stored)
    }

    /// Add a scheduled window. Creates an unlocked record if none exists.
    pub async fn schedule_lock(
        &self,
        actor: &Actor,
        environment_id: &str,
        kind: WindowKind,
        lock_type: LockType,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<ScheduledWindow> {
        validate_window(&kind)?;
        self.require_unlock(actor, environment_id, "lock.schedule_added", now)
            .await?;

        let window = ScheduledWindow::new(kind, lock_type, reason);
        self.commit(environment_id, |current| {
            let mut next = match current {
                Some(v) => v.record.clone(),
                None => EnvironmentLock::new(
                    environment_id,
                    LockType::Unlocked,
                    "created for scheduled window",
                    &actor.user_id,
                    now,
                ),
            };
            next.scheduled_windows.push(window.clone());
            let entry = lock_entry(
                now,
                "lock.schedule_added",
                environment_id,
                &actor.user_id,
                Some(actor),
                None,
                json!({ "window": window }),
            );
            Ok(Some((next, entry)))
        })
        .await?;

        tracing::info!(
            event = "lock.schedule_added",
            environment = %environment_id,
            window_id = %window.id,
            lock_type = %lock_type,
        );
        Ok(window)
    }

    /// Environments whose `auto_relock_at` has passed.
    pub async fn due_for_relock(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        Ok(self
            .store
            .list()
            .await?
            .into_iter()
            .filter(|v| v.record.auto_relock_at.is_some_and(|t| t <= now))
            .map(|v| v.record.environment_id)
            .collect())
    }

    /// Restore the relock target of one environment if it is due.
    ///
    /// Returns `None` when there was nothing to do, so a repeated or
    /// concurrent sweep never writes or audits twice.
    pub async fn relock(
        &self,
        environment_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Versioned<EnvironmentLock>>> {
        let mut transition = None;
        let stored = self
            .commit(environment_id, |current| {
                let Some(current) = current else {
                    return Ok(None);
                };
                if !current.record.auto_relock_at.is_some_and(|t| t <= now) {
                    return Ok(None);
                }
                let from = current.record.lock_type;
                let to = current.record.relock_to.unwrap_or(from);
                transition = Some((from, to));

                let mut next = current.record.clone();
                next.lock_type = to;
                next.reason = "automatic relock".to_string();
                next.set_by = SYSTEM_USER.to_string();
                next.set_at = now;
                next.auto_relock_at = None;
                next.relock_to = None;
                next.emergency_override_until = None;
                next.ticket_id = None;

                let entry = lock_entry(
                    now,
                    "lock.auto_relock",
                    environment_id,
                    SYSTEM_USER,
                    None,
                    Some((AuditResult::Success, ReasonCode::AutoRelock)),
                    json!({ "from": from, "to": to }),
                );
                Ok(Some((next, entry)))
            })
            .await?;

        if let (Some(_), Some((from, to))) = (&stored, transition) {
            emit_lock_changed(environment_id, "auto_relock", Some(from), to, SYSTEM_USER);
        }
        Ok(stored)
    }

    /// Relock every due environment, stopping at the first failure.
    pub async fn relock_due(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut relocked = 0;
        for environment_id in self.due_for_relock(now).await? {
            if self.relock(&environment_id, now).await?.is_some() {
                relocked += 1;
            }
        }
        Ok(relocked)
    }

    async fn require_unlock(
        &self,
        actor: &Actor,
        environment_id: &str,
        action: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        match self
            .permissions
            .authorize(actor.role, environment_id, Capability::Unlock)
        {
            AuthzDecision::Allowed => Ok(()),
            AuthzDecision::Denied { reason_code, reason } => {
                self.audit
                    .record(lock_entry(
                        now,
                        action,
                        environment_id,
                        &actor.user_id,
                        Some(actor),
                        Some((AuditResult::Denied, reason_code)),
                        json!({ "denied": reason }),
                    ))
                    .await?;
                Err(GovernanceError::Authorization {
                    role: actor.role,
                    environment: environment_id.to_string(),
                    capability: Capability::Unlock,
                })
            }
        }
    }

    /// Read, plan, conditionally write, then audit. Retries on version
    /// conflicts. If the audit append fails the write is undone.
    ///
    /// `plan` returning `None` means nothing to write; `Ok(None)` is returned.
    async fn commit<F>(&self, environment_id: &str, mut plan: F) -> Result<Option<Versioned<EnvironmentLock>>>
    where
        F: FnMut(Option<&Versioned<EnvironmentLock>>) -> Result<Plan>,
    {
        let attempts = self.max_conflict_retries + 1;
        for attempt in 1..=attempts {
            let current = self.store.get(environment_id).await?;
            let Some((next, entry)) = plan(current.as_ref())? else {
                return Ok(None);
            };
            let expected = current.as_ref().map(|v| v.version);
            let stored = match self.store.put(next, expected).await {
                Ok(stored) => stored,
                Err(e) if e.is_conflict() => {
                    METRICS.inc_conflicts();
                    tracing::debug!(
                        event = "lock.write_conflict",
                        environment = %environment_id,
                        attempt = attempt,
                    );
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            if let Err(err) = self.audit.record(entry).await {
                self.compensate(current, &stored).await;
                return Err(err);
            }
            return Ok(Some(stored));
        }
        Err(GovernanceError::Conflict {
            resource: format!("environment lock {environment_id}"),
            attempts,
        })
    }

    async fn compensate(
        &self,
        previous: Option<Versioned<EnvironmentLock>>,
        written: &Versioned<EnvironmentLock>,
    ) {
        let environment_id = &written.record.environment_id;
        let undo = match previous {
            Some(prev) => self
                .store
                .put(prev.record, Some(written.version))
                .await
                .map(|_| ()),
            None => self.store.remove(environment_id, written.version).await,
        };
        if let Err(e) = undo {
            emit_compensation_failed(environment_id, &e);
        }
    }
}

fn validate_window(kind: &WindowKind) -> Result<()> {
    match kind {
        WindowKind::Range { start, end } if start >= end => Err(GovernanceError::InvalidConfig(
            "scheduled window must end after it starts".to_string(),
        )),
        WindowKind::Recurring { weekdays, .. } if weekdays.is_empty() => Err(
            GovernanceError::InvalidConfig("recurring window needs at least one weekday".to_string()),
        ),
        _ => Ok(()),
    }
}

fn lock_entry(
    now: DateTime<Utc>,
    action: &str,
    environment_id: &str,
    user_id: &str,
    actor: Option<&Actor>,
    outcome: Option<(AuditResult, ReasonCode)>,
    details: serde_json::Value,
) -> AuditEntry {
    let (result, reason_code) = match outcome {
        Some((result, code)) => (result, Some(code.to_string())),
        None => (AuditResult::Success, None),
    };
    AuditEntry::new(
        now,
        action,
        ResourceType::EnvironmentLock,
        environment_id,
        user_id,
        actor.map(|a| a.role),
        result,
        reason_code,
        details,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use gatekeeper_state::fakes::{MemoryAuditStore, MemoryLockStore};
    use gatekeeper_state::Role;

    fn registry() -> (LockRegistry, Arc<MemoryAuditStore>) {
        let audit = Arc::new(MemoryAuditStore::new());
        let permissions = PermissionMatrix::new()
            .grant("*", Role::Admin, Capability::ALL)
            .grant("*", Role::Developer, [Capability::View, Capability::Deploy]);
        let registry = LockRegistry::new(
            Arc::new(MemoryLockStore::new()),
            AuditRecorder::new(audit.clone(), 50),
            Arc::new(permissions),
            3,
        );
        (registry, audit)
    }

    #[tokio::test]
    async fn test_set_lock_requires_unlock_capability() {
        let (registry, audit) = registry();
        let dev = Actor::new("dave", Role::Developer);
        let err = registry
            .set_lock(&dev, "production", LockType::Unlocked, "ship it", None, Utc::now())
            .await
            .unwrap_err();

        assert!(matches!(err, GovernanceError::Authorization { .. }));
        assert_eq!(audit.len(), 1);
        assert!(registry.get("production").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_ensure_initialized_only_once() {
        let (registry, audit) = registry();
        let now = Utc::now();
        let a = registry.ensure_initialized("production", LockType::HardLocked, now).await.unwrap();
        let b = registry.ensure_initialized("production", LockType::Unlocked, now).await.unwrap();

        assert_eq!(a, b);
        assert_eq!(b.record.lock_type, LockType::HardLocked);
        assert_eq!(audit.len(), 1);
    }

    #[tokio::test]
    async fn test_emergency_unlock_without_mfa_denied() {
        let (registry, audit) = registry();
        let admin = Actor::new("root", Role::Admin);
        let err = registry
            .emergency_unlock(
                &admin,
                &EmergencyUnlock {
                    environment_id: "production".to_string(),
                    reason: "outage".to_string(),
                    ticket_id: "INC-1".to_string(),
                    mfa_verified: false,
                    auto_relock_minutes: 30,
                },
                Utc::now(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, GovernanceError::EmergencyUnlockDenied { .. }));
        assert_eq!(audit.len(), 1);
    }

    #[tokio::test]
    async fn test_relock_is_idempotent() {
        let (registry, audit) = registry();
        let admin = Actor::new("root", Role::Admin);
        let now = Utc::now();
        registry
            .ensure_initialized("production", LockType::HardLocked, now)
            .await
            .unwrap();
        registry
            .emergency_unlock(
                &admin,
                &EmergencyUnlock {
                    environment_id: "production".to_string(),
                    reason: "outage".to_string(),
                    ticket_id: "INC-1".to_string(),
                    mfa_verified: true,
                    auto_relock_minutes: 15,
                },
                now,
            )
            .await
            .unwrap();

        let later = now + Duration::minutes(16);
        assert_eq!(registry.relock_due(later).await.unwrap(), 1);
        assert_eq!(registry.relock_due(later).await.unwrap(), 0);

        let state = registry.current_state("production", later).await.unwrap();
        assert_eq!(state.lock_type, LockType::HardLocked);
        // initialized, emergency unlock, one relock
        assert_eq!(audit.len(), 3);
    }
}
