//! Effective lock state: scheduled windows overlaid on the manual state.
//!
//! Everything here is pure in `(record, now)` so the same instant always
//! yields the same answer.

use chrono::{DateTime, Datelike, Utc};
use gatekeeper_state::{EnvironmentLock, LockType, ScheduledWindow, WindowKind};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Where the effective lock type came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LockSource {
    /// No record exists for the environment.
    Default,
    Manual,
    /// An emergency unlock is suppressing scheduled windows.
    EmergencyOverride,
    Window { window_id: Uuid },
}

/// Lock state of an environment at one instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectiveLock {
    pub environment_id: String,
    pub lock_type: LockType,
    pub reason: String,
    pub source: LockSource,
}

impl EffectiveLock {
    pub fn is_hard_locked(&self) -> bool {
        self.lock_type == LockType::HardLocked
    }
}

/// Whether a window applies at `now`.
pub fn window_active(window: &ScheduledWindow, now: DateTime<Utc>) -> bool {
    match &window.kind {
        WindowKind::Range { start, end } => *start <= now && now < *end,
        WindowKind::Recurring {
            weekdays,
            start_time,
            end_time,
        } => {
            let t = now.time();
            let day = now.weekday();
            if start_time < end_time {
                weekdays.contains(&day) && *start_time <= t && t < *end_time
            } else {
                // Spans midnight: the early-morning tail belongs to the previous day.
                (weekdays.contains(&day) && *start_time <= t)
                    || (weekdays.contains(&day.pred()) && t < *end_time)
            }
        }
    }
}

/// Compute the effective lock for an environment.
///
/// An active emergency override pins the manual state. Otherwise the most
/// restrictive active window replaces the manual state; among equally
/// restrictive windows the first declared wins.
pub fn effective_lock(
    environment_id: &str,
    record: Option<&EnvironmentLock>,
    now: DateTime<Utc>,
) -> EffectiveLock {
    let Some(record) = record else {
        return EffectiveLock {
            environment_id: environment_id.to_string(),
            lock_type: LockType::Unlocked,
            reason: String::new(),
            source: LockSource::Default,
        };
    };

    if record.emergency_override_until.is_some_and(|until| now < until) {
        return EffectiveLock {
            environment_id: record.environment_id.clone(),
            lock_type: record.lock_type,
            reason: record.reason.clone(),
            source: LockSource::EmergencyOverride,
        };
    }

    let strictest = record
        .scheduled_windows
        .iter()
        .filter(|w| window_active(w, now))
        .reduce(|best, w| if w.lock_type > best.lock_type { w } else { best });

    match strictest {
        Some(window) => EffectiveLock {
            environment_id: record.environment_id.clone(),
            lock_type: window.lock_type,
            reason: window.reason.clone(),
            source: LockSource::Window {
                window_id: window.id,
            },
        },
        None => EffectiveLock {
            environment_id: record.environment_id.clone(),
            lock_type: record.lock_type,
            reason: record.reason.clone(),
            source: LockSource::Manual,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, NaiveTime, TimeZone, Weekday};

    // 2026-03-06 is a Friday.
    fn friday(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 6, h, m, 0).unwrap()
    }

    fn record(lock_type: LockType) -> EnvironmentLock {
        EnvironmentLock::new("production", lock_type, "manual", "ops", friday(0, 0))
    }

    fn freeze() -> ScheduledWindow {
        ScheduledWindow::new(
            WindowKind::Recurring {
                weekdays: vec![Weekday::Fri],
                start_time: NaiveTime::from_hms_opt(22, 0, 0).unwrap(),
                end_time: NaiveTime::from_hms_opt(6, 0, 0).unwrap(),
            },
            LockType::HardLocked,
            "weekend freeze",
        )
    }

    #[test]
    fn test_unknown_environment_is_unlocked() {
        let e = effective_lock("qa", None, friday(12, 0));
        assert_eq!(e.lock_type, LockType::Unlocked);
        assert_eq!(e.source, LockSource::Default);
    }

    #[test]
    fn test_range_is_half_open() {
        let mut r = record(LockType::Unlocked);
        r.scheduled_windows.push(ScheduledWindow::new(
            WindowKind::Range {
                start: friday(10, 0),
                end: friday(11, 0),
            },
            LockType::SoftLocked,
            "release review",
        ));
        assert_eq!(effective_lock("production", Some(&r), friday(10, 0)).lock_type, LockType::SoftLocked);
        assert_eq!(effective_lock("production", Some(&r), friday(11, 0)).lock_type, LockType::Unlocked);
    }

    #[test]
    fn test_recurring_window_spans_midnight() {
        let mut r = record(LockType::Unlocked);
        r.scheduled_windows.push(freeze());
        assert!(effective_lock("production", Some(&r), friday(23, 0)).is_hard_locked());
        assert!(effective_lock("production", Some(&r), friday(23, 0) + Duration::hours(4)).is_hard_locked());
        assert!(!effective_lock("production", Some(&r), friday(21, 59)).is_hard_locked());
        assert!(!effective_lock("production", Some(&r), friday(23, 0) + Duration::hours(8)).is_hard_locked());
    }

    #[test]
    fn test_most_restrictive_window_wins() {
        let mut r = record(LockType::Unlocked);
        let span = WindowKind::Range {
            start: friday(9, 0),
            end: friday(17, 0),
        };
        r.scheduled_windows.push(ScheduledWindow::new(span.clone(), LockType::SoftLocked, "soft"));
        r.scheduled_windows.push(ScheduledWindow::new(span, LockType::HardLocked, "hard"));
        let e = effective_lock("production", Some(&r), friday(12, 0));
        assert_eq!(e.lock_type, LockType::HardLocked);
        assert_eq!(e.reason, "hard");
    }

    #[test]
    fn test_emergency_override_suppresses_windows() {
        let mut r = record(LockType::Unlocked);
        r.scheduled_windows.push(freeze());
        r.emergency_override_until = Some(friday(23, 30));
        let e = effective_lock("production", Some(&r), friday(23, 0));
        assert_eq!(e.lock_type, LockType::Unlocked);
        assert_eq!(e.source, LockSource::EmergencyOverride);
        assert!(effective_lock("production", Some(&r), friday(23, 30)).is_hard_locked());
    }

    #[test]
    fn test_overlay_is_idempotent() {
        let mut r = record(LockType::SoftLocked);
        r.scheduled_windows.push(freeze());
        let now = friday(22, 30);
        assert_eq!(
            effective_lock("production", Some(&r), now),
            effective_lock("production", Some(&r), now)
        );
    }
}
