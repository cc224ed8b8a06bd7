//! Periodic maintenance pass.
//!
//! Re-locks environments whose emergency or timed unlock ran out, expires
//! approval requests past their deadline and re-sends notifications that
//! failed at creation. Every step is a conditional write, so several engine
//! instances may sweep the same stores.

use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};

use chrono::{DateTime, Utc};
use gatekeeper_state::ApprovalStatus;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::approvals::{is_expired_at, ApprovalEngine};
use crate::locks::LockRegistry;
use crate::metrics::METRICS;
use crate::obs::emit_sweep_completed;

/// Counts from one sweep pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub relocked: usize,
    pub expired: usize,
    pub renotified: usize,
    /// Items skipped because of an error; they are retried next pass.
    pub errors: usize,
}

/// Runs sweep passes against a lock registry and an approval engine.
#[derive(Clone)]
pub struct Sweeper {
    locks: Arc<LockRegistry>,
    approvals: Arc<ApprovalEngine>,
    interval: StdDuration,
}

impl Sweeper {
    pub fn new(locks: Arc<LockRegistry>, approvals: Arc<ApprovalEngine>, interval_secs: u64) -> Self {
        Self {
            locks,
            approvals,
            interval: StdDuration::from_secs(interval_secs.max(1)),
        }
    }

    /// One pass at `now`. Failures on single items are logged and counted,
    /// never aborting the pass.
    pub async fn run_once(&self, now: DateTime<Utc>) -> SweepReport {
        let started = Instant::now();
        let mut report = SweepReport::default();

        match self.locks.due_for_relock(now).await {
            Ok(due) => {
                for environment_id in due {
                    match self.locks.relock(&environment_id, now).await {
                        Ok(Some(_)) => report.relocked += 1,
                        Ok(None) => {}
                        Err(e) => {
                            report.errors += 1;
                            tracing::warn!(event = "sweep.relock_failed", environment = %environment_id, error = %e);
                        }
                    }
                }
            }
            Err(e) => {
                report.errors += 1;
                tracing::warn!(event = "sweep.list_locks_failed", error = %e);
            }
        }

        match self.approvals.list_open().await {
            Ok(open) => {
                for stored in open {
                    let id = stored.record.id;
                    if is_expired_at(&stored.record, now) {
                        match self.approvals.expire_if_due(stored, now).await {
                            Ok(v) if v.record.status == ApprovalStatus::Expired => report.expired += 1,
                            Ok(_) => {}
                            Err(e) => {
                                report.errors += 1;
                                tracing::warn!(event = "sweep.expire_failed", request_id = %id, error = %e);
                            }
                        }
                    } else if stored.record.status == ApprovalStatus::Pending {
                        match self.approvals.notify(stored, now).await {
                            Ok(v) if v.record.status == ApprovalStatus::Notified => report.renotified += 1,
                            Ok(_) => {}
                            Err(e) => {
                                report.errors += 1;
                                tracing::warn!(event = "sweep.notify_failed", request_id = %id, error = %e);
                            }
                        }
                    }
                }
            }
            Err(e) => {
                report.errors += 1;
                tracing::warn!(event = "sweep.list_approvals_failed", error = %e);
            }
        }

        METRICS.inc_sweeps();
        emit_sweep_completed(&report, started.elapsed().as_millis() as u64);
        report
    }

    /// Sweep on a fixed interval until `shutdown` flips to `true` or its
    /// sender is dropped.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.run_once(Utc::now()).await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            tracing::info!(event = "sweep.stopped");
                            break;
                        }
                    }
                }
            }
        })
    }
}
