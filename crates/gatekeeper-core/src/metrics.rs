//! Global atomic counters for Gatekeeper observability.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (the daemon does so on an interval and at shutdown).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lightweight atomic counters, no allocations and no locking.
pub struct Metrics {
    decisions_evaluated: AtomicU64,
    votes_cast: AtomicU64,
    conflicts_retried: AtomicU64,
    sweeps_completed: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            decisions_evaluated: AtomicU64::new(0),
            votes_cast: AtomicU64::new(0),
            conflicts_retried: AtomicU64::new(0),
            sweeps_completed: AtomicU64::new(0),
        }
    }

    pub fn inc_decisions(&self) {
        self.decisions_evaluated.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "decisions_evaluated", "counter incremented");
    }

    pub fn inc_votes(&self) {
        self.votes_cast.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "votes_cast", "counter incremented");
    }

    /// A conditional write lost a race and is being retried.
    pub fn inc_conflicts(&self) {
        self.conflicts_retried.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "conflicts_retried", "counter incremented");
    }

    pub fn inc_sweeps(&self) {
        self.sweeps_completed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "sweeps_completed", "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            decisions_evaluated = self.decisions_evaluated(),
            votes_cast = self.votes_cast(),
            conflicts_retried = self.conflicts_retried(),
            sweeps_completed = self.sweeps_completed(),
        );
    }

    pub fn decisions_evaluated(&self) -> u64 {
        self.decisions_evaluated.load(Ordering::Relaxed)
    }

    pub fn votes_cast(&self) -> u64 {
        self.votes_cast.load(Ordering::Relaxed)
    }

    pub fn conflicts_retried(&self) -> u64 {
        self.conflicts_retried.load(Ordering::Relaxed)
    }

    pub fn sweeps_completed(&self) -> u64 {
        self.sweeps_completed.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.decisions_evaluated.store(0, Ordering::Relaxed);
        self.votes_cast.store(0, Ordering::Relaxed);
        self.conflicts_retried.store(0, Ordering::Relaxed);
        self.sweeps_completed.store(0, Ordering::Relaxed);
    }
}
