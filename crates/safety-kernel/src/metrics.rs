//! Per-kernel atomic counters.
//!
//! Counters are bumped silently on the check path. [`Metrics::flush`]
//! emits every value as one `info!` event; [`Metrics::snapshot`] hands
//! them to the caller.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Lock-free counters owned by one [`crate::SafetyKernel`].
#[derive(Debug, Default)]
pub struct Metrics {
    checks_evaluated: AtomicU64,
    checks_blocked: AtomicU64,
    violations_recorded: AtomicU64,
    approvals_requested: AtomicU64,
}

/// Counter values at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub checks_evaluated: u64,
    pub checks_blocked: u64,
    pub violations_recorded: u64,
    pub approvals_requested: u64,
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            checks_evaluated: AtomicU64::new(0),
            checks_blocked: AtomicU64::new(0),
            violations_recorded: AtomicU64::new(0),
            approvals_requested: AtomicU64::new(0),
        }
    }

    /// Count one completed check and its outcome.
    pub fn record_check(&self, blocked: bool, violations: usize) {
        self.checks_evaluated.fetch_add(1, Ordering::Relaxed);
        if blocked {
            self.checks_blocked.fetch_add(1, Ordering::Relaxed);
        }
        self.violations_recorded
            .fetch_add(violations as u64, Ordering::Relaxed);
        tracing::trace!(metric = "checks_evaluated", "counter incremented");
    }

    pub fn inc_approvals(&self) {
        self.approvals_requested.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "approvals_requested", "counter incremented");
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            checks_evaluated: self.checks_evaluated.load(Ordering::Relaxed),
            checks_blocked: self.checks_blocked.load(Ordering::Relaxed),
            violations_recorded: self.violations_recorded.load(Ordering::Relaxed),
            approvals_requested: self.approvals_requested.load(Ordering::Relaxed),
        }
    }

    /// Emit all current values as a single `info!` event.
    pub fn flush(&self) {
        let s = self.snapshot();
        tracing::info!(
            metric = "flush",
            checks_evaluated = s.checks_evaluated,
            checks_blocked = s.checks_blocked,
            violations_recorded = s.violations_recorded,
            approvals_requested = s.approvals_requested,
        );
    }

    pub fn reset(&self) {
        self.checks_evaluated.store(0, Ordering::Relaxed);
        self.checks_blocked.store(0, Ordering::Relaxed);
        self.violations_recorded.store(0, Ordering::Relaxed);
        self.approvals_requested.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_increment() {
        let m = Metrics::new();
        m.record_check(false, 0);
        m.record_check(true, 3);
        m.inc_approvals();
        assert_eq!(
            m.snapshot(),
            MetricsSnapshot {
                checks_evaluated: 2,
                checks_blocked: 1,
                violations_recorded: 3,
                approvals_requested: 1,
            }
        );
    }

    #[test]
    fn test_reset_zeroes_all() {
        let m = Metrics::new();
        m.record_check(true, 1);
        m.inc_approvals();
        m.reset();
        assert_eq!(m.snapshot().checks_evaluated, 0);
        assert_eq!(m.snapshot().approvals_requested, 0);
    }
}
