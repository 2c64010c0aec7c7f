//! Rolling-window spend and rate budgets per agent.
//!
//! Windows reset lazily on the next access once more than an hour (actions)
//! or a day (spend) has elapsed; there is no background timer. Recording
//! never rejects, so callers must check before acting.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::clock::{Clock, SystemClock};
use crate::obs;
use crate::verdict::PolicyDecision;

/// Static budget limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CostBudget {
    pub max_cost_per_day_cents: u64,
    pub max_actions_per_hour: u64,
    pub max_tool_iterations: u32,
    pub alert_threshold_percent: u8,
}

impl Default for CostBudget {
    fn default() -> Self {
        Self {
            max_cost_per_day_cents: 5000,
            max_actions_per_hour: 200,
            max_tool_iterations: 25,
            alert_threshold_percent: 80,
        }
    }
}

impl CostBudget {
    fn alert_threshold_cents(&self) -> f64 {
        self.max_cost_per_day_cents as f64 * f64::from(self.alert_threshold_percent) / 100.0
    }
}

/// Mutable usage counters for one agent.
#[derive(Debug, Clone, PartialEq)]
pub struct UsageRecord {
    pub cost_cents: f64,
    pub actions_this_hour: u64,
    pub hour_start: DateTime<Utc>,
    pub day_start: DateTime<Utc>,
    pub alerted: bool,
}

impl UsageRecord {
    fn starting_at(now: DateTime<Utc>) -> Self {
        Self {
            cost_cents: 0.0,
            actions_this_hour: 0,
            hour_start: now,
            day_start: now,
            alerted: false,
        }
    }

    fn roll_windows(&mut self, now: DateTime<Utc>) {
        if now - self.hour_start > Duration::hours(1) {
            self.actions_this_hour = 0;
            self.hour_start = now;
        }
        if now - self.day_start > Duration::days(1) {
            self.cost_cents = 0.0;
            self.day_start = now;
            self.alerted = false;
        }
    }
}

/// Point-in-time usage report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageSnapshot {
    pub agent_id: String,
    pub cost_cents: f64,
    pub budget_cents: u64,
    pub actions_this_hour: u64,
    pub max_actions_per_hour: u64,
    pub budget_remaining_pct: f64,
    pub alerted: bool,
}

/// Enforces daily spend, hourly action and per-task iteration limits.
#[derive(Debug)]
pub struct CostGuard {
    budget: CostBudget,
    overrides: DashMap<String, CostBudget>,
    usage: DashMap<String, UsageRecord>,
    clock: Arc<dyn Clock>,
}

impl Default for CostGuard {
    fn default() -> Self {
        Self::new(CostBudget::default())
    }
}

impl CostGuard {
    /// Guard on the system clock.
    pub fn new(budget: CostBudget) -> Self {
        Self::with_clock(budget, Arc::new(SystemClock))
    }

    /// Guard whose windows roll on `clock`; tests pass a [`crate::clock::ManualClock`].
    pub fn with_clock(budget: CostBudget, clock: Arc<dyn Clock>) -> Self {
        info!(
            max_cost_per_day_cents = budget.max_cost_per_day_cents,
            max_actions_per_hour = budget.max_actions_per_hour,
            max_tool_iterations = budget.max_tool_iterations,
            "cost guard initialized"
        );
        Self {
            budget,
            overrides: DashMap::new(),
            usage: DashMap::new(),
            clock,
        }
    }

    /// The default budget.
    pub fn budget(&self) -> CostBudget {
        self.budget
    }

    /// Budget in force for `agent_id`.
    pub fn budget_for(&self, agent_id: &str) -> CostBudget {
        self.overrides
            .get(agent_id)
            .map(|b| *b.value())
            .unwrap_or(self.budget)
    }

    /// Override the default budget for one agent.
    pub fn set_budget(&self, agent_id: &str, budget: CostBudget) {
        info!(agent_id = %agent_id, max_cost_per_day_cents = budget.max_cost_per_day_cents, "budget override set");
        self.overrides.insert(agent_id.to_string(), budget);
    }

    /// Deny once the daily spend or hourly action cap is reached.
    ///
    /// Rolls expired windows first. Crossing the alert threshold emits one
    /// `budget.alert` per daily window; the decision stays `allowed`.
    pub fn check_budget(&self, agent_id: &str) -> PolicyDecision {
        let budget = self.budget_for(agent_id);
        let now = self.clock.now();
        let mut record = self
            .usage
            .entry(agent_id.to_string())
            .or_insert_with(|| UsageRecord::starting_at(now));
        record.roll_windows(now);

        if record.cost_cents >= budget.max_cost_per_day_cents as f64 {
            let reason = format!(
                "Daily budget exhausted ({:.0}¢ / {}¢)",
                record.cost_cents, budget.max_cost_per_day_cents
            );
            warn!(agent_id = %agent_id, reason = %reason, "budget check denied");
            return PolicyDecision::deny(reason);
        }

        if record.actions_this_hour >= budget.max_actions_per_hour {
            let reason = format!(
                "Hourly action limit reached ({} / {})",
                record.actions_this_hour, budget.max_actions_per_hour
            );
            warn!(agent_id = %agent_id, reason = %reason, "budget check denied");
            return PolicyDecision::deny(reason);
        }

        if !record.alerted && record.cost_cents >= budget.alert_threshold_cents() {
            record.alerted = true;
            obs::emit_budget_alert(
                agent_id,
                budget.alert_threshold_percent,
                record.cost_cents,
                budget.max_cost_per_day_cents,
            );
        }

        PolicyDecision::allow("within_budget")
    }

    /// Deny when `iteration` exceeds the agent's per-task cap.
    pub fn check_iterations(&self, agent_id: &str, iteration: u32) -> PolicyDecision {
        let limit = self.budget_for(agent_id).max_tool_iterations;
        if iteration > limit {
            warn!(agent_id = %agent_id, iteration, limit, "iteration limit exceeded");
            return PolicyDecision::deny(format!(
                "Iteration limit exceeded ({iteration} > {limit})"
            ));
        }
        PolicyDecision::allow("within_limit")
    }

    /// Add spend. Non-finite or negative amounts are ignored.
    pub fn record_cost(&self, agent_id: &str, cost_cents: f64) {
        if !cost_cents.is_finite() || cost_cents < 0.0 {
            warn!(agent_id = %agent_id, cost_cents, "ignoring invalid cost record");
            return;
        }
        self.with_record(agent_id, |r| r.cost_cents += cost_cents);
    }

    /// Count one action against the hourly window.
    pub fn record_action(&self, agent_id: &str) {
        self.with_record(agent_id, |r| r.actions_this_hour += 1);
    }

    /// Current usage after rolling expired windows.
    pub fn get_usage(&self, agent_id: &str) -> UsageSnapshot {
        let budget = self.budget_for(agent_id);
        let record = self.with_record(agent_id, |r| r.clone());
        let cap = budget.max_cost_per_day_cents.max(1) as f64;
        UsageSnapshot {
            agent_id: agent_id.to_string(),
            cost_cents: record.cost_cents,
            budget_cents: budget.max_cost_per_day_cents,
            actions_this_hour: record.actions_this_hour,
            max_actions_per_hour: budget.max_actions_per_hour,
            budget_remaining_pct: (100.0 * (1.0 - record.cost_cents / cap)).max(0.0),
            alerted: record.alerted,
        }
    }

    /// Drop all usage for an agent.
    pub fn reset(&self, agent_id: &str) {
        self.usage.remove(agent_id);
    }

    fn with_record<T>(&self, agent_id: &str, f: impl FnOnce(&mut UsageRecord) -> T) -> T {
        let now = self.clock.now();
        let mut record = self
            .usage
            .entry(agent_id.to_string())
            .or_insert_with(|| UsageRecord::starting_at(now));
        record.roll_windows(now);
        f(record.value_mut())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn guard(budget: CostBudget) -> (Arc<ManualClock>, CostGuard) {
        let clock = Arc::new(ManualClock::default());
        let guard = CostGuard::with_clock(budget, clock.clone());
        (clock, guard)
    }

    #[test]
    fn test_daily_budget_exhausted() {
        let (_clock, guard) = guard(CostBudget {
            max_cost_per_day_cents: 100,
            ..CostBudget::default()
        });
        assert!(guard.check_budget("a").allowed);
        guard.record_cost("a", 150.0);
        let d = guard.check_budget("a");
        assert!(!d.allowed);
        assert_eq!(d.reason, "Daily budget exhausted (150¢ / 100¢)");
    }

    #[test]
    fn test_hourly_limit_resets_after_window() {
        let (clock, guard) = guard(CostBudget {
            max_actions_per_hour: 3,
            ..CostBudget::default()
        });
        for _ in 0..3 {
            guard.record_action("a");
        }
        assert_eq!(guard.check_budget("a").reason, "Hourly action limit reached (3 / 3)");

        // Exactly one hour is not yet "more than" an hour.
        clock.advance(Duration::hours(1));
        assert!(!guard.check_budget("a").allowed);

        clock.advance(Duration::seconds(1));
        assert!(guard.check_budget("a").allowed);
        assert!(guard.check_budget("a").allowed);
        assert_eq!(guard.get_usage("a").actions_this_hour, 0);
    }

    #[test]
    fn test_daily_window_resets_cost_and_alert() {
        let (clock, guard) = guard(CostBudget {
            max_cost_per_day_cents: 100,
            ..CostBudget::default()
        });
        guard.record_cost("a", 90.0);
        assert!(guard.check_budget("a").allowed);
        assert!(guard.get_usage("a").alerted);

        clock.advance(Duration::days(1) + Duration::seconds(1));
        let usage = guard.get_usage("a");
        assert_eq!(usage.cost_cents, 0.0);
        assert!(!usage.alerted);
    }

    #[test]
    fn test_alert_latches_once() {
        let (_clock, guard) = guard(CostBudget {
            max_cost_per_day_cents: 100,
            alert_threshold_percent: 50,
            ..CostBudget::default()
        });
        guard.record_cost("a", 40.0);
        guard.check_budget("a");
        assert!(!guard.get_usage("a").alerted);
        guard.record_cost("a", 20.0);
        assert!(guard.check_budget("a").allowed);
        assert!(guard.get_usage("a").alerted);
        assert!(guard.check_budget("a").allowed);
    }

    #[test]
    fn test_agents_are_isolated() {
        let (_clock, guard) = guard(CostBudget {
            max_cost_per_day_cents: 10,
            ..CostBudget::default()
        });
        guard.record_cost("spender", 50.0);
        assert!(!guard.check_budget("spender").allowed);
        assert!(guard.check_budget("saver").allowed);
    }

    #[test]
    fn test_iteration_limit() {
        let (_clock, guard) = guard(CostBudget::default());
        assert_eq!(guard.check_iterations("a", 25).reason, "within_limit");
        assert_eq!(
            guard.check_iterations("a", 26).reason,
            "Iteration limit exceeded (26 > 25)"
        );
    }

    #[test]
    fn test_budget_override_and_reset() {
        let (_clock, guard) = guard(CostBudget::default());
        guard.set_budget(
            "tight",
            CostBudget {
                max_cost_per_day_cents: 1,
                ..CostBudget::default()
            },
        );
        guard.record_cost("tight", 1.0);
        guard.record_cost("loose", 1.0);
        assert!(!guard.check_budget("tight").allowed);
        assert!(guard.check_budget("loose").allowed);

        guard.reset("tight");
        assert!(guard.check_budget("tight").allowed);
    }

    #[test]
    fn test_invalid_cost_ignored_and_snapshot() {
        let (_clock, guard) = guard(CostBudget::default());
        guard.record_cost("a", -5.0);
        guard.record_cost("a", f64::NAN);
        guard.record_cost("a", 2500.0);
        let usage = guard.get_usage("a");
        assert_eq!(usage.cost_cents, 2500.0);
        assert_eq!(usage.budget_cents, 5000);
        assert!((usage.budget_remaining_pct - 50.0).abs() < 1e-9);
    }
}
