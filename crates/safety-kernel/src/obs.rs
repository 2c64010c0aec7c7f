//! Structured events for the kernel's decision points.
//!
//! Every check runs inside a [`CheckSpan`] tagged with the entry point and
//! agent id, so component logs nest under the decision that caused them.

use tracing::{info, warn};

use crate::verdict::{SafetyResult, SafetyViolation};

/// RAII guard holding a check-scoped span open.
pub struct CheckSpan {
    _span: tracing::span::EnteredSpan,
}

impl CheckSpan {
    pub fn enter(entry_point: &str, agent_id: &str) -> Self {
        let span = tracing::info_span!("safety.check", entry_point = %entry_point, agent_id = %agent_id);
        Self {
            _span: span.entered(),
        }
    }
}

/// Emit event: a kernel entry point finished.
pub fn emit_check_completed(entry_point: &str, agent_id: &str, result: &SafetyResult) {
    info!(
        event = "check.completed",
        entry_point = %entry_point,
        agent_id = %agent_id,
        safe = result.is_safe(),
        violations = result.violations().len(),
    );
}

/// Emit event: one violation was recorded.
pub fn emit_violation(agent_id: &str, violation: &SafetyViolation) {
    if violation.blocked() {
        warn!(
            event = "check.violation",
            agent_id = %agent_id,
            component = %violation.component(),
            severity = %violation.severity(),
            rule = %violation.rule(),
            blocked = true,
            message = %violation.message(),
        );
    } else {
        info!(
            event = "check.violation",
            agent_id = %agent_id,
            component = %violation.component(),
            severity = %violation.severity(),
            rule = %violation.rule(),
            blocked = false,
        );
    }
}

/// Emit event: an agent crossed its spend alert threshold (latched).
pub fn emit_budget_alert(agent_id: &str, threshold_percent: u8, cost_cents: f64, cap_cents: u64) {
    warn!(
        event = "budget.alert",
        agent_id = %agent_id,
        threshold_percent = threshold_percent,
        cost_cents = cost_cents,
        cap_cents = cap_cents,
    );
}

/// Emit event: injection phrasing matched, tagged with the table revision.
pub fn emit_injection_detected(direction: &str, rules: &[&str], table_version: u32) {
    warn!(
        event = "injection.detected",
        direction = %direction,
        rules = ?rules,
        table_version = table_version,
    );
}

/// Emit event: a tool call was routed to human approval.
pub fn emit_approval_required(agent_id: &str, tool_name: &str, reason: &str) {
    info!(
        event = "approval.required",
        agent_id = %agent_id,
        tool = %tool_name,
        reason = %reason,
    );
}
