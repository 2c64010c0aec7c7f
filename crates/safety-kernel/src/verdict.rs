//! Verdict value objects shared by every safety layer.
//!
//! Policy violations are data, never errors: each check returns a
//! [`SafetyResult`], [`Decision`] or [`GatingDecision`] that the caller
//! branches on.

use serde::{Deserialize, Serialize};

/// Severity assigned to a violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Whether a finding at this severity blocks the action by default.
    pub fn blocks(self) -> bool {
        matches!(self, Self::High | Self::Critical)
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// The layer that produced a violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    Sanitizer,
    Injection,
    Validator,
    Policy,
    LeakDetector,
    Command,
    Environment,
    Workspace,
    Network,
    Sandbox,
    ToolGate,
    Cost,
}

impl std::fmt::Display for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Sanitizer => "sanitizer",
            Self::Injection => "injection",
            Self::Validator => "validator",
            Self::Policy => "policy",
            Self::LeakDetector => "leak_detector",
            Self::Command => "command",
            Self::Environment => "environment",
            Self::Workspace => "workspace",
            Self::Network => "network",
            Self::Sandbox => "sandbox",
            Self::ToolGate => "tool_gate",
            Self::Cost => "cost",
        };
        f.write_str(name)
    }
}

/// A single finding raised by one layer. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyViolation {
    component: Component,
    severity: Severity,
    rule: String,
    message: String,
    blocked: bool,
}

impl SafetyViolation {
    /// A violation that blocks the action.
    pub fn blocking(
        component: Component,
        severity: Severity,
        rule: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            component,
            severity,
            rule: rule.into(),
            message: message.into(),
            blocked: true,
        }
    }

    /// An informational violation that does not block the action.
    pub fn advisory(
        component: Component,
        severity: Severity,
        rule: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            blocked: false,
            ..Self::blocking(component, severity, rule, message)
        }
    }

    /// Blocking iff the severity is High or Critical.
    pub fn by_severity(
        component: Component,
        severity: Severity,
        rule: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            blocked: severity.blocks(),
            ..Self::blocking(component, severity, rule, message)
        }
    }

    pub fn component(&self) -> Component {
        self.component
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    /// Machine-parsable code of the rule that fired.
    pub fn rule(&self) -> &str {
        &self.rule
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn blocked(&self) -> bool {
        self.blocked
    }
}

impl std::fmt::Display for SafetyViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}/{}] {}: {}",
            self.component, self.severity, self.rule, self.message
        )
    }
}

/// Ordered collection of violations plus the overall verdict.
///
/// `safe` flips to `false` the moment a blocking violation is added and
/// never flips back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyResult {
    safe: bool,
    violations: Vec<SafetyViolation>,
}

impl Default for SafetyResult {
    fn default() -> Self {
        Self::safe()
    }
}

impl SafetyResult {
    /// An empty, passing result.
    pub fn safe() -> Self {
        Self {
            safe: true,
            violations: Vec::new(),
        }
    }

    pub fn is_safe(&self) -> bool {
        self.safe
    }

    pub fn violations(&self) -> &[SafetyViolation] {
        &self.violations
    }

    pub fn into_violations(self) -> Vec<SafetyViolation> {
        self.violations
    }

    pub fn add(&mut self, violation: SafetyViolation) {
        if violation.blocked {
            self.safe = false;
        }
        self.violations.push(violation);
    }

    /// Append every violation from `other`, preserving order.
    pub fn merge(&mut self, other: SafetyResult) {
        for violation in other.violations {
            self.add(violation);
        }
        if !other.safe {
            self.safe = false;
        }
    }

    /// Record a denied [`Decision`] as a blocking violation.
    pub fn add_decision(&mut self, component: Component, severity: Severity, decision: &Decision) {
        if !decision.allowed {
            self.add(SafetyViolation::blocking(
                component,
                severity,
                decision.code(),
                decision.reason.clone(),
            ));
        }
    }

    pub fn blocking_violations(&self) -> impl Iterator<Item = &SafetyViolation> {
        self.violations.iter().filter(|v| v.blocked)
    }

    /// Highest severity present, if any violations were recorded.
    pub fn max_severity(&self) -> Option<Severity> {
        self.violations.iter().map(|v| v.severity).max()
    }
}

/// Outcome of a single allow/deny check.
///
/// Used for command, sandbox, network and budget checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub allowed: bool,
    pub reason: String,
}

/// Shell command verdict.
pub type CommandDecision = Decision;

/// Sandbox / network / budget verdict.
pub type PolicyDecision = Decision;

impl Decision {
    pub fn allow(reason: impl Into<String>) -> Self {
        Self {
            allowed: true,
            reason: reason.into(),
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
        }
    }

    /// The reason code: the text before the first `:` or ` (`.
    pub fn code(&self) -> &str {
        reason_code(&self.reason)
    }
}

/// Outcome of a tool-gating check.
///
/// `allowed == false && requires_approval == true` means "route to a human",
/// not a hard deny.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatingDecision {
    pub allowed: bool,
    pub reason: String,
    pub requires_approval: bool,
}

impl GatingDecision {
    pub fn allow(reason: impl Into<String>) -> Self {
        Self {
            allowed: true,
            reason: reason.into(),
            requires_approval: false,
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
            requires_approval: false,
        }
    }

    pub fn needs_approval(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
            requires_approval: true,
        }
    }
}

pub(crate) fn reason_code(reason: &str) -> &str {
    let end = reason
        .find(|c: char| c == ':' || c == '(')
        .unwrap_or(reason.len());
    reason[..end].trim_end()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocking_violation_flips_safe() {
        let mut result = SafetyResult::safe();
        result.add(SafetyViolation::advisory(
            Component::Sanitizer,
            Severity::Low,
            "markup",
            "stripped",
        ));
        assert!(result.is_safe());

        result.add(SafetyViolation::blocking(
            Component::Command,
            Severity::Critical,
            "blocked_pattern",
            "rm -rf /",
        ));
        assert!(!result.is_safe());

        result.add(SafetyViolation::advisory(
            Component::Sanitizer,
            Severity::Low,
            "markup",
            "stripped again",
        ));
        assert!(!result.is_safe(), "safe must never revert to true");
        assert_eq!(result.violations().len(), 3);
    }

    #[test]
    fn test_merge_preserves_order_and_verdict() {
        let mut first = SafetyResult::safe();
        first.add(SafetyViolation::blocking(
            Component::Validator,
            Severity::Medium,
            "missing_param",
            "a",
        ));
        let mut second = SafetyResult::safe();
        second.add(SafetyViolation::advisory(
            Component::Policy,
            Severity::Low,
            "note",
            "b",
        ));

        let mut merged = SafetyResult::safe();
        merged.merge(first);
        merged.merge(second);
        assert!(!merged.is_safe());
        let messages: Vec<_> = merged.violations().iter().map(|v| v.message()).collect();
        assert_eq!(messages, vec!["a", "b"]);
    }

    #[test]
    fn test_by_severity_blocks_high_and_critical_only() {
        for (sev, blocked) in [
            (Severity::Low, false),
            (Severity::Medium, false),
            (Severity::High, true),
            (Severity::Critical, true),
        ] {
            let v = SafetyViolation::by_severity(Component::LeakDetector, sev, "r", "m");
            assert_eq!(v.blocked(), blocked, "severity {sev}");
        }
    }

    #[test]
    fn test_decision_code_extraction() {
        assert_eq!(
            Decision::deny("blocked_pattern: fork_bomb").code(),
            "blocked_pattern"
        );
        assert_eq!(
            Decision::deny("private_address: 10.0.0.1 (resolved from x)").code(),
            "private_address"
        );
        assert_eq!(Decision::allow("allowed").code(), "allowed");
        assert_eq!(
            Decision::deny("Daily budget exhausted (150¢ / 100¢)").code(),
            "Daily budget exhausted"
        );
    }

    #[test]
    fn test_add_decision_ignores_allowed() {
        let mut result = SafetyResult::safe();
        result.add_decision(Component::Network, Severity::High, &Decision::allow("allowed"));
        assert!(result.violations().is_empty());
        result.add_decision(
            Component::Network,
            Severity::High,
            &Decision::deny("no_hostname"),
        );
        assert!(!result.is_safe());
        assert_eq!(result.violations()[0].rule(), "no_hostname");
    }

    #[test]
    fn test_severity_ordering_and_serde() {
        assert!(Severity::Low < Severity::Critical);
        let json = serde_json::to_string(&Severity::High).unwrap();
        assert_eq!(json, "\"high\"");
        let back: Severity = serde_json::from_str("\"critical\"").unwrap();
        assert_eq!(back, Severity::Critical);
    }
}
