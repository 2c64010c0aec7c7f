//! The composition root: one [`SafetyKernel`] owns every layer and fans
//! each agent action out to the layers that apply.
//!
//! Entry points never short-circuit. Later layers still run after an
//! earlier one has blocked, so callers always see the full violation list.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::command::CommandValidator;
use crate::cost::{CostBudget, CostGuard, UsageSnapshot};
use crate::env::EnvironmentScrubber;
use crate::error::KernelResult;
use crate::gating::{AgentToolPolicy, ToolGatekeeper};
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::network::NetworkGuard;
use crate::obs::{self, CheckSpan};
use crate::policy::{AgentPolicy, PolicyEngine};
use crate::sandbox::{SandboxConfig, SandboxPolicy};
use crate::sanitizer::{Sanitized, Sanitizer, INJECTION_TABLE_VERSION};
use crate::secrets::{LeakPattern, SecretScanner};
use crate::validator::{joined_params, ToolCallSpec, Validator};
use crate::verdict::{Component, Decision, SafetyResult, SafetyViolation, Severity};
use crate::workspace::WorkspaceScope;

/// One thing an agent wants to do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgentAction {
    RunCommand { command: String },
    ReadFile { path: PathBuf },
    WriteFile { path: PathBuf },
    Fetch { url: String },
    Bind { port: u16 },
    InvokeTool {
        tool: String,
        #[serde(default)]
        params: Value,
        #[serde(default)]
        iteration: u32,
    },
    EmitText { text: String },
}

impl AgentAction {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RunCommand { .. } => "run_command",
            Self::ReadFile { .. } => "read_file",
            Self::WriteFile { .. } => "write_file",
            Self::Fetch { .. } => "fetch",
            Self::Bind { .. } => "bind",
            Self::InvokeTool { .. } => "invoke_tool",
            Self::EmitText { .. } => "emit_text",
        }
    }
}

/// Everything registered for an agent at bootstrap. Unset parts are left alone.
#[derive(Debug, Clone, Default)]
pub struct AgentRegistration {
    pub sandbox: Option<SandboxConfig>,
    pub tool_policy: Option<AgentToolPolicy>,
    pub policy: Option<AgentPolicy>,
    pub budget: Option<CostBudget>,
}

impl AgentRegistration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sandbox(mut self, config: SandboxConfig) -> Self {
        self.sandbox = Some(config);
        self
    }

    pub fn tool_policy(mut self, policy: AgentToolPolicy) -> Self {
        self.tool_policy = Some(policy);
        self
    }

    pub fn policy(mut self, policy: AgentPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn budget(mut self, budget: CostBudget) -> Self {
        self.budget = Some(budget);
        self
    }
}

/// Explicit wiring for a [`SafetyKernel`]. Unset layers use their defaults.
#[derive(Debug, Default)]
pub struct KernelBuilder {
    leak_patterns: Vec<LeakPattern>,
    global_patterns: Vec<(String, String)>,
    tool_specs: Vec<ToolCallSpec>,
    commands: Option<CommandValidator>,
    env: Option<EnvironmentScrubber>,
    workspace: Option<WorkspaceScope>,
    workspace_root: Option<PathBuf>,
    network: Option<NetworkGuard>,
    sandbox: Option<SandboxPolicy>,
    gatekeeper: Option<ToolGatekeeper>,
    cost: Option<CostGuard>,
}

impl KernelBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn leak_pattern(mut self, pattern: LeakPattern) -> Self {
        self.leak_patterns.push(pattern);
        self
    }

    /// Extra pattern applied to every tool call, after the command blocklist.
    pub fn global_pattern(mut self, name: impl Into<String>, pattern: impl Into<String>) -> Self {
        self.global_patterns.push((name.into(), pattern.into()));
        self
    }

    pub fn tool_spec(mut self, spec: ToolCallSpec) -> Self {
        self.tool_specs.push(spec);
        self
    }

    pub fn command_validator(mut self, validator: CommandValidator) -> Self {
        self.commands = Some(validator);
        self
    }

    pub fn environment(mut self, scrubber: EnvironmentScrubber) -> Self {
        self.env = Some(scrubber);
        self
    }

    pub fn workspace(mut self, scope: WorkspaceScope) -> Self {
        self.workspace = Some(scope);
        self
    }

    /// Bind the workspace at build time; an invalid root fails the build.
    pub fn workspace_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.workspace_root = Some(root.into());
        self
    }

    pub fn network(mut self, guard: NetworkGuard) -> Self {
        self.network = Some(guard);
        self
    }

    pub fn sandbox(mut self, policy: SandboxPolicy) -> Self {
        self.sandbox = Some(policy);
        self
    }

    pub fn gatekeeper(mut self, gatekeeper: ToolGatekeeper) -> Self {
        self.gatekeeper = Some(gatekeeper);
        self
    }

    pub fn cost_guard(mut self, guard: CostGuard) -> Self {
        self.cost = Some(guard);
        self
    }

    /// Compile every pattern and validate the workspace root.
    pub fn build(self) -> KernelResult<SafetyKernel> {
        let workspace = match (self.workspace, self.workspace_root) {
            (Some(scope), _) => Some(scope),
            (None, Some(root)) => Some(WorkspaceScope::new(root)?),
            (None, None) => None,
        };

        let mut validator = Validator::new();
        for spec in self.tool_specs {
            validator.register_spec(spec);
        }

        let commands = match self.commands {
            Some(commands) => commands,
            None => CommandValidator::new(false)?,
        };

        let kernel = SafetyKernel {
            scanner: SecretScanner::with_extra_patterns(self.leak_patterns)?,
            sanitizer: Sanitizer::new()?,
            validator,
            policy: PolicyEngine::with_global_patterns(self.global_patterns)?,
            commands,
            env: self.env.unwrap_or_default(),
            workspace,
            network: self.network.unwrap_or_default(),
            sandbox: self.sandbox.unwrap_or_default(),
            gatekeeper: self.gatekeeper.unwrap_or_default(),
            cost: self.cost.unwrap_or_default(),
            metrics: Metrics::new(),
        };
        info!(
            workspace = kernel.workspace.is_some(),
            allowlist_mode = kernel.commands.allowlist_mode(),
            "safety kernel initialized"
        );
        Ok(kernel)
    }
}

/// Gates every agent action behind one policy decision.
#[derive(Debug)]
pub struct SafetyKernel {
    scanner: SecretScanner,
    sanitizer: Sanitizer,
    validator: Validator,
    policy: PolicyEngine,
    commands: CommandValidator,
    env: EnvironmentScrubber,
    workspace: Option<WorkspaceScope>,
    network: NetworkGuard,
    sandbox: SandboxPolicy,
    gatekeeper: ToolGatekeeper,
    cost: CostGuard,
    metrics: Metrics,
}

impl SafetyKernel {
    /// Kernel with every layer at its defaults and no workspace.
    pub fn new() -> KernelResult<Self> {
        KernelBuilder::new().build()
    }

    pub fn builder() -> KernelBuilder {
        KernelBuilder::new()
    }

    /// Register an agent's sandbox, tool policy, engine policy and budget.
    pub fn register_agent(&self, agent_id: &str, registration: AgentRegistration) {
        if let Some(config) = registration.sandbox {
            self.sandbox.set_config(agent_id, config);
        }
        if let Some(policy) = registration.tool_policy {
            self.gatekeeper.set_policy(agent_id, policy);
        }
        if let Some(policy) = registration.policy {
            self.policy.set_policy(agent_id, policy);
        }
        if let Some(budget) = registration.budget {
            self.cost.set_budget(agent_id, budget);
        }
        info!(agent_id = %agent_id, "agent registered");
    }

    /// Sanitize, neutralise injection phrasing, then leak-scan inbound text.
    ///
    /// Markup findings are advisory. Injection findings block: the phrasing
    /// is redacted from the returned text but the input is still reported.
    pub fn check_input(&self, text: &str, agent_id: &str) -> (String, SafetyResult) {
        let _span = CheckSpan::enter("check_input", agent_id);
        let mut result = SafetyResult::safe();

        let sanitized = self.sanitizer.sanitize(text);
        record_markup(&mut result, &sanitized, "input");

        let neutralized = self.sanitizer.neutralize_injection(&sanitized.text);
        if neutralized.changed() {
            obs::emit_injection_detected("input", &neutralized.stripped, INJECTION_TABLE_VERSION);
        }
        for rule in &neutralized.stripped {
            result.add(SafetyViolation::blocking(
                Component::Injection,
                Severity::Medium,
                *rule,
                format!("Prompt injection pattern in input: {rule}"),
            ));
        }
        result.merge(self.scanner.scan(&neutralized.text));

        (neutralized.text, self.finish("check_input", agent_id, result))
    }

    /// Leak-scan then sanitize model output.
    pub fn check_output(&self, text: &str) -> (String, SafetyResult) {
        let _span = CheckSpan::enter("check_output", "");
        let (text, result) = self.output_result(text);
        (text, self.finish("check_output", "", result))
    }

    /// Validate, policy-check, gate and budget-check a tool invocation.
    pub fn check_tool_call(
        &self,
        agent_id: &str,
        tool_name: &str,
        params: &Value,
        iteration: u32,
    ) -> SafetyResult {
        let _span = CheckSpan::enter("check_tool_call", agent_id);
        let result = self.tool_call_result(agent_id, tool_name, params, iteration);
        self.finish("check_tool_call", agent_id, result)
    }

    /// Evaluate one action against every layer that applies to it.
    pub fn evaluate(&self, agent_id: &str, action: &AgentAction) -> SafetyResult {
        let _span = CheckSpan::enter(action.kind(), agent_id);
        let mut result = SafetyResult::safe();

        match action {
            AgentAction::RunCommand { command } => {
                let decision = self.commands.check(command);
                let severity = if decision.code() == "blocked_pattern" {
                    Severity::Critical
                } else {
                    Severity::High
                };
                result.add_decision(Component::Command, severity, &decision);
                result.add_decision(
                    Component::Sandbox,
                    Severity::High,
                    &self.sandbox.check_subprocess(agent_id),
                );
                result.add_decision(Component::Cost, Severity::High, &self.cost.check_budget(agent_id));
            }
            AgentAction::ReadFile { path } => {
                let resolved = self.scope_path(&mut result, path);
                let target = resolved.as_deref().unwrap_or(path.as_path());
                result.add_decision(
                    Component::Sandbox,
                    Severity::High,
                    &self.sandbox.check_read(agent_id, target),
                );
            }
            AgentAction::WriteFile { path } => {
                let resolved = self.scope_path(&mut result, path);
                let target = resolved.as_deref().unwrap_or(path.as_path());
                result.add_decision(
                    Component::Sandbox,
                    Severity::High,
                    &self.sandbox.check_write(agent_id, target),
                );
            }
            AgentAction::Fetch { url } => {
                let decision = self.network.is_safe_url(url);
                let severity = if decision.code() == "metadata_endpoint" {
                    Severity::Critical
                } else {
                    Severity::High
                };
                result.add_decision(Component::Network, severity, &decision);
                let host = url::Url::parse(url)
                    .ok()
                    .and_then(|u| u.host_str().map(str::to_string));
                result.add_decision(
                    Component::Sandbox,
                    Severity::High,
                    &self.sandbox.check_network(agent_id, host.as_deref()),
                );
                result.add_decision(Component::Cost, Severity::High, &self.cost.check_budget(agent_id));
            }
            AgentAction::Bind { port } => {
                let decision = self.sandbox.check_bind(agent_id);
                if !decision.allowed {
                    result.add(SafetyViolation::blocking(
                        Component::Sandbox,
                        Severity::High,
                        decision.code(),
                        format!("{} (port {port})", decision.reason),
                    ));
                }
            }
            AgentAction::InvokeTool {
                tool,
                params,
                iteration,
            } => {
                result.merge(self.tool_call_result(agent_id, tool, params, *iteration));
            }
            AgentAction::EmitText { text } => {
                result.merge(self.output_result(text).1);
            }
        }

        self.finish(action.kind(), agent_id, result)
    }

    /// Minimal child-process environment (see [`EnvironmentScrubber::scrub`]).
    pub fn scrub_env<I, K, V>(
        &self,
        source: I,
        task_vars: Option<&BTreeMap<String, String>>,
    ) -> BTreeMap<String, String>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env.scrub(source, task_vars)
    }

    pub fn record_cost(&self, agent_id: &str, cost_cents: f64) {
        self.cost.record_cost(agent_id, cost_cents);
    }

    pub fn record_action(&self, agent_id: &str) {
        self.cost.record_action(agent_id);
    }

    pub fn usage(&self, agent_id: &str) -> UsageSnapshot {
        self.cost.get_usage(agent_id)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn flush_metrics(&self) {
        self.metrics.flush();
    }

    pub fn scanner(&self) -> &SecretScanner {
        &self.scanner
    }

    pub fn commands(&self) -> &CommandValidator {
        &self.commands
    }

    pub fn environment(&self) -> &EnvironmentScrubber {
        &self.env
    }

    pub fn workspace(&self) -> Option<&WorkspaceScope> {
        self.workspace.as_ref()
    }

    pub fn network(&self) -> &NetworkGuard {
        &self.network
    }

    pub fn sandbox(&self) -> &SandboxPolicy {
        &self.sandbox
    }

    pub fn gatekeeper(&self) -> &ToolGatekeeper {
        &self.gatekeeper
    }

    pub fn cost(&self) -> &CostGuard {
        &self.cost
    }

    pub fn policy(&self) -> &PolicyEngine {
        &self.policy
    }

    pub fn validator(&self) -> &Validator {
        &self.validator
    }

    fn output_result(&self, text: &str) -> (String, SafetyResult) {
        let mut result = self.scanner.scan(text);

        let overrides = self.sanitizer.override_indicators(text);
        if !overrides.is_empty() {
            obs::emit_injection_detected("output", &overrides, INJECTION_TABLE_VERSION);
        }
        for rule in overrides {
            result.add(SafetyViolation::blocking(
                Component::Injection,
                Severity::High,
                rule,
                format!("Instruction override indicator in output: {rule}"),
            ));
        }

        let sanitized = self.sanitizer.sanitize(text);
        record_markup(&mut result, &sanitized, "output");
        (sanitized.text, result)
    }

    fn tool_call_result(
        &self,
        agent_id: &str,
        tool_name: &str,
        params: &Value,
        iteration: u32,
    ) -> SafetyResult {
        let mut result = self.validator.validate_tool_call(tool_name, params);
        result.merge(self.policy.check(agent_id, tool_name, params, iteration));
        result.merge(self.scanner.scan(&joined_params(params)));

        let gate = self.gatekeeper.check(agent_id, tool_name, iteration);
        if gate.requires_approval {
            self.metrics.inc_approvals();
            obs::emit_approval_required(agent_id, tool_name, &gate.reason);
            result.add(SafetyViolation::blocking(
                Component::ToolGate,
                Severity::Medium,
                "approval_required",
                gate.reason,
            ));
        } else if !gate.allowed {
            result.add(SafetyViolation::blocking(
                Component::ToolGate,
                Severity::High,
                "tool_denied",
                gate.reason,
            ));
        }

        result.add_decision(Component::Cost, Severity::High, &self.cost.check_budget(agent_id));
        result.add_decision(
            Component::Cost,
            Severity::High,
            &self.cost.check_iterations(agent_id, iteration),
        );
        result
    }

    /// Workspace containment; returns the canonical path when it passes.
    fn scope_path(&self, result: &mut SafetyResult, path: &Path) -> Option<PathBuf> {
        let Some(scope) = &self.workspace else {
            result.add_decision(
                Component::Workspace,
                Severity::High,
                &Decision::deny("no_workspace_configured"),
            );
            return None;
        };
        match scope.validate(path) {
            Ok(resolved) => Some(resolved),
            Err(err) => {
                result.add(SafetyViolation::blocking(
                    Component::Workspace,
                    Severity::High,
                    err.code(),
                    err.to_string(),
                ));
                None
            }
        }
    }

    fn finish(&self, entry_point: &str, agent_id: &str, result: SafetyResult) -> SafetyResult {
        for violation in result.violations() {
            obs::emit_violation(agent_id, violation);
        }
        self.metrics
            .record_check(!result.is_safe(), result.violations().len());
        obs::emit_check_completed(entry_point, agent_id, &result);
        result
    }
}

/// Report neutralised markup as Low, non-blocking findings.
fn record_markup(result: &mut SafetyResult, sanitized: &Sanitized, direction: &str) {
    for rule in &sanitized.stripped {
        result.add(SafetyViolation::advisory(
            Component::Sanitizer,
            Severity::Low,
            *rule,
            format!("Neutralised {rule} in {direction}"),
        ));
    }
}
