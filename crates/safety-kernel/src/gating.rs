//! Trust-tiered tool access control.
//!
//! A tool's trust tier comes from a global registry; whether an agent may
//! call it comes from that agent's [`AgentToolPolicy`]. Approval flags
//! always win over trust: a tool that requires approval is never
//! auto-allowed.

use std::collections::{BTreeSet, HashMap};
use std::sync::{PoisonError, RwLock};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::verdict::GatingDecision;

/// Tool trust tier, lowest first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    #[default]
    Community,
    Verified,
    Builtin,
}

impl std::fmt::Display for TrustLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Community => write!(f, "community"),
            Self::Verified => write!(f, "verified"),
            Self::Builtin => write!(f, "builtin"),
        }
    }
}

/// Registry entry for one tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolTrustEntry {
    pub tool_name: String,
    #[serde(default)]
    pub trust_level: TrustLevel,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub requires_approval: bool,
}

impl ToolTrustEntry {
    pub fn new(tool_name: impl Into<String>, trust_level: TrustLevel) -> Self {
        Self {
            tool_name: tool_name.into(),
            trust_level,
            description: String::new(),
            requires_approval: false,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Every call to this tool is routed to a human, whatever the policy.
    pub fn requiring_approval(mut self) -> Self {
        self.requires_approval = true;
        self
    }
}

/// Per-agent tool access rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentToolPolicy {
    pub min_trust_level: TrustLevel,
    /// `None` permits every tool at or above `min_trust_level`.
    pub allowed_tools: Option<BTreeSet<String>>,
    pub denied_tools: BTreeSet<String>,
    pub auto_approve: bool,
    pub max_iterations: u32,
}

impl Default for AgentToolPolicy {
    fn default() -> Self {
        Self {
            min_trust_level: TrustLevel::Community,
            allowed_tools: None,
            denied_tools: BTreeSet::new(),
            auto_approve: true,
            max_iterations: 50,
        }
    }
}

impl AgentToolPolicy {
    /// Default policy restricted to `tools`.
    pub fn allowing<I, S>(tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed_tools: Some(tools.into_iter().map(Into::into).collect()),
            ..Self::default()
        }
    }

    /// Deny `tool` even if it is also allowed.
    pub fn deny(mut self, tool: impl Into<String>) -> Self {
        self.denied_tools.insert(tool.into());
        self
    }

    pub fn min_trust(mut self, level: TrustLevel) -> Self {
        self.min_trust_level = level;
        self
    }

    /// When false, every permitted call still needs approval.
    pub fn auto_approve(mut self, auto: bool) -> Self {
        self.auto_approve = auto;
        self
    }

    pub fn max_iterations(mut self, max: u32) -> Self {
        self.max_iterations = max;
        self
    }
}

/// Decides whether an agent may invoke a tool.
#[derive(Debug, Default)]
pub struct ToolGatekeeper {
    tools: RwLock<HashMap<String, ToolTrustEntry>>,
    policies: DashMap<String, AgentToolPolicy>,
}

impl ToolGatekeeper {
    pub fn new() -> Self {
        info!("tool gatekeeper initialized");
        Self::default()
    }

    /// Add or replace a tool's trust entry.
    pub fn register_tool(&self, entry: ToolTrustEntry) {
        debug!(tool = %entry.tool_name, trust = %entry.trust_level, "tool registered");
        self.tools
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(entry.tool_name.clone(), entry);
    }

    /// Register every name at [`TrustLevel::Builtin`].
    pub fn register_builtin_tools<I, S>(&self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut tools = self.tools.write().unwrap_or_else(PoisonError::into_inner);
        for name in names {
            let entry = ToolTrustEntry::new(name, TrustLevel::Builtin);
            tools.insert(entry.tool_name.clone(), entry);
        }
    }

    /// Replace the agent's policy. Last write wins.
    pub fn set_policy(&self, agent_id: &str, policy: AgentToolPolicy) {
        info!(agent_id = %agent_id, min_trust = %policy.min_trust_level, "tool policy set");
        self.policies.insert(agent_id.to_string(), policy);
    }

    pub fn remove_policy(&self, agent_id: &str) -> Option<AgentToolPolicy> {
        self.policies.remove(agent_id).map(|(_, p)| p)
    }

    /// Snapshot of the agent's policy, if one is set.
    pub fn policy_for(&self, agent_id: &str) -> Option<AgentToolPolicy> {
        self.policies.get(agent_id).map(|p| p.value().clone())
    }

    /// Registered entry for `name`. Unregistered tools are treated as
    /// [`TrustLevel::Community`] by [`Self::check`].
    pub fn tool(&self, name: &str) -> Option<ToolTrustEntry> {
        self.tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Evaluate whether `agent_id` may call `tool_name` at `iteration`.
    pub fn check(&self, agent_id: &str, tool_name: &str, iteration: u32) -> GatingDecision {
        let tool = self
            .tool(tool_name)
            .unwrap_or_else(|| ToolTrustEntry::new(tool_name, TrustLevel::Community));

        let decision = match self.policies.get(agent_id) {
            None if tool.requires_approval => GatingDecision::needs_approval(format!(
                "Tool '{tool_name}' requires approval, no policy for agent '{agent_id}'"
            )),
            None => GatingDecision::allow("no_policy_default_allow"),
            Some(policy) => evaluate(agent_id, &tool, policy.value(), iteration),
        };

        if !decision.allowed {
            warn!(
                agent_id = %agent_id,
                tool = %tool_name,
                requires_approval = decision.requires_approval,
                reason = %decision.reason,
                "tool call gated"
            );
        }
        decision
    }

    /// Registered tools the agent may call right now, sorted by name.
    pub fn list_tools_for_agent(&self, agent_id: &str) -> Vec<String> {
        let names: Vec<String> = self
            .tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        let mut allowed: Vec<String> = names
            .into_iter()
            .filter(|name| self.check(agent_id, name, 0).allowed)
            .collect();
        allowed.sort();
        allowed
    }
}

fn evaluate(
    agent_id: &str,
    tool: &ToolTrustEntry,
    policy: &AgentToolPolicy,
    iteration: u32,
) -> GatingDecision {
    let name = &tool.tool_name;

    if policy.denied_tools.contains(name) {
        return GatingDecision::deny(format!(
            "Tool '{name}' explicitly denied for agent '{agent_id}'"
        ));
    }

    if let Some(allowed) = &policy.allowed_tools {
        if !allowed.contains(name) {
            return GatingDecision::deny(format!(
                "Tool '{name}' not in allowed list for agent '{agent_id}'"
            ));
        }
    }

    if tool.trust_level < policy.min_trust_level {
        return GatingDecision::deny(format!(
            "Tool trust {} < agent minimum {}",
            tool.trust_level, policy.min_trust_level
        ));
    }

    if iteration > policy.max_iterations {
        return GatingDecision::deny(format!(
            "Iteration {iteration} exceeds limit {}",
            policy.max_iterations
        ));
    }

    if tool.requires_approval || !policy.auto_approve {
        return GatingDecision::needs_approval(format!("Tool '{name}' requires human approval"));
    }

    GatingDecision::allow("allowed")
}
