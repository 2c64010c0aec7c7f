//! Per-agent rule engine: tool allowlist, iteration cap, forbidden
//! patterns and mandatory human approval.
//!
//! Global forbidden patterns are the command blocklist plus any extras
//! configured at build time; they apply to every agent. Parameters are
//! free text, so the power-control entries of the blocklist (bare words
//! such as `halt`) only fire when the word is in command position inside a
//! single parameter value.

use std::collections::BTreeSet;

use dashmap::DashMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::command::blocklist_rules;
use crate::error::{compile, KernelResult};
use crate::validator::{joined_params, param_leaves};
use crate::verdict::{Component, SafetyResult, SafetyViolation, Severity};

/// Uncompiled agent policy, as written in a policy file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentPolicyDef {
    pub allowed_tools: Option<BTreeSet<String>>,
    pub forbidden_patterns: Vec<String>,
    pub max_tool_iterations: u32,
    pub require_human_approval: bool,
}

impl Default for AgentPolicyDef {
    fn default() -> Self {
        Self {
            allowed_tools: None,
            forbidden_patterns: Vec::new(),
            max_tool_iterations: 50,
            require_human_approval: false,
        }
    }
}

/// Compiled per-agent policy.
#[derive(Debug, Clone)]
pub struct AgentPolicy {
    pub allowed_tools: Option<BTreeSet<String>>,
    pub forbidden_patterns: Vec<Regex>,
    pub max_tool_iterations: u32,
    pub require_human_approval: bool,
}

impl Default for AgentPolicy {
    fn default() -> Self {
        Self {
            allowed_tools: None,
            forbidden_patterns: Vec::new(),
            max_tool_iterations: 50,
            require_human_approval: false,
        }
    }
}

impl AgentPolicy {
    pub fn from_def(agent_id: &str, def: &AgentPolicyDef) -> KernelResult<Self> {
        let forbidden_patterns = def
            .forbidden_patterns
            .iter()
            .enumerate()
            .map(|(i, p)| compile(&format!("{agent_id}.forbidden[{i}]"), p))
            .collect::<KernelResult<Vec<_>>>()?;
        Ok(Self {
            allowed_tools: def.allowed_tools.clone(),
            forbidden_patterns,
            max_tool_iterations: def.max_tool_iterations,
            require_human_approval: def.require_human_approval,
        })
    }
}

/// Command-position forms of the bare-word blocklist entries.
const COMMAND_POSITION_RULES: &[(&str, &str)] = &[
    ("shutdown", r"(?i)(?:^|[;&|(]\s*)(?:sudo\s+)?(?:\S*/)?shutdown\b"),
    ("reboot", r"(?i)(?:^|[;&|(]\s*)(?:sudo\s+)?(?:\S*/)?reboot\b"),
    ("poweroff", r"(?i)(?:^|[;&|(]\s*)(?:sudo\s+)?(?:\S*/)?poweroff\b"),
    ("halt", r"(?i)(?:^|[;&|(]\s*)(?:sudo\s+)?(?:\S*/)?halt\b"),
    ("init_runlevel", r"(?i)(?:^|[;&|(]\s*)(?:sudo\s+)?(?:\S*/)?init\s+[06]\b"),
];

#[derive(Debug, Clone)]
struct GlobalPattern {
    name: String,
    regex: Regex,
    /// Matched against each parameter value (and the tool name) separately.
    per_value: bool,
}

#[derive(Debug)]
pub struct PolicyEngine {
    global: Vec<GlobalPattern>,
    policies: DashMap<String, AgentPolicy>,
}

impl PolicyEngine {
    /// Engine whose global list is the command blocklist.
    pub fn new() -> KernelResult<Self> {
        Self::with_global_patterns(Vec::<(String, String)>::new())
    }

    /// Engine with extra named global patterns appended to the blocklist.
    pub fn with_global_patterns<I>(extra: I) -> KernelResult<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut global = Vec::new();
        for rule in blocklist_rules()? {
            let positional = COMMAND_POSITION_RULES
                .iter()
                .find(|&&(name, _)| name == rule.name);
            let pattern = match positional {
                Some(&(name, pattern)) => GlobalPattern {
                    name: name.to_string(),
                    regex: compile(name, pattern)?,
                    per_value: true,
                },
                None => GlobalPattern {
                    name: rule.name.to_string(),
                    regex: rule.regex,
                    per_value: false,
                },
            };
            global.push(pattern);
        }
        for (name, pattern) in extra {
            let regex = compile(&name, &pattern)?;
            global.push(GlobalPattern {
                name,
                regex,
                per_value: false,
            });
        }
        info!(global_patterns = global.len(), "policy engine initialized");
        Ok(Self {
            global,
            policies: DashMap::new(),
        })
    }

    pub fn set_policy(&self, agent_id: &str, policy: AgentPolicy) {
        info!(agent_id = %agent_id, "agent policy set");
        self.policies.insert(agent_id.to_string(), policy);
    }

    pub fn remove_policy(&self, agent_id: &str) -> Option<AgentPolicy> {
        self.policies.remove(agent_id).map(|(_, p)| p)
    }

    pub fn has_policy(&self, agent_id: &str) -> bool {
        self.policies.contains_key(agent_id)
    }

    pub fn check(
        &self,
        agent_id: &str,
        tool_name: &str,
        params: &Value,
        iteration: u32,
    ) -> SafetyResult {
        let mut result = SafetyResult::safe();
        let policy = self.policies.get(agent_id);

        if let Some(policy) = policy.as_deref() {
            if let Some(allowed) = &policy.allowed_tools {
                if !allowed.contains(tool_name) {
                    result.add(violation(
                        Severity::High,
                        "tool_not_allowed",
                        format!("Agent '{agent_id}' not allowed tool '{tool_name}'"),
                    ));
                }
            }
            if iteration > policy.max_tool_iterations {
                result.add(violation(
                    Severity::Critical,
                    "iteration_limit",
                    format!("Agent '{agent_id}' exceeded max tool iterations ({iteration})"),
                ));
            }
        }

        let combined = format!("{tool_name} {}", joined_params(params));
        let values = param_leaves(params);
        for pattern in &self.global {
            let matched = if pattern.per_value {
                std::iter::once(tool_name)
                    .chain(values.iter().map(String::as_str))
                    .any(|value| pattern.regex.is_match(value))
            } else {
                pattern.regex.is_match(&combined)
            };
            if matched {
                result.add(violation(
                    Severity::Critical,
                    "global_forbidden_pattern",
                    format!("Global forbidden pattern matched: {}", pattern.name),
                ));
            }
        }

        if let Some(policy) = policy.as_deref() {
            if policy
                .forbidden_patterns
                .iter()
                .any(|p| p.is_match(&combined))
            {
                result.add(violation(
                    Severity::High,
                    "agent_forbidden_pattern",
                    "Agent-specific forbidden pattern matched".to_string(),
                ));
            }
            if policy.require_human_approval {
                result.add(violation(
                    Severity::Medium,
                    "human_approval_required",
                    format!("Agent '{agent_id}' requires human approval for tool use"),
                ));
            }
        }

        result
    }
}

fn violation(severity: Severity, rule: &str, message: String) -> SafetyViolation {
    SafetyViolation::blocking(Component::Policy, severity, rule, message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_global_blocklist_applies_without_policy() {
        let engine = PolicyEngine::new().unwrap();
        let r = engine.check("a", "shell", &json!({"cmd": "rm -rf /"}), 0);
        assert!(!r.is_safe());
        assert_eq!(r.violations()[0].rule(), "global_forbidden_pattern");
        assert!(r.violations()[0].message().contains("recursive_delete_root"));
    }

    #[test]
    fn test_nested_params_are_matched() {
        let engine = PolicyEngine::new().unwrap();
        for params in [
            json!({"args": {"cmd": "rm -rf /"}}),
            json!({"argv": ["rm", "-rf", "/"]}),
            json!({"steps": [{"run": "mkfs.ext4 /dev/sda1"}]}),
        ] {
            let r = engine.check("a", "shell", &params, 0);
            assert!(!r.is_safe(), "{params}");
            assert_eq!(r.violations()[0].rule(), "global_forbidden_pattern");
        }
    }

    #[test]
    fn test_power_words_in_prose_are_not_commands() {
        let engine = PolicyEngine::new().unwrap();
        for text in [
            "we halt the rollout until Monday",
            "the reboot of the series was great",
            "graceful shutdown is handled by the runtime",
        ] {
            let r = engine.check("a", "send_message", &json!({"text": text}), 0);
            assert!(r.is_safe(), "{text}: {:?}", r.violations());
        }

        for cmd in ["shutdown -h now", "sudo reboot", "echo bye; /sbin/halt", "init 0"] {
            let r = engine.check("a", "shell", &json!({"cmd": cmd}), 0);
            assert!(!r.is_safe(), "{cmd}");
        }
        assert!(!engine
            .check("a", "shell", &json!({"cmd": "rm -rf /"}), 0)
            .is_safe());
    }

    #[test]
    fn test_clean_call_without_policy() {
        let engine = PolicyEngine::new().unwrap();
        assert!(engine.check("a", "read_file", &json!({"path": "README.md"}), 0).is_safe());
    }

    #[test]
    fn test_policy_rules_accumulate() {
        let engine = PolicyEngine::new().unwrap();
        let def = AgentPolicyDef {
            allowed_tools: Some(["read_file".to_string()].into()),
            forbidden_patterns: vec![r"(?i)drop\s+table".into()],
            max_tool_iterations: 2,
            require_human_approval: true,
        };
        engine.set_policy("a", AgentPolicy::from_def("a", &def).unwrap());
        let r = engine.check("a", "sql", &json!({"q": "DROP TABLE users"}), 3);
        let rules: Vec<_> = r.violations().iter().map(|v| v.rule()).collect();
        assert_eq!(
            rules,
            vec![
                "tool_not_allowed",
                "iteration_limit",
                "agent_forbidden_pattern",
                "human_approval_required"
            ]
        );
    }

    #[test]
    fn test_extra_global_pattern() {
        let engine = PolicyEngine::with_global_patterns([(
            "prod_db".to_string(),
            r"prod-db\.internal".to_string(),
        )])
        .unwrap();
        let r = engine.check("a", "query", &json!({"host": "prod-db.internal"}), 0);
        assert!(r.violations()[0].message().ends_with("prod_db"));
    }

    #[test]
    fn test_bad_agent_pattern_is_config_error() {
        let def = AgentPolicyDef {
            forbidden_patterns: vec!["(".into()],
            ..AgentPolicyDef::default()
        };
        let err = AgentPolicy::from_def("a", &def).unwrap_err();
        assert!(err.to_string().contains("a.forbidden[0]"));
    }
}
