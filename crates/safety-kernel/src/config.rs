//! TOML policy file for building a [`SafetyKernel`].
//!
//! Every section is optional. Patterns are compiled and the workspace root
//! validated while building, so a bad file fails at startup rather than on
//! the first check.
//!
//! ```toml
//! forbidden_patterns = [{ name = "prod_db", pattern = 'prod-db\.internal' }]
//!
//! [commands]
//! allowlist_mode = true
//!
//! [workspace]
//! root = "/srv/agent-work"
//!
//! [agents.coder.sandbox]
//! level = "workspace_write"
//! allowed_write_dirs = ["/srv/agent-work/src"]
//!
//! [agents.coder.tool_policy]
//! allowed_tools = ["read_file", "write_file"]
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::command::{CommandValidator, DEFAULT_ALLOWED_COMMANDS};
use crate::cost::{CostBudget, CostGuard};
use crate::env::{EnvironmentScrubber, DEFAULT_ENV_ALLOWLIST};
use crate::error::{KernelError, KernelResult};
use crate::gating::{AgentToolPolicy, ToolGatekeeper, ToolTrustEntry};
use crate::kernel::{AgentRegistration, KernelBuilder, SafetyKernel};
use crate::network::NetworkGuard;
use crate::policy::{AgentPolicy, AgentPolicyDef};
use crate::sandbox::SandboxConfig;
use crate::secrets::{LeakPattern, PatternDef};
use crate::telemetry::TelemetrySection;
use crate::validator::{ToolCallSpec, ToolCallSpecDef};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KernelConfig {
    pub forbidden_patterns: Vec<NamedPattern>,
    pub builtin_tools: Vec<String>,
    pub commands: CommandsSection,
    pub environment: EnvironmentSection,
    pub workspace: WorkspaceSection,
    pub network: NetworkSection,
    pub budget: CostBudget,
    pub secrets: SecretsSection,
    pub tools: Vec<ToolTrustEntry>,
    pub tool_specs: Vec<ToolCallSpecDef>,
    pub agents: BTreeMap<String, AgentSection>,
    pub telemetry: TelemetrySection,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedPattern {
    pub name: String,
    pub pattern: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandsSection {
    pub allowlist_mode: bool,
    /// Replaces the default allowlist when set.
    pub allowed: Option<Vec<String>>,
    pub extra_allowed: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentSection {
    /// Replaces the default allowlist when set.
    pub allowlist: Option<Vec<String>>,
    pub extra_allowed: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceSection {
    pub root: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSection {
    pub host_allowlist: Option<Vec<String>>,
    pub allow_private: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecretsSection {
    pub patterns: Vec<PatternDef>,
}

/// Bootstrap registration for one agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    pub sandbox: Option<SandboxConfig>,
    pub tool_policy: Option<AgentToolPolicy>,
    pub policy: Option<AgentPolicyDef>,
    pub budget: Option<CostBudget>,
}

impl KernelConfig {
    pub fn from_toml_str(source: &str) -> KernelResult<Self> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> KernelResult<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&source)?;
        info!(path = %path.display(), agents = config.agents.len(), "policy file loaded");
        Ok(config)
    }

    /// Semantic checks serde cannot express.
    pub fn validate(&self) -> KernelResult<()> {
        check_budget("budget", &self.budget)?;
        self.telemetry.directives()?;
        for (agent_id, section) in &self.agents {
            if agent_id.trim().is_empty() {
                return Err(KernelError::InvalidConfig("empty agent id".into()));
            }
            if let Some(budget) = &section.budget {
                check_budget(&format!("agents.{agent_id}.budget"), budget)?;
            }
        }
        for tool in &self.tools {
            if tool.tool_name.trim().is_empty() {
                return Err(KernelError::InvalidConfig("tool entry with empty name".into()));
            }
        }
        Ok(())
    }
}

fn check_budget(section: &str, budget: &CostBudget) -> KernelResult<()> {
    if budget.alert_threshold_percent > 100 {
        return Err(KernelError::InvalidConfig(format!(
            "{section}.alert_threshold_percent must be at most 100, got {}",
            budget.alert_threshold_percent
        )));
    }
    Ok(())
}

impl SafetyKernel {
    /// Build a kernel and register every agent listed in `config`.
    pub fn from_config(config: &KernelConfig) -> KernelResult<Self> {
        config.validate()?;
        let mut builder = KernelBuilder::new();

        for def in &config.secrets.patterns {
            builder = builder.leak_pattern(LeakPattern::from_def(def)?);
        }
        for pattern in &config.forbidden_patterns {
            builder = builder.global_pattern(pattern.name.clone(), pattern.pattern.clone());
        }
        for def in &config.tool_specs {
            builder = builder.tool_spec(ToolCallSpec::from_def(def)?);
        }

        let allowed = config.commands.allowed.clone().unwrap_or_else(|| {
            DEFAULT_ALLOWED_COMMANDS
                .iter()
                .map(|c| c.to_string())
                .collect()
        });
        let commands = CommandValidator::with_allowed(
            config.commands.allowlist_mode,
            allowed
                .into_iter()
                .chain(config.commands.extra_allowed.iter().cloned()),
        )?;
        builder = builder.command_validator(commands);

        let env_allowlist = config.environment.allowlist.clone().unwrap_or_else(|| {
            DEFAULT_ENV_ALLOWLIST.iter().map(|k| k.to_string()).collect()
        });
        builder = builder.environment(
            EnvironmentScrubber::with_allowlist(env_allowlist)
                .with_extra_allowed(config.environment.extra_allowed.iter().cloned()),
        );

        if let Some(root) = &config.workspace.root {
            builder = builder.workspace_root(root.clone());
        }

        let mut network = NetworkGuard::new().allow_private(config.network.allow_private);
        if let Some(hosts) = &config.network.host_allowlist {
            network = network.with_allowlist(hosts.iter().cloned());
        }
        builder = builder.network(network);

        let gatekeeper = ToolGatekeeper::new();
        gatekeeper.register_builtin_tools(config.builtin_tools.iter().cloned());
        for entry in &config.tools {
            gatekeeper.register_tool(entry.clone());
        }
        builder = builder
            .gatekeeper(gatekeeper)
            .cost_guard(CostGuard::new(config.budget));

        let kernel = builder.build()?;

        for (agent_id, section) in &config.agents {
            let mut registration = AgentRegistration::new();
            registration.sandbox = section.sandbox.clone();
            registration.tool_policy = section.tool_policy.clone();
            registration.budget = section.budget;
            if let Some(def) = &section.policy {
                registration.policy = Some(AgentPolicy::from_def(agent_id, def)?);
            }
            kernel.register_agent(agent_id, registration);
        }

        Ok(kernel)
    }

    /// [`KernelConfig::load`] followed by [`SafetyKernel::from_config`].
    pub fn from_config_file(path: impl AsRef<Path>) -> KernelResult<Self> {
        Self::from_config(&KernelConfig::load(path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::SandboxLevel;
    use crate::telemetry::LogFormat;

    #[test]
    fn test_empty_config_is_default() {
        let config = KernelConfig::from_toml_str("").unwrap();
        assert_eq!(config, KernelConfig::default());
        assert_eq!(config.budget.max_cost_per_day_cents, 5000);
    }

    #[test]
    fn test_agent_sections_parse() {
        let config = KernelConfig::from_toml_str(
            r#"
            [agents.coder.sandbox]
            level = "read_only"
            allow_subprocess = true

            [agents.coder.tool_policy]
            allowed_tools = ["read_file"]
            auto_approve = false

            [agents.coder.budget]
            max_cost_per_day_cents = 100
            "#,
        )
        .unwrap();
        let coder = &config.agents["coder"];
        let sandbox = coder.sandbox.as_ref().unwrap();
        assert_eq!(sandbox.level(), SandboxLevel::ReadOnly);
        assert!(!sandbox.allow_subprocess());
        assert!(!coder.tool_policy.as_ref().unwrap().auto_approve);
        assert_eq!(coder.budget.unwrap().max_actions_per_hour, 200);
    }

    #[test]
    fn test_unknown_top_level_key_rejected() {
        let err = KernelConfig::from_toml_str("not_a_section = 1").unwrap_err();
        assert!(matches!(err, KernelError::Config(_)));
    }

    #[test]
    fn test_bad_threshold_rejected() {
        let err = KernelConfig::from_toml_str("[budget]\nalert_threshold_percent = 150").unwrap_err();
        assert!(matches!(err, KernelError::InvalidConfig(_)));
    }

    #[test]
    fn test_telemetry_section() {
        let config = KernelConfig::from_toml_str(
            "[telemetry]\nformat = \"json\"\nlevel = \"debug\"\ndecisions_only = true",
        )
        .unwrap();
        assert_eq!(config.telemetry.format, LogFormat::Json);
        assert_eq!(config.telemetry.directives().unwrap(), "off,safety_kernel=debug");

        let err = KernelConfig::from_toml_str("[telemetry]\nlevel = \"chatty\"").unwrap_err();
        assert!(matches!(err, KernelError::InvalidConfig(_)));
    }

    #[test]
    fn test_bad_pattern_fails_kernel_build() {
        let config = KernelConfig::from_toml_str(
            "[[secrets.patterns]]\nname = \"broken\"\npattern = \"(\"",
        )
        .unwrap();
        let err = SafetyKernel::from_config(&config).unwrap_err();
        assert!(matches!(err, KernelError::InvalidPattern { .. }));
    }

    #[test]
    fn test_missing_workspace_root_fails_kernel_build() {
        let config =
            KernelConfig::from_toml_str("[workspace]\nroot = \"/definitely/not/a/real/dir\"")
                .unwrap();
        assert!(matches!(
            SafetyKernel::from_config(&config),
            Err(KernelError::Scope(_))
        ));
    }
}
