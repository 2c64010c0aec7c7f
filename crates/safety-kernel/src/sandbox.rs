//! Per-agent sandbox privilege tiers.
//!
//! Every check is a pure lookup against the agent's [`SandboxConfig`];
//! unregistered agents get a read-only, offline default.

use std::path::{Component as PathComponent, Path, PathBuf};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::verdict::PolicyDecision;

/// Privilege ceiling, least to most permissive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxLevel {
    ReadOnly,
    WorkspaceWrite,
    FullAccess,
}

impl std::fmt::Display for SandboxLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReadOnly => write!(f, "read_only"),
            Self::WorkspaceWrite => write!(f, "workspace_write"),
            Self::FullAccess => write!(f, "full_access"),
        }
    }
}

/// Requested sandbox settings, before level invariants are applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfigSpec {
    pub level: SandboxLevel,
    pub max_memory_mb: u64,
    pub max_cpu_seconds: u64,
    pub network_allowed: bool,
    pub network_allowlist: Vec<String>,
    pub allowed_write_dirs: Vec<PathBuf>,
    pub allow_subprocess: bool,
    pub allow_network_bind: bool,
}

impl Default for SandboxConfigSpec {
    fn default() -> Self {
        Self {
            level: SandboxLevel::WorkspaceWrite,
            max_memory_mb: 512,
            max_cpu_seconds: 300,
            network_allowed: true,
            network_allowlist: Vec::new(),
            allowed_write_dirs: Vec::new(),
            allow_subprocess: false,
            allow_network_bind: false,
        }
    }
}

impl SandboxConfigSpec {
    pub fn level(level: SandboxLevel) -> Self {
        Self {
            level,
            ..Self::default()
        }
    }
}

/// Effective sandbox settings.
///
/// `ReadOnly` forces subprocess and bind off; `WorkspaceWrite` forces bind
/// off. The derived flags are fixed at construction and cannot be set
/// independently afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "SandboxConfigSpec", into = "SandboxConfigSpec")]
pub struct SandboxConfig {
    level: SandboxLevel,
    max_memory_mb: u64,
    max_cpu_seconds: u64,
    network_allowed: bool,
    network_allowlist: Vec<String>,
    allowed_write_dirs: Vec<PathBuf>,
    allow_subprocess: bool,
    allow_network_bind: bool,
}

impl From<SandboxConfigSpec> for SandboxConfig {
    fn from(spec: SandboxConfigSpec) -> Self {
        let (allow_subprocess, allow_network_bind) = match spec.level {
            SandboxLevel::ReadOnly => (false, false),
            SandboxLevel::WorkspaceWrite => (spec.allow_subprocess, false),
            SandboxLevel::FullAccess => (spec.allow_subprocess, spec.allow_network_bind),
        };
        Self {
            level: spec.level,
            max_memory_mb: spec.max_memory_mb,
            max_cpu_seconds: spec.max_cpu_seconds,
            network_allowed: spec.network_allowed,
            network_allowlist: spec.network_allowlist,
            allowed_write_dirs: spec.allowed_write_dirs,
            allow_subprocess,
            allow_network_bind,
        }
    }
}

impl From<SandboxConfig> for SandboxConfigSpec {
    fn from(config: SandboxConfig) -> Self {
        Self {
            level: config.level,
            max_memory_mb: config.max_memory_mb,
            max_cpu_seconds: config.max_cpu_seconds,
            network_allowed: config.network_allowed,
            network_allowlist: config.network_allowlist,
            allowed_write_dirs: config.allowed_write_dirs,
            allow_subprocess: config.allow_subprocess,
            allow_network_bind: config.allow_network_bind,
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        SandboxConfigSpec::default().into()
    }
}

impl SandboxConfig {
    pub fn new(spec: SandboxConfigSpec) -> Self {
        spec.into()
    }

    /// Config applied to agents with nothing registered.
    pub fn fail_closed() -> Self {
        SandboxConfigSpec {
            network_allowed: false,
            ..SandboxConfigSpec::level(SandboxLevel::ReadOnly)
        }
        .into()
    }

    pub fn level(&self) -> SandboxLevel {
        self.level
    }

    pub fn max_memory_mb(&self) -> u64 {
        self.max_memory_mb
    }

    pub fn max_cpu_seconds(&self) -> u64 {
        self.max_cpu_seconds
    }

    pub fn network_allowed(&self) -> bool {
        self.network_allowed
    }

    pub fn network_allowlist(&self) -> &[String] {
        &self.network_allowlist
    }

    pub fn allowed_write_dirs(&self) -> &[PathBuf] {
        &self.allowed_write_dirs
    }

    pub fn allow_subprocess(&self) -> bool {
        self.allow_subprocess
    }

    pub fn allow_network_bind(&self) -> bool {
        self.allow_network_bind
    }
}

/// Holds sandbox configs keyed by agent id.
#[derive(Debug)]
pub struct SandboxPolicy {
    configs: DashMap<String, SandboxConfig>,
    default: SandboxConfig,
}

impl Default for SandboxPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl SandboxPolicy {
    pub fn new() -> Self {
        Self::with_default(SandboxConfig::fail_closed())
    }

    /// Use `default` for agents without a registered config.
    pub fn with_default(default: SandboxConfig) -> Self {
        Self {
            configs: DashMap::new(),
            default,
        }
    }

    /// Assign a config to an agent, replacing any previous one.
    ///
    /// Write dirs are canonicalized here so they compare against the
    /// canonical paths the workspace scope hands to [`Self::check_write`].
    /// A dir that cannot be resolved yet is kept as written.
    pub fn set_config(&self, agent_id: &str, mut config: SandboxConfig) {
        for dir in &mut config.allowed_write_dirs {
            if let Ok(canonical) = std::fs::canonicalize(&*dir) {
                *dir = canonical;
            }
        }
        info!(agent_id = %agent_id, level = %config.level(), "sandbox config set");
        self.configs.insert(agent_id.to_string(), config);
    }

    /// The agent's config, or the default.
    pub fn get_config(&self, agent_id: &str) -> SandboxConfig {
        self.configs
            .get(agent_id)
            .map(|c| c.value().clone())
            .unwrap_or_else(|| self.default.clone())
    }

    pub fn remove_config(&self, agent_id: &str) -> Option<SandboxConfig> {
        self.configs.remove(agent_id).map(|(_, c)| c)
    }

    pub fn check_write(&self, agent_id: &str, path: impl AsRef<Path>) -> PolicyDecision {
        let path = path.as_ref();
        let cfg = self.get_config(agent_id);
        match cfg.level() {
            SandboxLevel::ReadOnly => deny(agent_id, "read_only_sandbox".to_string()),
            SandboxLevel::FullAccess => PolicyDecision::allow("allowed"),
            SandboxLevel::WorkspaceWrite => {
                if path
                    .components()
                    .any(|c| matches!(c, PathComponent::ParentDir))
                {
                    return deny(agent_id, format!("path_traversal: {}", path.display()));
                }
                if cfg.allowed_write_dirs().is_empty() {
                    return deny(agent_id, "no_write_dirs_configured".to_string());
                }
                if cfg.allowed_write_dirs().iter().any(|dir| path.starts_with(dir)) {
                    PolicyDecision::allow("allowed")
                } else {
                    deny(
                        agent_id,
                        format!("path_outside_allowed_dirs: {}", path.display()),
                    )
                }
            }
        }
    }

    /// Reads are permitted at every level; containment is the workspace scope's job.
    pub fn check_read(&self, _agent_id: &str, _path: impl AsRef<Path>) -> PolicyDecision {
        PolicyDecision::allow("allowed")
    }

    pub fn check_subprocess(&self, agent_id: &str) -> PolicyDecision {
        let cfg = self.get_config(agent_id);
        if !cfg.allow_subprocess() {
            return deny(agent_id, format!("subprocess_denied_at_level_{}", cfg.level()));
        }
        PolicyDecision::allow("allowed")
    }

    /// Outbound network permission, optionally for a specific host.
    pub fn check_network(&self, agent_id: &str, host: Option<&str>) -> PolicyDecision {
        let cfg = self.get_config(agent_id);
        if !cfg.network_allowed() {
            return deny(agent_id, "network_denied".to_string());
        }
        if let Some(host) = host.filter(|h| !h.is_empty()) {
            if !cfg.network_allowlist().is_empty()
                && !cfg
                    .network_allowlist()
                    .iter()
                    .any(|allowed| allowed.eq_ignore_ascii_case(host))
            {
                return deny(agent_id, format!("host_not_in_allowlist: {host}"));
            }
        }
        PolicyDecision::allow("allowed")
    }

    pub fn check_bind(&self, agent_id: &str) -> PolicyDecision {
        let cfg = self.get_config(agent_id);
        if !cfg.allow_network_bind() {
            return deny(agent_id, format!("bind_denied_at_level_{}", cfg.level()));
        }
        PolicyDecision::allow("allowed")
    }
}

fn deny(agent_id: &str, reason: String) -> PolicyDecision {
    warn!(agent_id = %agent_id, reason = %reason, "sandbox check denied");
    PolicyDecision::deny(reason)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(level: SandboxLevel) -> SandboxConfigSpec {
        SandboxConfigSpec {
            allow_subprocess: true,
            allow_network_bind: true,
            ..SandboxConfigSpec::level(level)
        }
    }

    #[test]
    fn test_read_only_forces_flags_off() {
        let cfg = SandboxConfig::new(spec(SandboxLevel::ReadOnly));
        assert!(!cfg.allow_subprocess());
        assert!(!cfg.allow_network_bind());
    }

    #[test]
    fn test_workspace_write_forces_bind_off_only() {
        let cfg = SandboxConfig::new(spec(SandboxLevel::WorkspaceWrite));
        assert!(cfg.allow_subprocess());
        assert!(!cfg.allow_network_bind());
    }

    #[test]
    fn test_full_access_keeps_requested_flags() {
        let cfg = SandboxConfig::new(spec(SandboxLevel::FullAccess));
        assert!(cfg.allow_subprocess());
        assert!(cfg.allow_network_bind());
    }

    #[test]
    fn test_invariant_holds_through_deserialization() {
        let cfg: SandboxConfig = toml::from_str(
            r#"
            level = "read_only"
            allow_subprocess = true
            allow_network_bind = true
            "#,
        )
        .unwrap();
        assert_eq!(cfg.level(), SandboxLevel::ReadOnly);
        assert!(!cfg.allow_subprocess());
        assert!(!cfg.allow_network_bind());
        assert_eq!(cfg.max_memory_mb(), 512);
    }

    #[test]
    fn test_unregistered_agent_is_fail_closed() {
        let policy = SandboxPolicy::new();
        assert_eq!(policy.check_write("ghost", "/work/a.txt").reason, "read_only_sandbox");
        assert_eq!(policy.check_network("ghost", None).reason, "network_denied");
        assert_eq!(
            policy.check_subprocess("ghost").reason,
            "subprocess_denied_at_level_read_only"
        );
        assert!(policy.check_read("ghost", "/work/a.txt").allowed);
    }

    #[test]
    fn test_workspace_write_limited_to_dirs() {
        let policy = SandboxPolicy::new();
        policy.set_config(
            "coder",
            SandboxConfig::new(SandboxConfigSpec {
                allowed_write_dirs: vec![PathBuf::from("/work/src")],
                ..SandboxConfigSpec::level(SandboxLevel::WorkspaceWrite)
            }),
        );
        assert!(policy.check_write("coder", "/work/src/main.rs").allowed);
        assert_eq!(
            policy.check_write("coder", "/work/srcevil/x").code(),
            "path_outside_allowed_dirs"
        );
        assert_eq!(
            policy.check_write("coder", "/work/src/../../etc/passwd").code(),
            "path_traversal"
        );
        assert_eq!(
            policy.check_bind("coder").reason,
            "bind_denied_at_level_workspace_write"
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_write_dirs_behind_symlink_match_canonical_paths() {
        let parent = tempfile::tempdir().unwrap();
        let real = parent.path().join("real");
        std::fs::create_dir_all(real.join("src")).unwrap();
        let link = parent.path().join("link");
        std::os::unix::fs::symlink(&real, &link).unwrap();

        let policy = SandboxPolicy::new();
        policy.set_config(
            "coder",
            SandboxConfig::new(SandboxConfigSpec {
                allowed_write_dirs: vec![link.join("src")],
                ..SandboxConfigSpec::level(SandboxLevel::WorkspaceWrite)
            }),
        );

        let canonical_src = std::fs::canonicalize(real.join("src")).unwrap();
        assert_eq!(policy.get_config("coder").allowed_write_dirs(), [canonical_src.clone()]);
        assert!(policy.check_write("coder", canonical_src.join("main.rs")).allowed);
        assert!(!policy.check_write("coder", parent.path().join("other/x")).allowed);
    }

    #[test]
    fn test_workspace_write_without_dirs_denies() {
        let policy = SandboxPolicy::new();
        policy.set_config("coder", SandboxConfig::default());
        assert_eq!(
            policy.check_write("coder", "/anything").reason,
            "no_write_dirs_configured"
        );
    }

    #[test]
    fn test_network_allowlist() {
        let policy = SandboxPolicy::new();
        policy.set_config(
            "fetcher",
            SandboxConfig::new(SandboxConfigSpec {
                network_allowlist: vec!["api.github.com".into()],
                ..SandboxConfigSpec::default()
            }),
        );
        assert!(policy.check_network("fetcher", Some("api.github.com")).allowed);
        assert!(policy.check_network("fetcher", None).allowed);
        assert_eq!(
            policy.check_network("fetcher", Some("evil.com")).reason,
            "host_not_in_allowlist: evil.com"
        );
    }

    #[test]
    fn test_last_write_wins_and_remove() {
        let policy = SandboxPolicy::new();
        policy.set_config("a", SandboxConfig::new(spec(SandboxLevel::FullAccess)));
        policy.set_config("a", SandboxConfig::new(spec(SandboxLevel::ReadOnly)));
        assert_eq!(policy.get_config("a").level(), SandboxLevel::ReadOnly);
        assert!(policy.remove_config("a").is_some());
        assert_eq!(policy.get_config("a"), SandboxConfig::fail_closed());
    }

    #[test]
    fn test_full_access_can_write_anywhere_and_bind() {
        let policy = SandboxPolicy::new();
        policy.set_config("admin", SandboxConfig::new(spec(SandboxLevel::FullAccess)));
        assert!(policy.check_write("admin", "/etc/hosts").allowed);
        assert!(policy.check_bind("admin").allowed);
        assert!(policy.check_subprocess("admin").allowed);
    }
}
