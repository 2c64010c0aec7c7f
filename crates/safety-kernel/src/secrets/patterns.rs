//! Leak signature table.
//!
//! The table is plain data so new signatures land here without touching
//! scanner control flow. Bump [`TABLE_VERSION`] whenever an entry changes.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{compile, KernelResult};
use crate::verdict::Severity;

/// Version of [`DEFAULT_PATTERNS`].
pub const TABLE_VERSION: u32 = 1;

/// Uncompiled signature: name, regex source, severity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternDef {
    pub name: String,
    pub pattern: String,
    #[serde(default = "default_severity")]
    pub severity: Severity,
}

fn default_severity() -> Severity {
    Severity::Critical
}

/// Built-in signatures. Every entry is High or Critical so a match always blocks.
pub const DEFAULT_PATTERNS: &[(&str, &str, Severity)] = &[
    // Cloud provider keys
    ("AWS Access Key", r"AKIA[0-9A-Z]{16}", Severity::Critical),
    (
        "AWS Secret Key",
        r"(?i)aws[_\-]?secret[_\-]?access[_\-]?key\s*[:=]\s*\S{20,}",
        Severity::Critical,
    ),
    // Model providers
    (
        "Anthropic API Key",
        r"sk-ant-[a-zA-Z0-9\-_]{20,}",
        Severity::Critical,
    ),
    ("OpenAI API Key", r"sk-[a-zA-Z0-9]{20,}", Severity::Critical),
    // VCS
    ("GitHub PAT (classic)", r"ghp_[a-zA-Z0-9]{36}", Severity::Critical),
    (
        "GitHub PAT (fine-grained)",
        r"github_pat_[a-zA-Z0-9_]{22,}",
        Severity::Critical,
    ),
    ("GitHub OAuth", r"gho_[a-zA-Z0-9]{36}", Severity::Critical),
    // Chat platforms
    (
        "Slack Bot Token",
        r"xoxb-[0-9]{10,}-[0-9]{10,}-[a-zA-Z0-9]{24}",
        Severity::Critical,
    ),
    (
        "Slack User Token",
        r"xoxp-[0-9]{10,}-[0-9]{10,}-[a-zA-Z0-9]{24,}",
        Severity::Critical,
    ),
    // HTTP auth
    (
        "Bearer Token",
        r"Bearer\s+[a-zA-Z0-9\-_.~+/]{20,}",
        Severity::Critical,
    ),
    ("Basic Auth", r"(?i)basic\s+[A-Za-z0-9+/=]{20,}", Severity::Critical),
    (
        "Private Key Header",
        r"-----BEGIN\s+(?:RSA\s+|EC\s+|OPENSSH\s+)?PRIVATE\s+KEY-----",
        Severity::Critical,
    ),
    // Databases
    ("Postgres URI", r"postgres(?:ql)?://\S{10,}", Severity::Critical),
    ("MySQL URI", r"mysql://\S{10,}", Severity::Critical),
    ("MongoDB URI", r"mongodb(?:\+srv)?://\S{10,}", Severity::Critical),
    // PII
    ("SSN", r"\b\d{3}-\d{2}-\d{4}\b", Severity::High),
    ("Credit Card (Visa)", r"\b4[0-9]{12}(?:[0-9]{3})?\b", Severity::High),
    ("Credit Card (MC)", r"\b5[1-5][0-9]{14}\b", Severity::High),
    // Internal infrastructure
    (
        "Internal IP (10.x)",
        r"\b10\.\d{1,3}\.\d{1,3}\.\d{1,3}\b",
        Severity::High,
    ),
    (
        "Internal IP (172.16-31)",
        r"\b172\.(?:1[6-9]|2[0-9]|3[01])\.\d{1,3}\.\d{1,3}\b",
        Severity::High,
    ),
    (
        "Internal IP (192.168)",
        r"\b192\.168\.\d{1,3}\.\d{1,3}\b",
        Severity::High,
    ),
    // Generic assignment
    (
        "Secret Assignment",
        r"(?i)\b(?:password|passwd|pwd|secret|token|api[_\-]?key)\s*[:=]\s*\S{6,}",
        Severity::High,
    ),
];

/// A compiled, named leak signature.
#[derive(Debug, Clone)]
pub struct LeakPattern {
    name: String,
    regex: Regex,
    severity: Severity,
}

impl LeakPattern {
    pub fn new(name: impl Into<String>, pattern: &str, severity: Severity) -> KernelResult<Self> {
        let name = name.into();
        let regex = compile(&name, pattern)?;
        Ok(Self {
            name,
            regex,
            severity,
        })
    }

    pub fn from_def(def: &PatternDef) -> KernelResult<Self> {
        Self::new(def.name.clone(), &def.pattern, def.severity)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn regex(&self) -> &Regex {
        &self.regex
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }
}

/// Compile [`DEFAULT_PATTERNS`].
pub fn default_patterns() -> KernelResult<Vec<LeakPattern>> {
    DEFAULT_PATTERNS
        .iter()
        .map(|(name, pattern, severity)| LeakPattern::new(*name, pattern, *severity))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_table_compiles() {
        let patterns = default_patterns().unwrap();
        assert_eq!(patterns.len(), DEFAULT_PATTERNS.len());
    }

    #[test]
    fn test_default_table_names_are_unique() {
        let mut names: Vec<_> = DEFAULT_PATTERNS.iter().map(|(n, _, _)| *n).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), DEFAULT_PATTERNS.len());
    }

    #[test]
    fn test_every_default_pattern_blocks() {
        for (name, _, severity) in DEFAULT_PATTERNS {
            assert!(severity.blocks(), "{name} must be High or Critical");
        }
    }

    #[test]
    fn test_pattern_def_defaults_to_critical() {
        let def: PatternDef =
            toml::from_str("name = \"Internal Token\"\npattern = \"itk_[a-z0-9]{8}\"").unwrap();
        assert_eq!(def.severity, Severity::Critical);
        let compiled = LeakPattern::from_def(&def).unwrap();
        assert!(compiled.regex().is_match("itk_abcd1234"));
    }
}
