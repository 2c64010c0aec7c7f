//! Configuration-time error taxonomy.
//!
//! Check-time outcomes are never errors (see [`crate::verdict`]); these
//! variants surface only while constructing components or loading policy.

use crate::workspace::ScopeError;

/// Errors produced while building the kernel or one of its layers.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    #[error("invalid pattern '{name}': {source}")]
    InvalidPattern {
        name: String,
        #[source]
        source: regex::Error,
    },

    #[error("invalid kernel configuration: {0}")]
    InvalidConfig(String),

    #[error("policy file parse error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("workspace error: {0}")]
    Scope(#[from] ScopeError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl KernelError {
    pub(crate) fn pattern(name: impl Into<String>, source: regex::Error) -> Self {
        Self::InvalidPattern {
            name: name.into(),
            source,
        }
    }
}

/// Result type for kernel construction.
pub type KernelResult<T> = std::result::Result<T, KernelError>;

/// Compile a regex, tagging failures with the rule name.
pub(crate) fn compile(name: &str, pattern: &str) -> KernelResult<regex::Regex> {
    regex::Regex::new(pattern).map_err(|e| KernelError::pattern(name, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_pattern_names_the_rule() {
        let err = compile("broken", "(unclosed").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("invalid pattern 'broken'"));
    }

    #[test]
    fn test_invalid_config_display() {
        let err = KernelError::InvalidConfig("duplicate agent id: coder".into());
        assert!(err.to_string().contains("duplicate agent id"));
    }

    #[test]
    fn test_toml_error_converts() {
        let parse: Result<toml::Value, _> = toml::from_str("= nope");
        let err: KernelError = parse.unwrap_err().into();
        assert!(err.to_string().starts_with("policy file parse error"));
    }
}
