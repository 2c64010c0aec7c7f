//! Shell command validation: destructive-pattern blocklist, injection
//! metacharacter detection, and an optional allowlist-only mode.

use std::collections::BTreeSet;
use std::sync::RwLock;

use regex::Regex;
use tracing::{info, warn};

use crate::error::{compile, KernelResult};
use crate::verdict::CommandDecision;

/// Destructive command signatures. Always rejected, in every mode.
pub const BLOCKLIST: &[(&str, &str)] = &[
    (
        "recursive_delete_root",
        r#"(?i)\brm\s+(?:-\S+\s+)*(?:-[a-z]*r[a-z]*|--recursive)(?:\s+\S+)*?\s+['"]?(?:/|~|\$HOME)"#,
    ),
    ("no_preserve_root", r"(?i)--no-preserve-root"),
    ("fork_bomb", r":\s*\(\s*\)\s*\{\s*:\s*\|\s*:\s*&\s*\}"),
    ("raw_device_read", r"(?i)\bdd\s+.*if=/dev/(?:zero|random|urandom)"),
    (
        "raw_device_write",
        r"(?i)(?:\bdd\s+.*of=|>\s*)/dev/(?:sd[a-z]|hd[a-z]|nvme\d|vd[a-z]|xvd[a-z])",
    ),
    ("filesystem_format", r"(?i)\bmkfs(?:\.\w+)?\b"),
    ("world_writable_root", r"(?i)\bchmod\s+-R\s+777\s+/"),
    ("recursive_chown_root", r"(?i)\bchown\s+-R\s+.*\s+/\s*$"),
    ("shutdown", r"(?i)\bshutdown\b"),
    ("reboot", r"(?i)\breboot\b"),
    ("poweroff", r"(?i)\bpoweroff\b"),
    ("halt", r"(?i)\bhalt\b"),
    ("init_runlevel", r"(?i)\binit\s+[06]\b"),
    ("pipe_to_shell", r"(?i)\b(?:curl|wget)\s+.*\|\s*(?:sudo\s+)?(?:ba|z|k|da)?sh\b"),
    ("exec_injection", r#"(?i)\bpython[0-9.]*\s+-c\s+['"].*\bexec\s*\("#),
    ("eval_injection", r"(?i)\beval\s+.*(?:\$\(|`|\bcurl\b|\bwget\b)"),
];

const INJECTION_METACHARS: &str = r"[;`$|]|&&|>\s*>";

/// Commands that may sit on the right of a single pipe.
pub const SAFE_PIPE_TARGETS: &[&str] = &["head", "tail", "wc", "sort", "uniq", "grep", "less", "more"];

/// Commands permitted in allowlist mode unless configured otherwise.
pub const DEFAULT_ALLOWED_COMMANDS: &[&str] = &[
    "git", "python", "python3", "pip", "pip3", "node", "npm", "npx", "bun", "pytest", "mypy",
    "ruff", "black", "ls", "dir", "cat", "echo", "cd", "pwd", "mkdir", "cp", "mv", "find", "grep",
];

/// A compiled blocklist entry.
#[derive(Debug, Clone)]
pub struct BlockRule {
    pub name: &'static str,
    pub regex: Regex,
}

/// Compile [`BLOCKLIST`].
pub fn blocklist_rules() -> KernelResult<Vec<BlockRule>> {
    BLOCKLIST
        .iter()
        .map(|&(name, pattern)| {
            Ok(BlockRule {
                name,
                regex: compile(name, pattern)?,
            })
        })
        .collect()
}

/// Failure modes of [`split_words`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenizeError {
    #[error("unterminated {0} quote")]
    UnterminatedQuote(char),
    #[error("trailing escape character")]
    TrailingEscape,
}

/// Split a command line into words with POSIX-style quoting rules.
pub fn split_words(command: &str) -> Result<Vec<String>, TokenizeError> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = command.chars();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(inner) => current.push(inner),
                        None => return Err(TokenizeError::UnterminatedQuote('\'')),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(escaped @ ('"' | '\\' | '$' | '`')) => current.push(escaped),
                            Some(other) => {
                                current.push('\\');
                                current.push(other);
                            }
                            None => return Err(TokenizeError::UnterminatedQuote('"')),
                        },
                        Some(inner) => current.push(inner),
                        None => return Err(TokenizeError::UnterminatedQuote('"')),
                    }
                }
            }
            '\\' => match chars.next() {
                Some(escaped) => {
                    in_word = true;
                    current.push(escaped);
                }
                None => return Err(TokenizeError::TrailingEscape),
            },
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            other => {
                in_word = true;
                current.push(other);
            }
        }
    }
    if in_word {
        words.push(current);
    }
    Ok(words)
}

/// First shell word with any path prefix stripped.
///
/// Malformed quoting falls back to plain whitespace splitting.
pub fn base_command(command: &str) -> String {
    let first = match split_words(command) {
        Ok(words) => words.into_iter().next(),
        Err(_) => command.split_whitespace().next().map(str::to_string),
    };
    first
        .map(|word| word.rsplit('/').next().unwrap_or_default().to_string())
        .unwrap_or_default()
}

/// Validates shell commands before a subprocess launch.
#[derive(Debug)]
pub struct CommandValidator {
    allowlist_mode: bool,
    allowed: RwLock<BTreeSet<String>>,
    blocklist: Vec<BlockRule>,
    metachars: Regex,
}

impl CommandValidator {
    /// Validator with the default allowlist.
    pub fn new(allowlist_mode: bool) -> KernelResult<Self> {
        Self::with_allowed(
            allowlist_mode,
            DEFAULT_ALLOWED_COMMANDS.iter().map(|c| c.to_string()),
        )
    }

    /// Validator with an explicit allowlist.
    pub fn with_allowed(
        allowlist_mode: bool,
        allowed: impl IntoIterator<Item = String>,
    ) -> KernelResult<Self> {
        let allowed: BTreeSet<String> = allowed.into_iter().collect();
        info!(
            mode = if allowlist_mode { "allowlist" } else { "blocklist" },
            allowed = allowed.len(),
            "command validator initialized"
        );
        Ok(Self {
            allowlist_mode,
            allowed: RwLock::new(allowed),
            blocklist: blocklist_rules()?,
            metachars: compile("injection_metacharacters", INJECTION_METACHARS)?,
        })
    }

    pub fn allowlist_mode(&self) -> bool {
        self.allowlist_mode
    }

    /// Check whether `command` may be executed.
    pub fn check(&self, command: &str) -> CommandDecision {
        if command.trim().is_empty() {
            return CommandDecision::deny("empty_command");
        }

        if let Some(rule) = self.blocklist.iter().find(|r| r.regex.is_match(command)) {
            warn!(rule = rule.name, "blocked dangerous command pattern");
            return CommandDecision::deny(format!("blocked_pattern: {}", rule.name));
        }

        if self.metachars.is_match(command) && !self.is_safe_pipeline(command) {
            warn!("shell metacharacter injection detected");
            return CommandDecision::deny("injection_metacharacters");
        }

        if self.allowlist_mode {
            let base = base_command(command);
            if !self.is_allowed(&base) {
                warn!(command = %base, "command not in allowlist");
                return CommandDecision::deny(format!("command_not_in_allowlist: {base}"));
            }
        }

        CommandDecision::allow("allowed")
    }

    /// A single pipe into a read-only filter, with no other metacharacters.
    fn is_safe_pipeline(&self, command: &str) -> bool {
        if command.contains("||") {
            return false;
        }
        let parts: Vec<&str> = command.split('|').collect();
        let [left, right] = parts.as_slice() else {
            return false;
        };
        if self.metachars.is_match(left) || self.metachars.is_match(right) {
            return false;
        }
        SAFE_PIPE_TARGETS.contains(&base_command(right.trim()).as_str())
    }

    pub fn is_allowed(&self, command: &str) -> bool {
        self.allowed
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .contains(command)
    }

    pub fn add_allowed<I, S>(&self, commands: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut allowed = self
            .allowed
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        allowed.extend(commands.into_iter().map(Into::into));
    }

    pub fn remove_allowed<I, S>(&self, commands: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut allowed = self
            .allowed
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for command in commands {
            allowed.remove(command.as_ref());
        }
    }

    /// Sorted snapshot of the allowlist.
    pub fn allowed_commands(&self) -> Vec<String> {
        self.allowed
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }
}
