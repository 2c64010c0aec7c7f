//! Neutralises active markup in text flowing to or from a model, and
//! recognises prompt-injection phrasing.
//!
//! The injection phrase table is versioned: bump
//! [`INJECTION_TABLE_VERSION`] whenever an entry is added, removed or
//! tightened so logged findings can be tied to the table that made them.

use regex::Regex;

use crate::error::{compile, KernelResult};

const MARKUP_RULES: &[(&str, &str, &str)] = &[
    (
        "script_tag",
        r"(?is)<\s*script\b[^>]*>.*?<\s*/\s*script\s*>",
        "[SCRIPT_REMOVED]",
    ),
    (
        "iframe_tag",
        r"(?is)<\s*iframe\b[^>]*>.*?<\s*/\s*iframe\s*>",
        "[IFRAME_REMOVED]",
    ),
    ("javascript_uri", r"(?i)javascript\s*:", "[JS_REMOVED]"),
    (
        "event_handler",
        r#"(?i)\bon\w+\s*=\s*["'][^"']+["']"#,
        "[EVENT_REMOVED]",
    ),
    ("null_byte", r"\x00", ""),
];

/// Revision of [`INJECTION_RULES`] and [`OVERRIDE_INDICATORS`].
pub const INJECTION_TABLE_VERSION: u32 = 1;

/// Known instruction-override phrasing in inbound text.
pub const INJECTION_RULES: &[(&str, &str)] = &[
    ("ignore_previous", r"(?i)\bignore\s+(?:all\s+)?previous\s+instructions?"),
    ("disregard_prior", r"(?i)\bdisregard\s+(?:all\s+)?prior\s+instructions?"),
    ("forget_previous", r"(?i)\bforget\s+(?:all\s+)?(?:previous|prior)\s+instructions?"),
    ("ignore_above", r"(?i)\bignore\s+(?:everything|all)\s+(?:above|before)"),
    ("system_prompt_claim", r"(?i)\bsystem\s+prompt\s+is\b"),
    ("instructions_claim", r"(?i)\byour\s+instructions\s+are\b"),
    ("act_as_if", r"(?i)\bact\s+as\s+if\b"),
    ("pretend", r"(?i)\bpretend\s+(?:you\s+are|to\s+be)\b"),
    ("jailbreak", r"(?i)\bjailbreak"),
    ("developer_mode", r"(?i)\bdeveloper\s+mode\b"),
    ("sudo_mode", r"(?i)\bsudo\s+mode\b"),
    ("assistant_mode_off", r"(?i)\bassistant\s+mode\s+(?:off|disable)"),
    ("system_tag", r"(?i)<\s*system\s*>"),
    ("instruction_tag", r"(?i)<\s*/?\s*instruction\s*>"),
    ("reveal_prompt", r"(?i)\breveal\s+(?:your\s+)?(?:system|hidden|secret)\s+prompt"),
    ("ask_instructions", r"(?i)\bwhat\s+are\s+your\s+(?:system\s+)?instructions"),
    ("repeat_above", r"(?i)\brepeat\s+(?:the\s+)?text\s+above"),
    (
        "translate_instructions",
        r"(?i)\btranslate\s+(?:the\s+)?(?:previous|above|system)\s+(?:text|instructions?)\s+to",
    ),
    ("initialization_dump", r"(?i)\boutput\s+(?:the\s+)?initialization"),
];

/// Phrases in model output that indicate its instructions were overridden.
/// Matched case-insensitively as plain substrings.
pub const OVERRIDE_INDICATORS: &[(&str, &str)] = &[
    ("system_prompt_leak", "system prompt"),
    ("ai_will_now", "as an ai, i will now"),
    ("ignoring_instructions", "ignoring previous instructions"),
    ("developer_mode_activated", "developer mode activated"),
    ("dan_mode", "dan mode"),
    ("jailbreak_successful", "jailbreak successful"),
];

const INJECTION_REPLACEMENT: &str = "[REDACTED]";

/// More than this many `<` or `>` in one input and all of them are dropped.
pub const MAX_ANGLE_BRACKETS: usize = 5;

/// Result of one sanitize pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sanitized {
    pub text: String,
    /// Rules that rewrote something, in application order.
    pub stripped: Vec<&'static str>,
}

impl Sanitized {
    pub fn changed(&self) -> bool {
        !self.stripped.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct Sanitizer {
    rules: Vec<(&'static str, Regex, &'static str)>,
    injection: Vec<(&'static str, Regex)>,
}

impl Sanitizer {
    pub fn new() -> KernelResult<Self> {
        let rules = MARKUP_RULES
            .iter()
            .map(|&(name, pattern, replacement)| Ok((name, compile(name, pattern)?, replacement)))
            .collect::<KernelResult<Vec<_>>>()?;
        let injection = INJECTION_RULES
            .iter()
            .map(|&(name, pattern)| Ok((name, compile(name, pattern)?)))
            .collect::<KernelResult<Vec<_>>>()?;
        Ok(Self { rules, injection })
    }

    pub fn sanitize(&self, text: &str) -> Sanitized {
        let mut out = text.to_string();
        let mut stripped = Vec::new();
        for (name, regex, replacement) in &self.rules {
            if regex.is_match(&out) {
                out = regex.replace_all(&out, *replacement).into_owned();
                stripped.push(*name);
            }
        }
        Sanitized {
            text: out,
            stripped,
        }
    }

    /// Redact injection phrasing from inbound text. Runs after
    /// [`Self::sanitize`]; `stripped` names the injection rules that fired,
    /// plus `excessive_angle_brackets` when brackets were dropped.
    pub fn neutralize_injection(&self, text: &str) -> Sanitized {
        let mut out = text.to_string();
        let mut stripped = Vec::new();
        for (name, regex) in &self.injection {
            if regex.is_match(&out) {
                out = regex.replace_all(&out, INJECTION_REPLACEMENT).into_owned();
                stripped.push(*name);
            }
        }

        let opening = out.matches('<').count();
        let closing = out.matches('>').count();
        if opening > MAX_ANGLE_BRACKETS || closing > MAX_ANGLE_BRACKETS {
            out.retain(|c| c != '<' && c != '>');
            stripped.push("excessive_angle_brackets");
        }

        Sanitized {
            text: out,
            stripped,
        }
    }

    /// Override indicators present in model output, by name.
    pub fn override_indicators(&self, text: &str) -> Vec<&'static str> {
        let lower = text.to_lowercase();
        OVERRIDE_INDICATORS
            .iter()
            .filter(|(_, phrase)| lower.contains(phrase))
            .map(|&(name, _)| name)
            .collect()
    }
}
