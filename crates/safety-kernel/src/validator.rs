//! Structural validation of tool-call parameters.

use std::collections::HashMap;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{compile, KernelResult};
use crate::verdict::{Component, SafetyResult, SafetyViolation, Severity};

/// Default upper bound on a string parameter, in characters.
pub const DEFAULT_MAX_PARAM_LENGTH: usize = 10_000;

/// Uncompiled tool-call schema, as written in a policy file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallSpecDef {
    pub name: String,
    #[serde(default)]
    pub required_params: Vec<String>,
    #[serde(default = "default_max_param_length")]
    pub max_param_length: usize,
    #[serde(default)]
    pub forbidden_param_values: Vec<String>,
}

fn default_max_param_length() -> usize {
    DEFAULT_MAX_PARAM_LENGTH
}

/// Schema for one tool's parameters.
#[derive(Debug, Clone)]
pub struct ToolCallSpec {
    name: String,
    required_params: Vec<String>,
    max_param_length: usize,
    forbidden_param_values: Vec<Regex>,
}

impl ToolCallSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required_params: Vec::new(),
            max_param_length: DEFAULT_MAX_PARAM_LENGTH,
            forbidden_param_values: Vec::new(),
        }
    }

    pub fn from_def(def: &ToolCallSpecDef) -> KernelResult<Self> {
        let mut spec = Self::new(def.name.clone())
            .require(def.required_params.iter().cloned())
            .max_param_length(def.max_param_length);
        for pattern in &def.forbidden_param_values {
            spec = spec.forbid(pattern)?;
        }
        Ok(spec)
    }

    pub fn require<I, S>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_params.extend(params.into_iter().map(Into::into));
        self
    }

    pub fn max_param_length(mut self, max: usize) -> Self {
        self.max_param_length = max;
        self
    }

    /// Reject any parameter whose value matches `pattern`.
    pub fn forbid(mut self, pattern: &str) -> KernelResult<Self> {
        let name = format!("{}.forbidden", self.name);
        self.forbidden_param_values.push(compile(&name, pattern)?);
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Checks tool-call parameters against registered specs.
///
/// Tools without a spec pass; access control is the policy layer's job.
#[derive(Debug, Clone, Default)]
pub struct Validator {
    specs: HashMap<String, ToolCallSpec>,
}

impl Validator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_spec(&mut self, spec: ToolCallSpec) {
        self.specs.insert(spec.name.clone(), spec);
    }

    pub fn spec(&self, tool_name: &str) -> Option<&ToolCallSpec> {
        self.specs.get(tool_name)
    }

    pub fn validate_tool_call(&self, tool_name: &str, params: &Value) -> SafetyResult {
        let mut result = SafetyResult::safe();
        let Some(spec) = self.specs.get(tool_name) else {
            return result;
        };

        let Some(params) = params.as_object() else {
            result.add(violation(
                Severity::High,
                "params_not_object",
                format!("Parameters for tool '{tool_name}' must be an object"),
            ));
            return result;
        };

        for required in &spec.required_params {
            if !params.contains_key(required) {
                result.add(violation(
                    Severity::Medium,
                    "missing_required_param",
                    format!("Missing required param '{required}' for tool '{tool_name}'"),
                ));
            }
        }

        for (key, value) in params {
            if let Value::String(s) = value {
                let len = s.chars().count();
                if len > spec.max_param_length {
                    result.add(violation(
                        Severity::High,
                        "param_too_long",
                        format!(
                            "Param '{key}' exceeds max length ({len} > {})",
                            spec.max_param_length
                        ),
                    ));
                }
            }

            let text = joined_params(value);
            for pattern in &spec.forbidden_param_values {
                if pattern.is_match(&text) {
                    result.add(violation(
                        Severity::High,
                        "forbidden_param_value",
                        format!("Forbidden value pattern in param '{key}'"),
                    ));
                }
            }
        }

        result
    }
}

/// Every scalar leaf under `params` joined by spaces, depth first.
///
/// Nested objects and arrays are flattened so that `{"argv": ["rm", "-rf", "/"]}`
/// reads as `rm -rf /` to the pattern matchers. Nulls contribute nothing.
pub(crate) fn joined_params(params: &Value) -> String {
    param_leaves(params).join(" ")
}

/// Scalar leaves under `params`, in key order.
pub(crate) fn param_leaves(params: &Value) -> Vec<String> {
    let mut leaves = Vec::new();
    collect_leaves(params, &mut leaves);
    leaves
}

fn collect_leaves(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::Null => {}
        Value::String(s) => out.push(s.clone()),
        Value::Bool(_) | Value::Number(_) => out.push(value.to_string()),
        Value::Array(items) => items.iter().for_each(|item| collect_leaves(item, out)),
        Value::Object(map) => map.values().for_each(|item| collect_leaves(item, out)),
    }
}

fn violation(severity: Severity, rule: &str, message: String) -> SafetyViolation {
    SafetyViolation::blocking(Component::Validator, severity, rule, message)
}
