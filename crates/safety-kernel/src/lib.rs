//! Agent action safety kernel.
//!
//! Mediates every action an autonomous agent attempts (shell commands, file
//! access, outbound requests, tool calls, emitted text) and decides whether
//! it may proceed. Outcomes are values; construction and policy-file errors
//! are [`KernelError`]s.

pub mod clock;
pub mod command;
pub mod config;
pub mod cost;
pub mod env;
pub mod error;
pub mod gating;
pub mod kernel;
pub mod metrics;
pub mod network;
pub mod obs;
pub mod policy;
pub mod sandbox;
pub mod sanitizer;
pub mod secrets;
pub mod telemetry;
pub mod validator;
pub mod verdict;
pub mod workspace;

pub use clock::{Clock, ManualClock, SystemClock};
pub use command::{base_command, split_words, CommandValidator, TokenizeError, BLOCKLIST};
pub use config::KernelConfig;
pub use cost::{CostBudget, CostGuard, UsageRecord, UsageSnapshot};
pub use env::EnvironmentScrubber;
pub use error::{KernelError, KernelResult};
pub use gating::{AgentToolPolicy, ToolGatekeeper, ToolTrustEntry, TrustLevel};
pub use kernel::{AgentAction, AgentRegistration, KernelBuilder, SafetyKernel};
pub use metrics::MetricsSnapshot;
pub use network::{NetworkGuard, Resolver, StaticResolver, SystemResolver};
pub use policy::{AgentPolicy, AgentPolicyDef, PolicyEngine};
pub use sandbox::{SandboxConfig, SandboxConfigSpec, SandboxLevel, SandboxPolicy};
pub use sanitizer::{Sanitizer, INJECTION_TABLE_VERSION};
pub use secrets::{LeakPattern, PatternDef, SecretScanner};
pub use telemetry::{init_tracing, LogFormat, TelemetrySection};
pub use validator::{ToolCallSpec, ToolCallSpecDef, Validator};
pub use verdict::{
    CommandDecision, Component, Decision, GatingDecision, PolicyDecision, SafetyResult,
    SafetyViolation, Severity,
};
pub use workspace::{ScopeError, WorkspaceScope};

/// Crate version, for embedding hosts that log it at startup.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
