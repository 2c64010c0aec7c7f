//! Subscriber setup for hosts that embed the kernel, driven by the
//! `[telemetry]` section of the policy file.
//!
//! Decision events (`check.*`, `budget.alert`, `approval.required`,
//! `injection.detected`) are all emitted under the `safety_kernel` target,
//! so `decisions_only` narrows the output to the kernel's audit trail.

use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::error::{KernelError, KernelResult};

/// Line format of the installed subscriber.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Text,
    /// Newline-delimited JSON, one object per event.
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TelemetrySection {
    pub format: LogFormat,
    /// Verbosity when `RUST_LOG` is unset: `error` through `trace`, or `off`.
    pub level: String,
    /// Silence every target except the kernel's own.
    pub decisions_only: bool,
}

impl Default for TelemetrySection {
    fn default() -> Self {
        Self {
            format: LogFormat::Text,
            level: "info".to_string(),
            decisions_only: false,
        }
    }
}

impl TelemetrySection {
    /// Filter directives used when `RUST_LOG` is unset.
    pub fn directives(&self) -> KernelResult<String> {
        let level: LevelFilter = self.level.parse().map_err(|_| {
            KernelError::InvalidConfig(format!("telemetry.level '{}' is not a level", self.level))
        })?;
        let level = level.to_string().to_lowercase();
        Ok(if self.decisions_only {
            format!("off,{}={level}", env!("CARGO_CRATE_NAME"))
        } else {
            level
        })
    }
}

/// Install the global subscriber described by `settings`.
///
/// `RUST_LOG` wins over the configured directives. Returns `Ok(false)` when
/// a subscriber was already installed; only the first call in a process
/// takes effect.
pub fn init_tracing(settings: &TelemetrySection) -> KernelResult<bool> {
    let directives = settings.directives()?;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&directives));

    let registry = tracing_subscriber::registry().with(env_filter);
    let installed = match settings.format {
        LogFormat::Json => registry
            .with(fmt::layer().with_target(true).json())
            .try_init()
            .is_ok(),
        LogFormat::Text => registry.with(fmt::layer().with_target(true)).try_init().is_ok(),
    };
    if installed {
        tracing::debug!(format = ?settings.format, directives = %directives, "tracing initialized");
    }
    Ok(installed)
}
