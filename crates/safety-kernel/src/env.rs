//! Allowlist-based environment scrubbing for subprocess launches.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info};

/// Variables that may reach a child process unless configured otherwise.
pub const DEFAULT_ENV_ALLOWLIST: &[&str] = &[
    "PATH",
    "HOME",
    "USERPROFILE",
    "USER",
    "USERNAME",
    "LANG",
    "LC_ALL",
    "LC_CTYPE",
    "TERM",
    "TZ",
    "SHELL",
    "COMSPEC",
    "SYSTEMROOT",
    "WINDIR",
    "TEMP",
    "TMP",
    "TMPDIR",
    "VIRTUAL_ENV",
    "CONDA_PREFIX",
    "NODE_ENV",
    "PYTHONPATH",
    "PYTHONDONTWRITEBYTECODE",
];

/// Produces a minimal child-process environment.
///
/// Only allowlisted names pass through; task variables are injected last
/// and win over anything inherited.
#[derive(Debug, Clone)]
pub struct EnvironmentScrubber {
    allowlist: BTreeSet<String>,
}

impl Default for EnvironmentScrubber {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvironmentScrubber {
    /// Scrubber over [`DEFAULT_ENV_ALLOWLIST`].
    pub fn new() -> Self {
        Self::with_allowlist(DEFAULT_ENV_ALLOWLIST.iter().map(|k| k.to_string()))
    }

    /// Replace the default allowlist entirely.
    pub fn with_allowlist(allowlist: impl IntoIterator<Item = String>) -> Self {
        let allowlist: BTreeSet<String> = allowlist.into_iter().collect();
        info!(allowed = allowlist.len(), "environment scrubber initialized");
        Self { allowlist }
    }

    /// Extend the current allowlist (builder style).
    pub fn with_extra_allowed(mut self, extra: impl IntoIterator<Item = String>) -> Self {
        self.allowlist.extend(extra);
        self
    }

    /// Filter `source` down to the allowlist, then overlay `task_vars`.
    pub fn scrub<I, K, V>(
        &self,
        source: I,
        task_vars: Option<&BTreeMap<String, String>>,
    ) -> BTreeMap<String, String>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut clean = BTreeMap::new();
        let mut stripped = 0usize;

        for (key, value) in source {
            let key = key.into();
            if self.allowlist.contains(&key) {
                clean.insert(key, value.into());
            } else {
                stripped += 1;
            }
        }

        if let Some(vars) = task_vars {
            for (key, value) in vars {
                clean.insert(key.clone(), value.clone());
            }
        }

        if stripped > 0 {
            debug!(stripped, "scrubbed env vars before subprocess");
        }
        clean
    }

    /// [`Self::scrub`] over the current process environment.
    pub fn scrub_process_env(
        &self,
        task_vars: Option<&BTreeMap<String, String>>,
    ) -> BTreeMap<String, String> {
        // Non-UTF-8 entries are dropped.
        let vars = std::env::vars_os()
            .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)));
        self.scrub(vars, task_vars)
    }

    /// Whether `key` would survive a scrub.
    pub fn is_safe(&self, key: &str) -> bool {
        self.allowlist.contains(key)
    }

    /// Allow more keys in place.
    pub fn add_to_allowlist(&mut self, keys: impl IntoIterator<Item = String>) {
        self.allowlist.extend(keys);
    }

    /// Drop keys from the allowlist. Unknown keys are ignored.
    pub fn remove_from_allowlist<S: AsRef<str>>(&mut self, keys: impl IntoIterator<Item = S>) {
        for key in keys {
            self.allowlist.remove(key.as_ref());
        }
    }

    pub fn allowlist(&self) -> &BTreeSet<String> {
        &self.allowlist
    }
}
