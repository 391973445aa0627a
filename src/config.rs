//! Global configuration parsing and validation.
//!
//! Everything here is fixed for the orchestrator's lifetime except the
//! `[classification]` table, which [`ConfigWatcher`](crate::config_watcher::ConfigWatcher)
//! may hot-swap.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::models::classification::{
    ClassificationRule, DEFAULT_ESSENTIAL_PROCESSES, DEFAULT_SYSTEM_KEYWORDS,
};
use crate::orchestrator::governor::GovernorSettings;
use crate::orchestrator::registry::RegistrySettings;
use crate::orchestrator::restart::RestartSettings;
use crate::orchestrator::termination::{TerminationSettings, MIN_FORCE_SPACING};
use crate::{AppError, Result};

/// Upper bound for every wait and interval given in seconds (one day).
pub const MAX_WAIT_SECONDS: u64 = 24 * 60 * 60;

/// Upper bound for intervals given in milliseconds (one hour).
pub const MAX_INTERVAL_MILLIS: u64 = 60 * 60 * 1000;

/// Which processes are protected, unknown, or terminable.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ClassificationConfig {
    /// Protected patterns; the built-in essential list when omitted.
    #[serde(default)]
    pub protected: Option<Vec<String>>,
    /// Patterns excluded from bulk operations.
    #[serde(default)]
    pub unknown: Vec<String>,
    /// Treat processes without an owner identifier as unknown.
    #[serde(default)]
    pub unknown_without_owner: bool,
    /// Always protect the orchestrator's own pid and pid 1.
    #[serde(default = "default_true")]
    pub protect_self: bool,
}

impl Default for ClassificationConfig {
    fn default() -> Self {
        Self {
            protected: None,
            unknown: Vec::new(),
            unknown_without_owner: false,
            protect_self: true,
        }
    }
}

impl ClassificationConfig {
    /// Build the immutable rule set described by this table.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if a pattern is invalid.
    pub fn build_rule(&self) -> Result<ClassificationRule> {
        let protected: Vec<String> = self.protected.clone().unwrap_or_else(|| {
            DEFAULT_ESSENTIAL_PROCESSES
                .iter()
                .chain(DEFAULT_SYSTEM_KEYWORDS)
                .map(ToString::to_string)
                .collect()
        });

        let mut rule = ClassificationRule::new(&protected, &self.unknown)?
            .with_unknown_without_owner(self.unknown_without_owner);
        if self.protect_self {
            rule = rule.with_protected_pids([std::process::id(), 1]);
        }
        Ok(rule)
    }
}

/// Wait bounds for termination, relaunch, and caller hooks.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TimeoutConfig {
    /// Grace period after the graceful signal.
    #[serde(default = "default_grace_seconds")]
    pub grace_seconds: u64,
    /// Wait after the force signal.
    #[serde(default = "default_force_seconds")]
    pub force_seconds: u64,
    /// Wait for a relaunched process to appear.
    #[serde(default = "default_launch_seconds")]
    pub launch_seconds: u64,
    /// Bound on each capture / restore hook call.
    #[serde(default = "default_hook_seconds")]
    pub hook_seconds: u64,
    /// Minimum spacing between force-kill issuances.
    #[serde(default = "default_force_spacing_millis")]
    pub force_spacing_millis: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            grace_seconds: default_grace_seconds(),
            force_seconds: default_force_seconds(),
            launch_seconds: default_launch_seconds(),
            hook_seconds: default_hook_seconds(),
            force_spacing_millis: default_force_spacing_millis(),
        }
    }
}

/// Registry reconciliation and fan-out settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct RegistryConfig {
    /// Base reconciliation interval before throttle scaling.
    #[serde(default = "default_reconcile_seconds")]
    pub reconcile_seconds: u64,
    /// Per-subscriber event queue capacity.
    #[serde(default = "default_subscriber_queue")]
    pub subscriber_queue: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            reconcile_seconds: default_reconcile_seconds(),
            subscriber_queue: default_subscriber_queue(),
        }
    }
}

/// Resource governor thresholds.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GovernorConfig {
    /// Fixed sampling interval; not subject to throttling.
    #[serde(default = "default_sample_millis")]
    pub sample_millis: u64,
    /// Own resident memory above which the level is `Constrained`.
    #[serde(default = "default_warning_bytes")]
    pub warning_bytes: u64,
    /// Own resident memory above which the level is `Emergency`.
    #[serde(default = "default_emergency_bytes")]
    pub emergency_bytes: u64,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            sample_millis: default_sample_millis(),
            warning_bytes: default_warning_bytes(),
            emergency_bytes: default_emergency_bytes(),
        }
    }
}

/// Restart engine settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct RestartConfig {
    /// Number of finished sessions kept for inspection.
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
    /// Owner identifiers known to support restart.
    #[serde(default)]
    pub capable: Vec<String>,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            history_capacity: default_history_capacity(),
            capable: Vec::new(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_grace_seconds() -> u64 {
    10
}

fn default_force_seconds() -> u64 {
    2
}

fn default_launch_seconds() -> u64 {
    10
}

fn default_hook_seconds() -> u64 {
    10
}

fn default_force_spacing_millis() -> u64 {
    100
}

fn default_reconcile_seconds() -> u64 {
    5
}

fn default_subscriber_queue() -> usize {
    256
}

fn default_sample_millis() -> u64 {
    2000
}

fn default_warning_bytes() -> u64 {
    256 * 1024 * 1024
}

fn default_emergency_bytes() -> u64 {
    512 * 1024 * 1024
}

fn default_history_capacity() -> usize {
    32
}

/// Global configuration parsed from `forcequit.toml`.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Classification rule source.
    #[serde(default)]
    pub classification: ClassificationConfig,
    /// Termination, relaunch and hook deadlines.
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Registry reconciliation settings.
    #[serde(default)]
    pub registry: RegistryConfig,
    /// Governor thresholds.
    #[serde(default)]
    pub governor: GovernorConfig,
    /// Restart engine settings.
    #[serde(default)]
    pub restart: RestartConfig,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse and validate configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Registry settings with durations resolved.
    #[must_use]
    pub fn registry_settings(&self) -> RegistrySettings {
        RegistrySettings {
            base_interval: Duration::from_secs(self.registry.reconcile_seconds),
            subscriber_queue: self.registry.subscriber_queue,
        }
    }

    /// Termination settings with durations resolved.
    #[must_use]
    pub fn termination_settings(&self) -> TerminationSettings {
        TerminationSettings {
            grace_period: Duration::from_secs(self.timeouts.grace_seconds),
            force_timeout: Duration::from_secs(self.timeouts.force_seconds),
            force_spacing: Duration::from_millis(self.timeouts.force_spacing_millis),
        }
    }

    /// Governor settings with durations resolved.
    #[must_use]
    pub fn governor_settings(&self) -> GovernorSettings {
        GovernorSettings {
            sample_interval: Duration::from_millis(self.governor.sample_millis),
            warning_bytes: self.governor.warning_bytes,
            emergency_bytes: self.governor.emergency_bytes,
        }
    }

    /// Restart settings with durations resolved.
    #[must_use]
    pub fn restart_settings(&self) -> RestartSettings {
        RestartSettings {
            launch_timeout: Duration::from_secs(self.timeouts.launch_seconds),
            hook_timeout: Duration::from_secs(self.timeouts.hook_seconds),
            history_capacity: self.restart.history_capacity,
            capable: self.restart.capable.iter().cloned().collect(),
        }
    }

    fn validate(&self) -> Result<()> {
        let timeouts = &self.timeouts;
        for (name, value) in [
            ("grace_seconds", timeouts.grace_seconds),
            ("force_seconds", timeouts.force_seconds),
            ("launch_seconds", timeouts.launch_seconds),
            ("hook_seconds", timeouts.hook_seconds),
            ("reconcile_seconds", self.registry.reconcile_seconds),
            ("sample_millis", self.governor.sample_millis),
        ] {
            if value == 0 {
                return Err(AppError::Config(format!("{name} must be greater than zero")));
            }
        }

        for (name, value) in [
            ("grace_seconds", timeouts.grace_seconds),
            ("force_seconds", timeouts.force_seconds),
            ("launch_seconds", timeouts.launch_seconds),
            ("hook_seconds", timeouts.hook_seconds),
            ("reconcile_seconds", self.registry.reconcile_seconds),
        ] {
            if value > MAX_WAIT_SECONDS {
                return Err(AppError::Config(format!(
                    "{name} must be at most {MAX_WAIT_SECONDS}"
                )));
            }
        }
        if self.governor.sample_millis > MAX_INTERVAL_MILLIS
            || timeouts.force_spacing_millis > MAX_INTERVAL_MILLIS
        {
            return Err(AppError::Config(format!(
                "sample_millis and force_spacing_millis must be at most {MAX_INTERVAL_MILLIS}"
            )));
        }

        if Duration::from_millis(timeouts.force_spacing_millis) < MIN_FORCE_SPACING {
            return Err(AppError::Config(format!(
                "force_spacing_millis must be at least {}",
                MIN_FORCE_SPACING.as_millis()
            )));
        }

        if self.governor.warning_bytes >= self.governor.emergency_bytes {
            return Err(AppError::Config(
                "warning_bytes must be lower than emergency_bytes".into(),
            ));
        }

        if self.registry.subscriber_queue == 0 {
            return Err(AppError::Config(
                "subscriber_queue must be greater than zero".into(),
            ));
        }

        if self.restart.history_capacity == 0 {
            return Err(AppError::Config(
                "history_capacity must be greater than zero".into(),
            ));
        }

        self.classification.build_rule()?;
        Ok(())
    }
}
