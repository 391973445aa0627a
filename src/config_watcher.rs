//! Hot-reload watcher for the `[classification]` table in the config file.
//!
//! [`ConfigWatcher`] uses the `notify` crate to watch the config file. When
//! it changes, only the `[classification]` table is re-parsed (the rest of
//! [`GlobalConfig`](crate::GlobalConfig) is fixed for the process lifetime)
//! and the resulting rule set is swapped into the registry, which
//! reclassifies every cached entry.
//!
//! A table that fails to parse or contains an invalid pattern is logged and
//! the previous rules stay in effect.
//!
//! ## Usage
//!
//! ```no_run
//! # fn demo(registry: forcequit::orchestrator::registry::ProcessRegistry) -> forcequit::Result<()> {
//! use std::path::Path;
//! use forcequit::config_watcher::ConfigWatcher;
//!
//! let _watcher = ConfigWatcher::new(Path::new("forcequit.toml"), registry)?;
//! # Ok(())
//! # }
//! ```

use std::path::{Path, PathBuf};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Deserialize;
use tracing::{info, warn};

use crate::config::ClassificationConfig;
use crate::models::classification::ClassificationRule;
use crate::orchestrator::registry::ProcessRegistry;
use crate::{AppError, Result};

/// Minimal TOML structure used for hot-reload parsing.
///
/// Only `[classification]` is extracted; other tables are ignored.
#[derive(Debug, Deserialize)]
struct ClassificationOnlyConfig {
    #[serde(default)]
    classification: ClassificationConfig,
}

/// Parse only the `[classification]` table from a TOML file and build its
/// rule set.
///
/// # Errors
///
/// Returns `AppError::Config` if the file cannot be read, the TOML is
/// invalid, or a pattern does not compile.
pub fn load_classification_rule(path: &Path) -> Result<ClassificationRule> {
    let raw = std::fs::read_to_string(path).map_err(|err| {
        AppError::Config(format!(
            "failed to read config for classification reload: {err}"
        ))
    })?;
    let parsed: ClassificationOnlyConfig = toml::from_str(&raw).map_err(|err| {
        AppError::Config(format!(
            "failed to parse classification table from config: {err}"
        ))
    })?;
    parsed.classification.build_rule()
}

/// Returns `true` for file-system events that touch `target`.
fn is_config_change(event: &Event, target: &Path) -> bool {
    matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_))
        && event
            .paths
            .iter()
            .any(|p| p.file_name() == target.file_name())
}

/// Keeps a `notify` watch alive and swaps classification rules on change.
///
/// Dropping the watcher stops the underlying OS watch.
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
    path: PathBuf,
}

impl ConfigWatcher {
    /// Start watching `config_path`, pushing reloaded rules into `registry`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the `notify` watcher cannot be created
    /// or the path cannot be watched.
    pub fn new(config_path: &Path, registry: ProcessRegistry) -> Result<Self> {
        let path_for_callback = config_path.to_path_buf();

        let mut watcher = notify::recommended_watcher(
            move |result: std::result::Result<Event, notify::Error>| match result {
                Ok(event) if is_config_change(&event, &path_for_callback) => {
                    match load_classification_rule(&path_for_callback) {
                        Ok(rule) => {
                            let changed = registry.set_rules(rule);
                            info!(
                                path = %path_for_callback.display(),
                                changed,
                                "hot-reloaded classification rules"
                            );
                        }
                        Err(err) => {
                            warn!(
                                %err,
                                path = %path_for_callback.display(),
                                "failed to reload classification rules, keeping previous rules"
                            );
                        }
                    }
                }
                Err(err) => warn!(%err, "config file watcher error"),
                _ => {}
            },
        )
        .map_err(|err| AppError::Config(format!("failed to create config file watcher: {err}")))?;

        // Watch the parent directory so write-to-temp-then-rename saves are seen.
        let watch_target = config_path
            .parent()
            .filter(|p| p != &Path::new(""))
            .unwrap_or(config_path);

        watcher
            .watch(watch_target, RecursiveMode::NonRecursive)
            .map_err(|err| {
                AppError::Config(format!(
                    "failed to watch config path '{}': {err}",
                    watch_target.display()
                ))
            })?;

        info!(path = %config_path.display(), "config watcher started");

        Ok(Self {
            _watcher: watcher,
            path: config_path.to_path_buf(),
        })
    }

    /// Path of the watched config file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}
