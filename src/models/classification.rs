//! Classification rules deciding which processes are protected.
//!
//! A rule set is immutable once built. Hot swapping replaces the whole
//! set through [`ProcessRegistry::set_rules`](crate::orchestrator::registry::ProcessRegistry::set_rules).

use std::collections::HashSet;

use regex::Regex;

use super::process::{Classification, HostProcessRecord};
use crate::{AppError, Result};

/// Essential processes preserved when no protected list is configured.
pub const DEFAULT_ESSENTIAL_PROCESSES: &[&str] = &[
    "kernel_task",
    "launchd",
    "kextcookied",
    "UserEventAgent",
    "com.apple.WebKit",
    "systemuiserver",
    "Dock",
    "Finder",
    "WindowServer",
    "loginwindow",
    "cfprefsd",
    "distnoted",
    "coreaudiod",
    "bluetoothd",
    "WiFiAgent",
    "airportd",
    "networkd",
    "configd",
    "mDNSResponder",
    "syslogd",
    "Terminal",
    "iTerm2",
];

/// Keywords that mark a process as part of the operating system.
pub const DEFAULT_SYSTEM_KEYWORDS: &[&str] = &[
    "system",
    "kernel",
    "apple",
    "security",
    "audio",
    "bluetooth",
    "wifi",
    "network",
    "login",
    "window",
    "dock",
    "finder",
    "spotlight",
    "notification",
];

/// A single name-or-identifier pattern.
///
/// Plain text matches as a case-insensitive substring, text containing
/// `*`, `?` or `[` as a case-insensitive glob, and a `re:` prefix as a
/// regular expression.
#[derive(Debug, Clone)]
pub enum Pattern {
    /// Lowercased substring.
    Substring(String),
    /// Shell-style glob.
    Glob(glob::Pattern),
    /// Regular expression.
    Regex(Regex),
}

impl Pattern {
    /// Parse a pattern from its configuration form.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` for empty patterns or invalid glob / regex
    /// syntax.
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(AppError::Config("classification pattern is empty".into()));
        }

        if let Some(expr) = trimmed.strip_prefix("re:") {
            let regex = Regex::new(expr)
                .map_err(|err| AppError::Config(format!("invalid regex pattern '{raw}': {err}")))?;
            return Ok(Self::Regex(regex));
        }

        if trimmed.contains(['*', '?', '[']) {
            let glob = glob::Pattern::new(&trimmed.to_lowercase())
                .map_err(|err| AppError::Config(format!("invalid glob pattern '{raw}': {err}")))?;
            return Ok(Self::Glob(glob));
        }

        Ok(Self::Substring(trimmed.to_lowercase()))
    }

    /// Whether the pattern matches a single candidate string.
    #[must_use]
    pub fn matches(&self, candidate: &str) -> bool {
        match self {
            Self::Substring(needle) => candidate.to_lowercase().contains(needle.as_str()),
            Self::Glob(glob) => glob.matches(&candidate.to_lowercase()),
            Self::Regex(regex) => regex.is_match(candidate),
        }
    }
}

/// Immutable caller-supplied rule set mapping patterns to classifications.
#[derive(Debug, Clone, Default)]
pub struct ClassificationRule {
    protected: Vec<Pattern>,
    unknown: Vec<Pattern>,
    protected_pids: HashSet<u32>,
    unknown_without_owner: bool,
}

impl ClassificationRule {
    /// Build a rule set from raw pattern strings.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if any pattern fails to parse.
    pub fn new<S: AsRef<str>>(protected: &[S], unknown: &[S]) -> Result<Self> {
        Ok(Self {
            protected: parse_all(protected)?,
            unknown: parse_all(unknown)?,
            protected_pids: HashSet::new(),
            unknown_without_owner: false,
        })
    }

    /// Rule set protecting the default essential processes and system keywords.
    #[must_use]
    pub fn essentials() -> Self {
        let protected = DEFAULT_ESSENTIAL_PROCESSES
            .iter()
            .chain(DEFAULT_SYSTEM_KEYWORDS)
            .map(|name| Pattern::Substring(name.to_lowercase()))
            .collect();
        Self {
            protected,
            ..Self::default()
        }
    }

    /// Always protect the given process ids, whatever their names.
    #[must_use]
    pub fn with_protected_pids(mut self, pids: impl IntoIterator<Item = u32>) -> Self {
        self.protected_pids.extend(pids);
        self
    }

    /// Treat processes without an owner identifier as `Unknown`.
    #[must_use]
    pub fn with_unknown_without_owner(mut self, enabled: bool) -> Self {
        self.unknown_without_owner = enabled;
        self
    }

    /// Classify one host record. Protected patterns win over unknown ones.
    #[must_use]
    pub fn classify(&self, record: &HostProcessRecord) -> Classification {
        self.classify_parts(record.pid, &record.name, record.owner_identifier.as_deref())
    }

    /// Classify from the individual identifying fields.
    #[must_use]
    pub fn classify_parts(
        &self,
        pid: u32,
        name: &str,
        owner_identifier: Option<&str>,
    ) -> Classification {
        let matches = |pattern: &Pattern| {
            pattern.matches(name) || owner_identifier.is_some_and(|owner| pattern.matches(owner))
        };

        if self.protected_pids.contains(&pid) || self.protected.iter().any(matches) {
            return Classification::Protected;
        }
        if self.unknown.iter().any(matches)
            || (self.unknown_without_owner && owner_identifier.is_none())
        {
            return Classification::Unknown;
        }
        Classification::Terminable
    }
}

fn parse_all<S: AsRef<str>>(raw: &[S]) -> Result<Vec<Pattern>> {
    raw.iter().map(|p| Pattern::parse(p.as_ref())).collect()
}

