//! Error types shared across the orchestrator.
//!
//! Only caller misuse and collaborator faults travel as [`AppError`].
//! Protocol outcomes (timeouts, rejected targets, failed relaunches) are
//! recorded as terminal states on the attempt or session instead.

use std::fmt::{Display, Formatter};

/// Shared orchestrator result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Error enumeration covering all failure modes that cross an API boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// The host process-control surface failed (enumeration, subscription).
    Host(String),
    /// A termination signal could not be delivered.
    Signal(String),
    /// The host could not launch a new process instance.
    Launch(String),
    /// A caller-supplied capture or restore hook failed.
    Hook(String),
    /// `restart` was called on a handle that is not restart-capable.
    NotRestartCapable(String),
    /// Requested entity does not exist.
    NotFound(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Host(msg) => write!(f, "host: {msg}"),
            Self::Signal(msg) => write!(f, "signal: {msg}"),
            Self::Launch(msg) => write!(f, "launch: {msg}"),
            Self::Hook(msg) => write!(f, "hook: {msg}"),
            Self::NotRestartCapable(msg) => write!(f, "not restart capable: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
