#![forbid(unsafe_code)]

//! Process lifecycle and restart orchestration.
//!
//! Tracks running processes, classifies them as protected, unknown or
//! terminable, terminates them gracefully with bounded escalation, restarts
//! restart-capable ones with caller-supplied state capture and restore, and
//! throttles its own work when its footprint or the host is under pressure.

pub mod config;
pub mod config_watcher;
pub mod errors;
pub mod host;
pub mod models;
pub mod orchestrator;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
