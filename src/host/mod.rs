//! Host collaborator abstractions.
//!
//! The orchestrator never touches the operating system directly. Process
//! enumeration, signalling and launching go through [`ProcessHost`]; own
//! resource usage and thermal/power state through [`ResourceSampler`].
//! [`system`] provides implementations backed by `sysinfo` and `nix`.

pub mod system;

use std::future::Future;
use std::pin::Pin;

use tokio::sync::mpsc;

use crate::models::process::HostProcessRecord;
use crate::Result;

/// Kind of termination signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    /// Ask the process to exit and clean up (`SIGTERM`).
    Graceful,
    /// Terminate unconditionally (`SIGKILL`).
    Force,
}

/// Launch/exit notification pushed by the host.
#[derive(Debug, Clone, PartialEq)]
pub enum HostEvent {
    /// A process started.
    Launched(HostProcessRecord),
    /// A process exited.
    Exited {
        /// Process id that exited.
        pid: u32,
    },
}

/// Host-provided process-control surface.
pub trait ProcessHost: Send + Sync {
    /// Enumerate every running process.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Host`](crate::AppError::Host) if the host cannot
    /// be queried.
    fn enumerate(&self) -> Pin<Box<dyn Future<Output = Result<Vec<HostProcessRecord>>> + Send + '_>>;

    /// Deliver a graceful or forced termination signal.
    ///
    /// Signalling a process that has already exited is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Signal`](crate::AppError::Signal) if delivery fails.
    fn send_signal(
        &self,
        pid: u32,
        kind: SignalKind,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Launch a new instance identified by `owner_identifier`, returning its pid.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Launch`](crate::AppError::Launch) if the host
    /// refuses to start the process.
    fn launch(
        &self,
        owner_identifier: &str,
    ) -> Pin<Box<dyn Future<Output = Result<u32>> + Send + '_>>;

    /// Subscribe to launch/exit notifications.
    ///
    /// Notifications are best-effort; the registry reconciles periodically
    /// to catch anything coalesced or lost.
    fn subscribe(&self) -> mpsc::Receiver<HostEvent>;
}

/// The orchestrator's own resource usage.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SelfUsage {
    /// Resident memory in bytes.
    pub resident_bytes: u64,
    /// Recent CPU usage as a fraction of one core.
    pub cpu_fraction: f32,
}

/// Thermal / power state reported by the host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum HostPressure {
    /// No thermal or power constraints.
    #[default]
    Nominal,
    /// Elevated temperature or power-saving mode.
    Elevated,
    /// Critical thermal state.
    Critical,
}

/// Source of resource readings for the governor.
pub trait ResourceSampler: Send + Sync {
    /// Sample the orchestrator's own memory and CPU usage.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Host`](crate::AppError::Host) if the reading fails.
    fn sample_self(&self) -> Result<SelfUsage>;

    /// Current thermal / power pressure of the host.
    fn host_pressure(&self) -> HostPressure;
}
