//! Host implementations backed by `sysinfo` (enumeration, usage),
//! `nix` (signals) and `tokio::process` (launch).
//!
//! Launch/exit notifications are produced by diffing successive
//! enumerations, so closely spaced events coalesce exactly as they do with
//! native host notification centers.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use sysinfo::{Components, Pid, ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{HostEvent, HostPressure, ProcessHost, ResourceSampler, SelfUsage, SignalKind};
use crate::models::process::HostProcessRecord;
use crate::{AppError, Result};

/// Interval between enumerations used to synthesize launch/exit events.
const NOTIFY_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Capacity of each notification channel handed out by `subscribe`.
const NOTIFY_QUEUE_CAPACITY: usize = 256;

/// Fraction of a component's critical temperature treated as elevated.
const ELEVATED_TEMPERATURE_RATIO: f32 = 0.85;

/// Process-control surface for the local machine.
pub struct SystemHost {
    system: Arc<Mutex<System>>,
    cancel: CancellationToken,
}

impl SystemHost {
    /// Create a host surface. Notification pollers stop when `cancel` fires.
    #[must_use]
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            system: Arc::new(Mutex::new(System::new())),
            cancel,
        }
    }
}

/// Refresh every process and convert the table into host records.
fn collect_records(system: &Mutex<System>) -> Vec<HostProcessRecord> {
    let mut guard = system.lock().unwrap_or_else(PoisonError::into_inner);
    guard.refresh_processes_specifics(
        ProcessesToUpdate::All,
        true,
        ProcessRefreshKind::new()
            .with_memory()
            .with_cpu()
            .with_exe(UpdateKind::OnlyIfNotSet),
    );

    guard
        .processes()
        .iter()
        .map(|(pid, process)| HostProcessRecord {
            pid: pid.as_u32(),
            name: process.name().to_string_lossy().into_owned(),
            owner_identifier: process.exe().map(|path| path.to_string_lossy().into_owned()),
            resident_bytes: process.memory(),
            cpu_fraction: process.cpu_usage() / 100.0,
        })
        .collect()
}

async fn enumerate_blocking(system: Arc<Mutex<System>>) -> Result<Vec<HostProcessRecord>> {
    tokio::task::spawn_blocking(move || collect_records(&system))
        .await
        .map_err(|err| AppError::Host(format!("enumeration task panicked: {err}")))
}

impl ProcessHost for SystemHost {
    fn enumerate(&self) -> Pin<Box<dyn Future<Output = Result<Vec<HostProcessRecord>>> + Send + '_>> {
        Box::pin(enumerate_blocking(Arc::clone(&self.system)))
    }

    fn send_signal(
        &self,
        pid: u32,
        kind: SignalKind,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move { deliver_signal(pid, kind) })
    }

    fn launch(
        &self,
        owner_identifier: &str,
    ) -> Pin<Box<dyn Future<Output = Result<u32>> + Send + '_>> {
        let program = owner_identifier.to_owned();
        Box::pin(async move {
            let child = Command::new(&program)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn()
                .map_err(|err| AppError::Launch(format!("failed to launch {program}: {err}")))?;

            let pid = child
                .id()
                .ok_or_else(|| AppError::Launch(format!("{program} exited before reporting a pid")))?;
            info!(pid, program, "launched process");
            Ok(pid)
        })
    }

    fn subscribe(&self) -> mpsc::Receiver<HostEvent> {
        let (tx, rx) = mpsc::channel(NOTIFY_QUEUE_CAPACITY);
        let system = Arc::clone(&self.system);
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let mut baseline = PollBaseline::default();

            loop {
                let polled = enumerate_blocking(Arc::clone(&system)).await;
                for event in baseline.apply(polled) {
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }

                tokio::select! {
                    () = cancel.cancelled() => {
                        debug!("host notification poller shutting down");
                        return;
                    }
                    () = tokio::time::sleep(NOTIFY_POLL_INTERVAL) => {}
                }
            }
        });

        rx
    }
}

/// Last successful enumeration, diffed against each new poll.
#[derive(Debug, Default)]
struct PollBaseline {
    known: HashMap<u32, HostProcessRecord>,
    primed: bool,
}

impl PollBaseline {
    /// Fold one poll into the baseline and return the launch/exit events it
    /// implies. A failed poll leaves the baseline untouched.
    fn apply(&mut self, polled: Result<Vec<HostProcessRecord>>) -> Vec<HostEvent> {
        let records = match polled {
            Ok(records) => records,
            Err(err) => {
                warn!(%err, "host notification poll failed, keeping previous baseline");
                return Vec::new();
            }
        };
        let current: HashMap<u32, HostProcessRecord> =
            records.into_iter().map(|r| (r.pid, r)).collect();

        let mut events = Vec::new();
        // The first successful poll only establishes the baseline.
        if self.primed {
            events.extend(
                current
                    .iter()
                    .filter(|(pid, _)| !self.known.contains_key(pid))
                    .map(|(_, record)| HostEvent::Launched(record.clone())),
            );
            events.extend(
                self.known
                    .keys()
                    .filter(|pid| !current.contains_key(pid))
                    .map(|pid| HostEvent::Exited { pid: *pid }),
            );
        }
        self.known = current;
        self.primed = true;
        events
    }
}

#[cfg(unix)]
fn deliver_signal(pid: u32, kind: SignalKind) -> Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};

    let raw = i32::try_from(pid)
        .map_err(|_| AppError::Signal(format!("pid {pid} out of range")))?;
    let signal = match kind {
        SignalKind::Graceful => Signal::SIGTERM,
        SignalKind::Force => Signal::SIGKILL,
    };

    match kill(nix::unistd::Pid::from_raw(raw), signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(err) => Err(AppError::Signal(format!("{signal} to pid {pid} failed: {err}"))),
    }
}

#[cfg(not(unix))]
fn deliver_signal(pid: u32, kind: SignalKind) -> Result<()> {
    Err(AppError::Signal(format!(
        "{kind:?} signal to pid {pid} is not supported on this platform"
    )))
}

/// Resource sampler for the current process and the machine's sensors.
pub struct SystemSampler {
    system: Mutex<System>,
    components: Mutex<Components>,
    pid: Pid,
}

impl Default for SystemSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemSampler {
    /// Sampler for the calling process.
    #[must_use]
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
            components: Mutex::new(Components::new_with_refreshed_list()),
            pid: Pid::from_u32(std::process::id()),
        }
    }
}

impl ResourceSampler for SystemSampler {
    fn sample_self(&self) -> Result<SelfUsage> {
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[self.pid]),
            false,
            ProcessRefreshKind::new().with_memory().with_cpu(),
        );

        let process = system
            .process(self.pid)
            .ok_or_else(|| AppError::Host("own process missing from process table".into()))?;

        Ok(SelfUsage {
            resident_bytes: process.memory(),
            cpu_fraction: process.cpu_usage() / 100.0,
        })
    }

    fn host_pressure(&self) -> HostPressure {
        let mut components = self.components.lock().unwrap_or_else(PoisonError::into_inner);
        components.refresh();

        components
            .list()
            .iter()
            .filter_map(|component| {
                let critical = component.critical()?;
                let temperature = component.temperature();
                if !temperature.is_finite() || critical <= 0.0 {
                    return None;
                }
                Some(if temperature >= critical {
                    HostPressure::Critical
                } else if temperature >= critical * ELEVATED_TEMPERATURE_RATIO {
                    HostPressure::Elevated
                } else {
                    HostPressure::Nominal
                })
            })
            .max()
            .unwrap_or_default()
    }
}
