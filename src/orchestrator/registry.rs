//! Process registry: the orchestrator's view of running processes.
//!
//! Kept current two ways: host launch/exit notifications applied as they
//! arrive, and a periodic reconciliation scan that catches anything the
//! host coalesced or lost. The scan interval is the base interval scaled by
//! the current throttle level. A process missing from two consecutive scans
//! is removed.
//!
//! The registry is the only writer of the process map. Classification is
//! computed once per new entry and recomputed for every entry when the rule
//! set is swapped.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::events::{EventHub, EventStream};
use super::governor::ThrottleReader;
use crate::host::{HostEvent, ProcessHost};
use crate::models::classification::ClassificationRule;
use crate::models::process::{Classification, HostProcessRecord, ProcessEvent, ProcessHandle};

/// Consecutive scans a known process may be missing before it is removed.
pub const MISSED_SCANS_BEFORE_REMOVAL: u8 = 2;

/// Ceiling on the throttle-scaled reconciliation interval.
pub const MAX_RECONCILE_INTERVAL: Duration = Duration::from_secs(4 * 24 * 60 * 60);

/// Registry settings with durations resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrySettings {
    /// Reconciliation interval at `ThrottleLevel::Normal`.
    pub base_interval: Duration,
    /// Per-subscriber event queue capacity.
    pub subscriber_queue: usize,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            base_interval: Duration::from_secs(5),
            subscriber_queue: 256,
        }
    }
}

#[derive(Debug)]
struct Entry {
    handle: ProcessHandle,
    missed_scans: u8,
}

#[derive(Debug, Default)]
struct RegistryState {
    entries: HashMap<u32, Entry>,
    /// Exit times of recently exited pids, so a scan taken before the exit
    /// cannot resurrect them.
    exited: HashMap<u32, Instant>,
}

struct Inner {
    host: Arc<dyn ProcessHost>,
    settings: RegistrySettings,
    throttle: ThrottleReader,
    state: Mutex<RegistryState>,
    rules: RwLock<Arc<ClassificationRule>>,
    events: EventHub<ProcessEvent>,
}

/// Shared handle to the process registry. Cloning is cheap.
#[derive(Clone)]
pub struct ProcessRegistry {
    inner: Arc<Inner>,
}

impl ProcessRegistry {
    /// Construct an empty registry. Call [`spawn`](Self::spawn) to start it.
    #[must_use]
    pub fn new(
        host: Arc<dyn ProcessHost>,
        rules: ClassificationRule,
        throttle: ThrottleReader,
        settings: RegistrySettings,
    ) -> Self {
        let events = EventHub::new("registry", settings.subscriber_queue);
        Self {
            inner: Arc::new(Inner {
                host,
                settings,
                throttle,
                state: Mutex::new(RegistryState::default()),
                rules: RwLock::new(Arc::new(rules)),
                events,
            }),
        }
    }

    /// Subscribe to added / removed / updated events.
    #[must_use]
    pub fn observe(&self) -> EventStream<ProcessEvent> {
        self.inner.events.subscribe()
    }

    /// Point-in-time copy of every known process, ordered by pid.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ProcessHandle> {
        let state = self.lock_state();
        let mut handles: Vec<ProcessHandle> =
            state.entries.values().map(|e| e.handle.clone()).collect();
        handles.sort_by_key(|h| h.process_id);
        handles
    }

    /// Cached classification of a known process.
    #[must_use]
    pub fn classify(&self, pid: u32) -> Option<Classification> {
        self.lock_state()
            .entries
            .get(&pid)
            .map(|e| e.handle.classification)
    }

    /// Current handle for a known process.
    #[must_use]
    pub fn get(&self, pid: u32) -> Option<ProcessHandle> {
        self.lock_state().entries.get(&pid).map(|e| e.handle.clone())
    }

    /// Whether the process is currently known.
    #[must_use]
    pub fn contains(&self, pid: u32) -> bool {
        self.lock_state().entries.contains_key(&pid)
    }

    /// Number of known processes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock_state().entries.len()
    }

    /// Whether no process is known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reconciliation interval under the current throttle level.
    #[must_use]
    pub fn reconcile_interval(&self) -> Duration {
        self.inner
            .settings
            .base_interval
            .saturating_mul(self.inner.throttle.current().interval_multiplier())
            .min(MAX_RECONCILE_INTERVAL)
    }

    /// Replace the rule set and reclassify every cached entry.
    ///
    /// Emits `Updated` only for entries whose classification changed and
    /// returns how many did.
    pub fn set_rules(&self, rules: ClassificationRule) -> usize {
        let mut state = self.lock_state();
        let rules = Arc::new(rules);
        *self
            .inner
            .rules
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Arc::clone(&rules);

        let mut changed = 0;
        for entry in state.entries.values_mut() {
            let handle = &mut entry.handle;
            let next = rules.classify_parts(
                handle.process_id,
                &handle.display_name,
                handle.owner_identifier.as_deref(),
            );
            if next != handle.classification {
                debug!(
                    pid = handle.process_id,
                    from = handle.classification.as_str(),
                    to = next.as_str(),
                    "reclassified process"
                );
                handle.classification = next;
                changed += 1;
                self.inner.events.publish(ProcessEvent::Updated(handle.clone()));
            }
        }
        info!(changed, total = state.entries.len(), "classification rules swapped");
        changed
    }

    /// Apply one host launch/exit notification.
    pub fn handle_host_event(&self, event: HostEvent) {
        match event {
            HostEvent::Launched(record) => {
                if let Err(reason) = record.validate() {
                    warn!(%reason, "dropping malformed launch notification");
                    return;
                }
                let rules = self.rules();
                let mut state = self.lock_state();
                state.exited.remove(&record.pid);
                self.upsert(&mut state, &record, &rules);
            }
            HostEvent::Exited { pid } => {
                let mut state = self.lock_state();
                state.exited.insert(pid, Instant::now());
                if let Some(entry) = state.entries.remove(&pid) {
                    debug!(pid, name = %entry.handle.display_name, "process exited");
                    self.inner.events.publish(ProcessEvent::Removed(entry.handle));
                }
            }
        }
    }

    /// Run one full reconciliation scan against the host.
    ///
    /// Enumeration failures are logged and leave the map untouched;
    /// malformed records are logged and dropped.
    pub async fn reconcile(&self) {
        let started = Instant::now();
        let records = match self.inner.host.enumerate().await {
            Ok(records) => records,
            Err(err) => {
                warn!(%err, "reconciliation enumerate failed");
                return;
            }
        };

        let rules = self.rules();
        let mut state = self.lock_state();
        let mut seen = HashSet::with_capacity(records.len());

        for record in records {
            if let Err(reason) = record.validate() {
                warn!(%reason, "dropping malformed host record");
                continue;
            }
            if state.exited.get(&record.pid).is_some_and(|at| *at >= started) {
                debug!(pid = record.pid, "ignoring scan record older than exit notification");
                continue;
            }
            seen.insert(record.pid);
            self.upsert(&mut state, &record, &rules);
        }

        let mut vanished = Vec::new();
        for (pid, entry) in &mut state.entries {
            if seen.contains(pid) {
                continue;
            }
            entry.missed_scans += 1;
            if entry.missed_scans >= MISSED_SCANS_BEFORE_REMOVAL {
                vanished.push(*pid);
            }
        }
        for pid in vanished {
            if let Some(entry) = state.entries.remove(&pid) {
                debug!(pid, name = %entry.handle.display_name, "process missing from consecutive scans");
                self.inner.events.publish(ProcessEvent::Removed(entry.handle));
            }
        }

        state.exited.retain(|_, at| *at >= started);
        debug!(known = state.entries.len(), "reconciliation complete");
    }

    /// Whether the registry still holds `target` itself, not a later
    /// process that reused its pid.
    #[must_use]
    pub fn holds(&self, target: &ProcessHandle) -> bool {
        self.lock_state()
            .entries
            .get(&target.process_id)
            .is_some_and(|e| e.handle.is_same_process(target))
    }

    /// Wait until `target` is no longer in the registry.
    ///
    /// A different process now holding the same pid counts as gone.
    /// Returns `true` if it left (or was never present) before `timeout`.
    pub async fn wait_for_exit(&self, target: &ProcessHandle, timeout: Duration) -> bool {
        let mut events = self.observe();
        if !self.holds(target) {
            return true;
        }
        let gone = async {
            while events.recv().await.is_some() {
                if !self.holds(target) {
                    return true;
                }
            }
            false
        };
        matches!(tokio::time::timeout(timeout, gone).await, Ok(true))
    }

    /// Wait until `pid` appears in the registry and return its handle.
    pub async fn wait_for_appearance(&self, pid: u32, timeout: Duration) -> Option<ProcessHandle> {
        let mut events = self.observe();
        if let Some(handle) = self.get(pid) {
            return Some(handle);
        }
        let appeared = async {
            while events.recv().await.is_some() {
                if let Some(handle) = self.get(pid) {
                    return Some(handle);
                }
            }
            None
        };
        tokio::time::timeout(timeout, appeared).await.ok().flatten()
    }

    /// Spawn the notification handler and reconciliation timer.
    ///
    /// Performs an initial scan, then applies host notifications as they
    /// arrive and rescans at [`reconcile_interval`](Self::reconcile_interval)
    /// until `cancel` fires.
    #[must_use]
    pub fn spawn(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(
            async move {
                let mut notifications = registry.inner.host.subscribe();
                let mut notifications_open = true;

                registry.reconcile().await;
                info!(known = registry.len(), "initial process scan complete");
                let mut next_scan = Instant::now() + registry.reconcile_interval();

                loop {
                    tokio::select! {
                        () = cancel.cancelled() => {
                            info!("process registry shutting down");
                            break;
                        }
                        event = notifications.recv(), if notifications_open => {
                            match event {
                                Some(event) => registry.handle_host_event(event),
                                None => {
                                    warn!("host notification channel closed; relying on reconciliation");
                                    notifications_open = false;
                                }
                            }
                        }
                        () = tokio::time::sleep_until(next_scan) => {
                            registry.reconcile().await;
                            next_scan = Instant::now() + registry.reconcile_interval();
                        }
                    }
                }
            }
            .instrument(info_span!("process_registry")),
        )
    }

    fn rules(&self) -> Arc<ClassificationRule> {
        Arc::clone(&self.inner.rules.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn lock_state(&self) -> MutexGuard<'_, RegistryState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a new entry or refresh an existing one. A record whose
    /// identity differs from the cached entry means the pid was reused.
    fn upsert(&self, state: &mut RegistryState, record: &HostProcessRecord, rules: &ClassificationRule) {
        if let Some(entry) = state.entries.get_mut(&record.pid) {
            if entry.handle.matches_record(record) {
                let sample = record.sample();
                let changed = entry.handle.resource_sample != sample;
                entry.handle.resource_sample = sample;
                entry.handle.last_seen = Utc::now();
                entry.missed_scans = 0;
                if changed {
                    self.inner.events.publish(ProcessEvent::Updated(entry.handle.clone()));
                }
                return;
            }

            if let Some(stale) = state.entries.remove(&record.pid) {
                debug!(pid = record.pid, "pid reused by a different process");
                self.inner.events.publish(ProcessEvent::Removed(stale.handle));
            }
        }

        let handle = ProcessHandle::from_record(record, rules.classify(record));
        debug!(
            pid = handle.process_id,
            name = %handle.display_name,
            classification = handle.classification.as_str(),
            "process added"
        );
        state.entries.insert(
            record.pid,
            Entry {
                handle: handle.clone(),
                missed_scans: 0,
            },
        );
        self.inner.events.publish(ProcessEvent::Added(handle));
    }
}
