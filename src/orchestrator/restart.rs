//! Restart engine: capture, terminate, relaunch, restore.
//!
//! A session walks `Capturing → Terminating → WaitingRelaunch → Restoring`
//! and ends `Restored`, `PartiallyRestored` or `Failed`. Steps run strictly
//! in order; cancellation is honoured between steps and during the bounded
//! waits. Finished sessions go into a fixed-capacity history ring, oldest
//! evicted first.

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use super::observer::TransitionObserver;
use super::registry::ProcessRegistry;
use super::termination::TerminationProtocol;
use crate::host::ProcessHost;
use crate::models::process::ProcessHandle;
use crate::models::restart::{
    CapturedState, RelaunchResult, RestartFailure, RestartSession, RestartStep,
    RestorationResult, RestoreOutcome,
};
use crate::{AppError, Result};

/// Restart settings with durations resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartSettings {
    /// Bound on launching the replacement and seeing it in the registry.
    pub launch_timeout: Duration,
    /// Bound on each capture / restore hook call.
    pub hook_timeout: Duration,
    /// Finished sessions kept in the history ring.
    pub history_capacity: usize,
    /// Owner identifiers that support restart.
    pub capable: HashSet<String>,
}

impl Default for RestartSettings {
    fn default() -> Self {
        Self {
            launch_timeout: Duration::from_secs(10),
            hook_timeout: Duration::from_secs(10),
            history_capacity: 32,
            capable: HashSet::new(),
        }
    }
}

/// Caller-supplied application state hooks.
pub trait StateHooks: Send + Sync {
    /// Capture the state of a process about to be restarted.
    ///
    /// `Ok(None)` means the process has nothing to preserve.
    ///
    /// # Errors
    ///
    /// Any error fails the session at the `Capturing` step.
    fn capture_state(
        &self,
        handle: &ProcessHandle,
    ) -> Pin<Box<dyn Future<Output = Result<Option<CapturedState>>> + Send + '_>>;

    /// Apply captured state to the relaunched process.
    ///
    /// # Errors
    ///
    /// An error ends the session `PartiallyRestored` with restoration
    /// result `Failed`.
    fn restore_state(
        &self,
        handle: &ProcessHandle,
        state: CapturedState,
    ) -> Pin<Box<dyn Future<Output = Result<RestoreOutcome>> + Send + '_>>;
}

/// Hooks for processes with nothing to capture.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoStateHooks;

impl StateHooks for NoStateHooks {
    fn capture_state(
        &self,
        _handle: &ProcessHandle,
    ) -> Pin<Box<dyn Future<Output = Result<Option<CapturedState>>> + Send + '_>> {
        Box::pin(async { Ok(None) })
    }

    fn restore_state(
        &self,
        _handle: &ProcessHandle,
        _state: CapturedState,
    ) -> Pin<Box<dyn Future<Output = Result<RestoreOutcome>> + Send + '_>> {
        Box::pin(async { Ok(RestoreOutcome::Complete) })
    }
}

/// Handle to a running restart session.
pub struct RestartTask {
    session_id: String,
    state: watch::Receiver<RestartStep>,
    cancel: CancellationToken,
    join_handle: JoinHandle<RestartSession>,
}

impl RestartTask {
    /// Identifier of the session this task drives.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Step the session is currently in.
    #[must_use]
    pub fn state(&self) -> RestartStep {
        *self.state.borrow()
    }

    /// Watch channel following every step change.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<RestartStep> {
        self.state.clone()
    }

    /// Request cancellation; honoured at the next step boundary.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the session to finish.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Host` only if the session task itself panicked.
    pub async fn wait(self) -> Result<RestartSession> {
        self.join_handle
            .await
            .map_err(|err| AppError::Host(format!("restart task aborted: {err}")))
    }
}

struct Inner {
    registry: ProcessRegistry,
    termination: TerminationProtocol,
    host: Arc<dyn ProcessHost>,
    hooks: Arc<dyn StateHooks>,
    settings: RestartSettings,
    observer: Arc<dyn TransitionObserver>,
    history: Mutex<VecDeque<RestartSession>>,
}

/// Shared handle to the restart engine. Cloning is cheap.
#[derive(Clone)]
pub struct RestartEngine {
    inner: Arc<Inner>,
}

impl RestartEngine {
    /// Construct an engine on top of a registry and termination protocol.
    #[must_use]
    pub fn new(
        registry: ProcessRegistry,
        termination: TerminationProtocol,
        host: Arc<dyn ProcessHost>,
        hooks: Arc<dyn StateHooks>,
        settings: RestartSettings,
        observer: Arc<dyn TransitionObserver>,
    ) -> Self {
        let capacity = settings.history_capacity.max(1);
        Self {
            inner: Arc::new(Inner {
                registry,
                termination,
                host,
                hooks,
                settings,
                observer,
                history: Mutex::new(VecDeque::with_capacity(capacity)),
            }),
        }
    }

    /// Whether `handle` carries an owner identifier marked restart-capable.
    #[must_use]
    pub fn is_restart_capable(&self, handle: &ProcessHandle) -> bool {
        handle
            .owner_identifier
            .as_ref()
            .is_some_and(|owner| self.inner.settings.capable.contains(owner))
    }

    /// Start a restart session for `handle`.
    ///
    /// Must be called from within a Tokio runtime. The session runs in the
    /// background; follow it through the returned [`RestartTask`].
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotRestartCapable` if the handle has no owner
    /// identifier or its owner is not marked restart-capable.
    pub fn restart(&self, handle: ProcessHandle) -> Result<RestartTask> {
        let Some(owner) = handle.owner_identifier.clone() else {
            return Err(AppError::NotRestartCapable(format!(
                "pid {} has no owner identifier",
                handle.process_id
            )));
        };
        if !self.inner.settings.capable.contains(&owner) {
            return Err(AppError::NotRestartCapable(format!(
                "{owner} (pid {}) is not marked restart-capable",
                handle.process_id
            )));
        }

        let session = RestartSession::new(handle);
        let session_id = session.id.clone();
        let (state_tx, state_rx) = watch::channel(RestartStep::Capturing);
        let cancel = CancellationToken::new();

        let span = info_span!(
            "restart",
            session_id = %session.id,
            pid = session.target.process_id,
            owner = %owner
        );
        let engine = self.clone();
        let token = cancel.clone();
        let join_handle = tokio::spawn(
            async move { engine.run(session, &owner, &state_tx, &token).await }.instrument(span),
        );

        Ok(RestartTask {
            session_id,
            state: state_rx,
            cancel,
            join_handle,
        })
    }

    /// Finished sessions, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<RestartSession> {
        self.inner
            .history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    async fn run(
        &self,
        mut session: RestartSession,
        owner: &str,
        state_tx: &watch::Sender<RestartStep>,
        cancel: &CancellationToken,
    ) -> RestartSession {
        self.execute(&mut session, owner, state_tx, cancel).await;

        state_tx.send_replace(session.step);
        self.inner.observer.restart_transition(&session);
        match &session.failure {
            Some(RestartFailure { step, reason }) => {
                warn!(step = step.as_str(), %reason, outcome = session.step.as_str(), "restart finished");
            }
            None => info!(outcome = session.step.as_str(), "restart finished"),
        }

        self.record(session.clone());
        session
    }

    #[allow(clippy::too_many_lines)] // Steps are strictly sequential with a cancel check between each.
    async fn execute(
        &self,
        session: &mut RestartSession,
        owner: &str,
        state_tx: &watch::Sender<RestartStep>,
        cancel: &CancellationToken,
    ) {
        let hook_timeout = self.inner.settings.hook_timeout;

        // ── Capturing ────────────────────────────────────────
        self.enter(session, RestartStep::Capturing, state_tx);
        if cancel.is_cancelled() {
            session.fail("cancelled");
            return;
        }
        let captured = match tokio::time::timeout(
            hook_timeout,
            self.inner.hooks.capture_state(&session.target),
        )
        .await
        {
            Ok(Ok(state)) => state,
            Ok(Err(err)) => {
                session.fail(format!("capture hook failed: {err}"));
                return;
            }
            Err(_) => {
                session.fail("capture hook timed out");
                return;
            }
        };
        session.captured_state.clone_from(&captured);

        // ── Terminating ──────────────────────────────────────
        if cancel.is_cancelled() {
            session.fail("cancelled");
            return;
        }
        self.enter(session, RestartStep::Terminating, state_tx);
        let attempt = self
            .inner
            .termination
            .terminate_with_cancel(session.target.clone(), cancel)
            .await;
        let confirmed = attempt.is_confirmed();
        let failure = attempt.failure.clone();
        session.termination = Some(attempt);
        if !confirmed {
            session.fail(format!("termination failed: {failure:?}"));
            return;
        }

        // ── WaitingRelaunch ──────────────────────────────────
        if cancel.is_cancelled() {
            session.fail("cancelled");
            return;
        }
        self.enter(session, RestartStep::WaitingRelaunch, state_tx);
        let launch_timeout = self.inner.settings.launch_timeout;
        let relaunched = tokio::select! {
            () = cancel.cancelled() => {
                session.fail("cancelled");
                return;
            }
            result = tokio::time::timeout(launch_timeout, self.relaunch(owner, launch_timeout)) => {
                result.unwrap_or(Err(RelaunchResult::Timeout))
            }
        };
        let replacement = match relaunched {
            Ok(handle) => {
                session.relaunch_result = Some(RelaunchResult::Success);
                handle
            }
            Err(result) => {
                session.relaunch_result = Some(result);
                session.fail(match result {
                    RelaunchResult::LaunchFailed => "launch failed",
                    _ => "relaunched process did not appear before launch timeout",
                });
                return;
            }
        };
        session.replacement = Some(replacement.clone());

        // ── Restoring ────────────────────────────────────────
        if cancel.is_cancelled() {
            session.fail("cancelled");
            return;
        }
        self.enter(session, RestartStep::Restoring, state_tx);
        let Some(state) = captured else {
            session.restoration_result = Some(RestorationResult::Skipped);
            session.finish(RestartStep::Restored);
            return;
        };

        let restored = tokio::time::timeout(
            hook_timeout,
            self.inner.hooks.restore_state(&replacement, state),
        )
        .await;
        match restored {
            Ok(Ok(RestoreOutcome::Complete)) => {
                session.restoration_result = Some(RestorationResult::Restored);
                session.finish(RestartStep::Restored);
            }
            Ok(Ok(RestoreOutcome::Partial)) => {
                session.restoration_result = Some(RestorationResult::PartiallyRestored);
                session.finish(RestartStep::PartiallyRestored);
            }
            Ok(Err(err)) => restore_failed(session, format!("restore hook failed: {err}")),
            Err(_) => restore_failed(session, "restore hook timed out".into()),
        }
    }

    /// Launch the replacement and wait for it to show up in the registry.
    async fn relaunch(
        &self,
        owner: &str,
        timeout: Duration,
    ) -> std::result::Result<ProcessHandle, RelaunchResult> {
        let pid = match self.inner.host.launch(owner).await {
            Ok(pid) => pid,
            Err(err) => {
                warn!(%err, "relaunch failed");
                return Err(RelaunchResult::LaunchFailed);
            }
        };
        info!(new_pid = pid, "replacement launched, waiting for it to appear");
        self.inner
            .registry
            .wait_for_appearance(pid, timeout)
            .await
            .ok_or(RelaunchResult::Timeout)
    }

    fn enter(&self, session: &mut RestartSession, step: RestartStep, state_tx: &watch::Sender<RestartStep>) {
        session.step = step;
        state_tx.send_replace(step);
        self.inner.observer.restart_transition(session);
    }

    fn record(&self, session: RestartSession) {
        let capacity = self.inner.settings.history_capacity.max(1);
        let mut history = self.inner.history.lock().unwrap_or_else(PoisonError::into_inner);
        while history.len() >= capacity {
            history.pop_front();
        }
        history.push_back(session);
    }
}

/// Capture succeeded but restore did not: the process is back without its
/// state.
fn restore_failed(session: &mut RestartSession, reason: String) {
    warn!(%reason, "state restoration failed");
    session.restoration_result = Some(RestorationResult::Failed);
    session.failure = Some(RestartFailure {
        step: RestartStep::Restoring,
        reason,
    });
    session.finish(RestartStep::PartiallyRestored);
}
