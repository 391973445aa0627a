//! Graceful-then-forced termination protocol.
//!
//! Each attempt walks `Requested → GracefulSent → WaitingForExit →
//! {Confirmed | ForceSent} → {Confirmed | Failed}`. Exit is confirmed by the
//! process leaving the registry, never by trusting the signal call; a
//! different process reusing the pid counts as the target having left.
//! There is exactly one escalation per attempt and no retries.
//!
//! Bulk runs keep at most `ThrottleLevel::max_concurrent` attempts in
//! flight, re-reading the level each time a slot frees up, and queue the
//! rest in FIFO order. Force kills are spaced at least
//! [`MIN_FORCE_SPACING`] apart across all attempts.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use super::governor::ThrottleReader;
use super::observer::TransitionObserver;
use super::registry::ProcessRegistry;
use crate::host::{ProcessHost, SignalKind};
use crate::models::process::{Classification, ProcessHandle};
use crate::models::termination::{FailureReason, TerminationAttempt, TerminationState};

/// Lower bound on the delay between two force-kill issuances.
pub const MIN_FORCE_SPACING: Duration = Duration::from_millis(100);

/// Termination deadlines with durations resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminationSettings {
    /// Wait after the graceful signal before escalating.
    pub grace_period: Duration,
    /// Wait after the force signal before giving up.
    pub force_timeout: Duration,
    /// Delay between force-kill issuances; raised to [`MIN_FORCE_SPACING`].
    pub force_spacing: Duration,
}

impl Default for TerminationSettings {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(10),
            force_timeout: Duration::from_secs(2),
            force_spacing: MIN_FORCE_SPACING,
        }
    }
}

/// How a bounded wait for exit ended.
enum ExitWait {
    Gone,
    TimedOut,
    Cancelled,
}

/// What happened when a force kill was due.
enum ForceIssue {
    Sent,
    /// The target left, or its pid now belongs to another process.
    Gone,
    Protected,
}

struct Inner {
    registry: ProcessRegistry,
    host: Arc<dyn ProcessHost>,
    throttle: ThrottleReader,
    settings: TerminationSettings,
    observer: Arc<dyn TransitionObserver>,
    /// Time of the last force-kill issuance.
    last_force: Mutex<Option<Instant>>,
}

/// Shared handle to the termination protocol. Cloning is cheap.
#[derive(Clone)]
pub struct TerminationProtocol {
    inner: Arc<Inner>,
}

impl TerminationProtocol {
    /// Construct a protocol bound to a registry and host.
    #[must_use]
    pub fn new(
        registry: ProcessRegistry,
        host: Arc<dyn ProcessHost>,
        throttle: ThrottleReader,
        settings: TerminationSettings,
        observer: Arc<dyn TransitionObserver>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                host,
                throttle,
                settings,
                observer,
                last_force: Mutex::new(None),
            }),
        }
    }

    /// Terminate a single process.
    pub async fn terminate(&self, handle: ProcessHandle) -> TerminationAttempt {
        self.terminate_with_cancel(handle, &CancellationToken::new())
            .await
    }

    /// Terminate a single process, stopping at the next transition once
    /// `cancel` fires. A signal already sent is not retracted.
    pub async fn terminate_with_cancel(
        &self,
        handle: ProcessHandle,
        cancel: &CancellationToken,
    ) -> TerminationAttempt {
        let span = info_span!("terminate", pid = handle.process_id, name = %handle.display_name);
        self.run_attempt(handle, cancel).instrument(span).await
    }

    /// Terminate every `Terminable` process matching `predicate`.
    ///
    /// `Protected` and `Unknown` processes are never included. Returns one
    /// attempt per selected process, in registry order. Processes still
    /// queued when `cancel` fires are reported `Failed` / `Cancelled`
    /// without any signal sent.
    pub async fn terminate_all<F>(
        &self,
        predicate: F,
        cancel: &CancellationToken,
    ) -> Vec<TerminationAttempt>
    where
        F: Fn(&ProcessHandle) -> bool,
    {
        let targets: Vec<ProcessHandle> = self
            .inner
            .registry
            .snapshot()
            .into_iter()
            .filter(|h| h.classification == Classification::Terminable && predicate(h))
            .collect();

        let span = info_span!("terminate_all", targets = targets.len());
        self.run_bulk(targets, cancel).instrument(span).await
    }

    async fn run_bulk(
        &self,
        targets: Vec<ProcessHandle>,
        cancel: &CancellationToken,
    ) -> Vec<TerminationAttempt> {
        let mut results: Vec<Option<TerminationAttempt>> = vec![None; targets.len()];
        let mut queue: VecDeque<(usize, ProcessHandle)> =
            targets.iter().cloned().enumerate().collect();
        let mut running = JoinSet::new();

        loop {
            while !cancel.is_cancelled()
                && running.len() < self.inner.throttle.current().max_concurrent()
            {
                let Some((index, handle)) = queue.pop_front() else {
                    break;
                };
                let protocol = self.clone();
                let token = cancel.clone();
                running.spawn(async move {
                    (index, protocol.terminate_with_cancel(handle, &token).await)
                });
            }

            match running.join_next().await {
                Some(Ok((index, attempt))) => results[index] = Some(attempt),
                Some(Err(err)) => warn!(%err, "termination task aborted"),
                None => break,
            }
        }

        let attempts: Vec<TerminationAttempt> = results
            .into_iter()
            .zip(targets)
            .map(|(result, target)| {
                result.unwrap_or_else(|| {
                    let mut attempt = TerminationAttempt::new(target);
                    attempt.fail(if cancel.is_cancelled() {
                        FailureReason::Cancelled
                    } else {
                        FailureReason::SignalFailed("termination task aborted".into())
                    });
                    self.inner.observer.termination_transition(&attempt);
                    attempt
                })
            })
            .collect();

        let confirmed = attempts.iter().filter(|a| a.is_confirmed()).count();
        info!(
            confirmed,
            failed = attempts.len() - confirmed,
            "bulk termination finished"
        );
        attempts
    }

    async fn run_attempt(
        &self,
        handle: ProcessHandle,
        cancel: &CancellationToken,
    ) -> TerminationAttempt {
        let pid = handle.process_id;
        let mut attempt = TerminationAttempt::new(handle);
        self.inner.observer.termination_transition(&attempt);

        // The registry's cached entry is authoritative; it may be newer
        // than the handle the caller holds.
        let current = self.inner.registry.get(pid);
        if let Some(current) = &current {
            if !current.is_same_process(&attempt.target) {
                info!(occupant = %current.display_name, "target already exited and its pid was reused");
                return self.finish_confirmed(attempt);
            }
        }
        let classification = current.map_or(attempt.target.classification, |c| c.classification);
        if classification == Classification::Protected
            || attempt.target.classification == Classification::Protected
        {
            warn!("refusing to terminate protected process");
            return self.finish_failed(attempt, FailureReason::ProtectedProcessRejected);
        }

        if cancel.is_cancelled() {
            return self.finish_failed(attempt, FailureReason::Cancelled);
        }

        // ── Graceful ─────────────────────────────────────────
        if let Err(err) = self.inner.host.send_signal(pid, SignalKind::Graceful).await {
            return self.finish_failed(attempt, FailureReason::SignalFailed(err.to_string()));
        }
        self.transition(&mut attempt, TerminationState::GracefulSent);

        let grace = self.inner.settings.grace_period;
        attempt.deadline = Utc::now().checked_add_signed(chrono_duration(grace));
        self.transition(&mut attempt, TerminationState::WaitingForExit);

        match self.wait_exit(&attempt.target, grace, cancel).await {
            ExitWait::Gone => return self.finish_confirmed(attempt),
            ExitWait::Cancelled => return self.finish_failed(attempt, FailureReason::Cancelled),
            ExitWait::TimedOut => {}
        }

        if cancel.is_cancelled() {
            return self.finish_failed(attempt, FailureReason::Cancelled);
        }

        // ── Forced ───────────────────────────────────────────
        warn!(?grace, "process outlived grace period, forcing kill");
        match self.issue_force(&attempt.target).await {
            Ok(ForceIssue::Sent) => {}
            Ok(ForceIssue::Gone) => return self.finish_confirmed(attempt),
            Ok(ForceIssue::Protected) => {
                warn!("process became protected during grace period, not forcing");
                return self.finish_failed(attempt, FailureReason::ProtectedProcessRejected);
            }
            Err(err) => {
                return self.finish_failed(attempt, FailureReason::SignalFailed(err.to_string()));
            }
        }
        let force_timeout = self.inner.settings.force_timeout;
        attempt.deadline = Utc::now().checked_add_signed(chrono_duration(force_timeout));
        self.transition(&mut attempt, TerminationState::ForceSent);

        match self.wait_exit(&attempt.target, force_timeout, cancel).await {
            ExitWait::Gone => self.finish_confirmed(attempt),
            ExitWait::Cancelled => self.finish_failed(attempt, FailureReason::Cancelled),
            ExitWait::TimedOut => {
                warn!("process survived force kill");
                self.finish_failed(attempt, FailureReason::TerminationTimeout)
            }
        }
    }

    async fn wait_exit(
        &self,
        target: &ProcessHandle,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> ExitWait {
        tokio::select! {
            () = cancel.cancelled() => ExitWait::Cancelled,
            gone = self.inner.registry.wait_for_exit(target, timeout) => {
                if gone { ExitWait::Gone } else { ExitWait::TimedOut }
            }
        }
    }

    /// Send a force kill, keeping issuances at least `force_spacing` apart.
    ///
    /// The target is re-read from the registry right before the signal, so
    /// a reused pid or a target reclassified as protected is never killed.
    async fn issue_force(&self, target: &ProcessHandle) -> crate::Result<ForceIssue> {
        let spacing = self.inner.settings.force_spacing.max(MIN_FORCE_SPACING);
        let mut last_force = self.inner.last_force.lock().await;
        if let Some(last) = *last_force {
            tokio::time::sleep(spacing.saturating_sub(last.elapsed())).await;
        }

        match self.inner.registry.get(target.process_id) {
            Some(current) if current.is_same_process(target) => {
                if current.classification == Classification::Protected {
                    return Ok(ForceIssue::Protected);
                }
            }
            _ => return Ok(ForceIssue::Gone),
        }

        let result = self
            .inner
            .host
            .send_signal(target.process_id, SignalKind::Force)
            .await;
        *last_force = Some(Instant::now());
        result.map(|()| ForceIssue::Sent)
    }

    fn transition(&self, attempt: &mut TerminationAttempt, next: TerminationState) {
        attempt.advance(next);
        self.inner.observer.termination_transition(attempt);
    }

    fn finish_confirmed(&self, mut attempt: TerminationAttempt) -> TerminationAttempt {
        attempt.deadline = None;
        self.transition(&mut attempt, TerminationState::Confirmed);
        info!("termination confirmed");
        attempt
    }

    fn finish_failed(&self, mut attempt: TerminationAttempt, reason: FailureReason) -> TerminationAttempt {
        warn!(?reason, "termination failed");
        attempt.fail(reason);
        self.inner.observer.termination_transition(&attempt);
        attempt
    }
}

fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::MAX)
}
