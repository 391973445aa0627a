//! Integration tests for the termination protocol.
//!
//! Covers the protected invariant, graceful-then-forced escalation, bulk
//! selection and concurrency bounds, force spacing and cancellation.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use forcequit::host::{ProcessHost, SignalKind};
use forcequit::models::classification::ClassificationRule;
use forcequit::models::process::Classification;
use forcequit::models::termination::{BulkSummary, FailureReason, TerminationState};
use forcequit::models::throttle::ThrottleLevel;
use forcequit::orchestrator::governor::ThrottleReader;
use forcequit::orchestrator::observer::TransitionObserver;
use forcequit::orchestrator::termination::{TerminationProtocol, TerminationSettings};

use super::test_helpers::{
    fast_termination_settings, handle_of, termination_fixture, wait_until, FakeHost,
    FakeProcess, Reaction, RecordingObserver,
};

#[tokio::test]
async fn graceful_exit_is_confirmed() {
    let host = FakeHost::new();
    host.spawn_process(FakeProcess::new(100, "editor", None));
    let cancel = CancellationToken::new();
    let (registry, protocol, _observer) =
        termination_fixture(&host, ThrottleLevel::Normal, &cancel).await;

    let attempt = protocol.terminate(handle_of(&registry, 100)).await;

    assert_eq!(
        attempt.path(),
        vec![
            TerminationState::Requested,
            TerminationState::GracefulSent,
            TerminationState::WaitingForExit,
            TerminationState::Confirmed,
        ]
    );
    assert!(attempt.failure.is_none());
    assert_eq!(host.signals_for(100), vec![SignalKind::Graceful]);
    assert!(!registry.contains(100));
    cancel.cancel();
}

#[tokio::test]
async fn protected_process_is_always_rejected() {
    let host = FakeHost::new();
    host.spawn_process(FakeProcess::new(101, "essential-daemon", None));
    let cancel = CancellationToken::new();

    for level in [
        ThrottleLevel::Normal,
        ThrottleLevel::Constrained,
        ThrottleLevel::Emergency,
    ] {
        let (registry, protocol, _observer) = termination_fixture(&host, level, &cancel).await;
        let handle = handle_of(&registry, 101);
        assert_eq!(handle.classification, Classification::Protected);

        let attempt = protocol.terminate(handle).await;

        assert_eq!(attempt.state, TerminationState::Failed);
        assert_eq!(attempt.failure, Some(FailureReason::ProtectedProcessRejected));
        assert_eq!(
            attempt.path(),
            vec![TerminationState::Requested, TerminationState::Failed]
        );
    }

    assert!(host.signals().is_empty(), "no signal may reach a protected process");
    assert!(host.is_running(101));
    cancel.cancel();
}

#[tokio::test]
async fn stale_handle_cannot_bypass_protection() {
    let host = FakeHost::new();
    host.spawn_process(FakeProcess::new(102, "editor", None));
    let cancel = CancellationToken::new();
    let (registry, protocol, _observer) =
        termination_fixture(&host, ThrottleLevel::Normal, &cancel).await;
    let stale = handle_of(&registry, 102);

    registry.set_rules(ClassificationRule::new(&["editor"], &[] as &[&str]).unwrap());
    let attempt = protocol.terminate(stale).await;

    assert_eq!(attempt.failure, Some(FailureReason::ProtectedProcessRejected));
    assert!(host.signals_for(102).is_empty());
    cancel.cancel();
}

#[tokio::test]
async fn ignored_graceful_signal_escalates_to_force() {
    let host = FakeHost::new();
    host.spawn_process(FakeProcess::stubborn(103, "stubborn"));
    let cancel = CancellationToken::new();
    let (registry, protocol, _observer) =
        termination_fixture(&host, ThrottleLevel::Normal, &cancel).await;
    let grace = fast_termination_settings().grace_period;

    let started = tokio::time::Instant::now();
    let attempt = protocol.terminate(handle_of(&registry, 103)).await;
    let elapsed = started.elapsed();

    assert_eq!(
        attempt.path(),
        vec![
            TerminationState::Requested,
            TerminationState::GracefulSent,
            TerminationState::WaitingForExit,
            TerminationState::ForceSent,
            TerminationState::Confirmed,
        ]
    );
    assert!(elapsed >= grace, "elapsed {elapsed:?} < grace {grace:?}");
    assert_eq!(
        host.signals_for(103),
        vec![SignalKind::Graceful, SignalKind::Force]
    );

    let signals = host.signals();
    assert!(signals[1].at.duration_since(signals[0].at) >= grace);
    cancel.cancel();
}

#[tokio::test]
async fn survivor_of_force_kill_times_out() {
    let host = FakeHost::new();
    host.spawn_process(FakeProcess::stubborn(104, "zombie").on_force(Reaction::Ignore));
    let cancel = CancellationToken::new();
    let (registry, protocol, _observer) =
        termination_fixture(&host, ThrottleLevel::Normal, &cancel).await;

    let attempt = protocol.terminate(handle_of(&registry, 104)).await;

    assert_eq!(attempt.state, TerminationState::Failed);
    assert_eq!(attempt.failure, Some(FailureReason::TerminationTimeout));
    assert_eq!(
        host.signals_for(104),
        vec![SignalKind::Graceful, SignalKind::Force],
        "exactly one escalation, no retries"
    );
    assert!(registry.contains(104), "registry view stays consistent");
    cancel.cancel();
}

#[tokio::test]
async fn unknown_process_is_individually_terminable() {
    let host = FakeHost::new();
    host.spawn_process(FakeProcess::new(105, "mystery", None));
    let cancel = CancellationToken::new();
    let (registry, protocol, _observer) =
        termination_fixture(&host, ThrottleLevel::Normal, &cancel).await;

    let attempt = protocol.terminate(handle_of(&registry, 105)).await;

    assert!(attempt.is_confirmed());
    cancel.cancel();
}

#[tokio::test]
async fn bulk_selects_only_terminable_processes() {
    let host = FakeHost::new();
    host.spawn_process(FakeProcess::new(110, "essential-a", None));
    host.spawn_process(FakeProcess::new(111, "b", None));
    host.spawn_process(FakeProcess::new(112, "c", None));
    host.spawn_process(FakeProcess::new(113, "mystery-d", None));
    let cancel = CancellationToken::new();
    let (registry, protocol, _observer) =
        termination_fixture(&host, ThrottleLevel::Normal, &cancel).await;
    let preserved = registry
        .snapshot()
        .iter()
        .filter(|h| h.classification != Classification::Terminable)
        .count();

    let attempts = protocol
        .terminate_all(|h| h.classification == Classification::Terminable, &cancel)
        .await;

    let targets: Vec<u32> = attempts.iter().map(|a| a.target.process_id).collect();
    assert_eq!(targets, vec![111, 112]);
    assert!(attempts.iter().all(|a| a.is_confirmed()));
    assert!(host.signals_for(110).is_empty());
    assert!(host.signals_for(113).is_empty(), "unknown is excluded from bulk");

    let summary = BulkSummary::tally(&attempts, preserved);
    assert_eq!(
        summary,
        BulkSummary {
            confirmed: 2,
            failed: 0,
            preserved: 2
        }
    );
    cancel.cancel();
}

#[tokio::test]
async fn bulk_predicate_cannot_select_protected() {
    let host = FakeHost::new();
    host.spawn_process(FakeProcess::new(115, "essential-a", None));
    host.spawn_process(FakeProcess::new(116, "b", None));
    let cancel = CancellationToken::new();
    let (_registry, protocol, _observer) =
        termination_fixture(&host, ThrottleLevel::Normal, &cancel).await;

    let attempts = protocol.terminate_all(|_| true, &cancel).await;

    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].target.process_id, 116);
    cancel.cancel();
}

async fn assert_concurrency_bound(level: ThrottleLevel, count: u32) {
    let host = FakeHost::new();
    for pid in 200..200 + count {
        host.spawn_process(
            FakeProcess::new(pid, &format!("worker-{pid}"), None)
                .on_graceful(Reaction::ExitAfter(Duration::from_millis(60))),
        );
    }
    let cancel = CancellationToken::new();
    let (_registry, protocol, observer) = termination_fixture(&host, level, &cancel).await;

    let attempts = tokio::time::timeout(
        Duration::from_secs(10),
        protocol.terminate_all(|_| true, &cancel),
    )
    .await
    .expect("bulk run finishes");

    assert_eq!(attempts.len(), count as usize);
    assert!(attempts.iter().all(|a| a.is_confirmed()));
    assert!(
        observer.max_in_flight() <= level.max_concurrent(),
        "{} in flight at {level:?}",
        observer.max_in_flight()
    );
    assert_eq!(
        observer.max_in_flight(),
        level.max_concurrent().min(count as usize),
        "slots should be used"
    );
    cancel.cancel();
}

#[tokio::test]
async fn bulk_respects_normal_concurrency() {
    assert_concurrency_bound(ThrottleLevel::Normal, 12).await;
}

#[tokio::test]
async fn bulk_respects_constrained_concurrency() {
    assert_concurrency_bound(ThrottleLevel::Constrained, 6).await;
}

#[tokio::test]
async fn bulk_respects_emergency_concurrency() {
    assert_concurrency_bound(ThrottleLevel::Emergency, 3).await;
}

#[tokio::test]
async fn bulk_results_follow_registry_order() {
    let host = FakeHost::new();
    host.spawn_process(
        FakeProcess::new(300, "slow", None)
            .on_graceful(Reaction::ExitAfter(Duration::from_millis(150))),
    );
    host.spawn_process(FakeProcess::new(301, "fast", None));
    let cancel = CancellationToken::new();
    let (_registry, protocol, _observer) =
        termination_fixture(&host, ThrottleLevel::Normal, &cancel).await;

    let attempts = protocol.terminate_all(|_| true, &cancel).await;

    let order: Vec<u32> = attempts.iter().map(|a| a.target.process_id).collect();
    assert_eq!(order, vec![300, 301]);
    cancel.cancel();
}

#[tokio::test]
async fn force_kills_are_spaced() {
    let host = FakeHost::new();
    for pid in 400..403 {
        host.spawn_process(FakeProcess::stubborn(pid, &format!("stubborn-{pid}")));
    }
    let cancel = CancellationToken::new();
    let (_registry, protocol, _observer) =
        termination_fixture(&host, ThrottleLevel::Normal, &cancel).await;

    let attempts = protocol.terminate_all(|_| true, &cancel).await;
    assert!(attempts.iter().all(|a| a.is_confirmed()));

    let forces: Vec<_> = host
        .signals()
        .into_iter()
        .filter(|s| s.kind == SignalKind::Force)
        .map(|s| s.at)
        .collect();
    assert_eq!(forces.len(), 3);
    let spacing = fast_termination_settings().force_spacing;
    for pair in forces.windows(2) {
        assert!(pair[1].duration_since(pair[0]) >= spacing);
    }
    cancel.cancel();
}

#[tokio::test]
async fn cancellation_stops_queued_attempts() {
    let host = FakeHost::new();
    for pid in 500..504 {
        host.spawn_process(FakeProcess::stubborn(pid, &format!("stubborn-{pid}")));
    }
    let cancel = CancellationToken::new();
    let (_registry, protocol, _observer) =
        termination_fixture(&host, ThrottleLevel::Emergency, &cancel).await;

    let bulk_cancel = CancellationToken::new();
    let trigger = bulk_cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let attempts = tokio::time::timeout(
        Duration::from_secs(5),
        protocol.terminate_all(|_| true, &bulk_cancel),
    )
    .await
    .expect("cancelled run returns promptly");

    assert_eq!(attempts.len(), 4);
    assert!(attempts
        .iter()
        .all(|a| a.failure == Some(FailureReason::Cancelled)));
    // Only the first attempt started; the queued ones never signalled.
    assert_eq!(host.signals_for(500), vec![SignalKind::Graceful]);
    for pid in 501..504 {
        assert!(host.signals_for(pid).is_empty(), "pid {pid} was signalled");
    }
    cancel.cancel();
}

#[tokio::test]
async fn observer_sees_every_transition() {
    let host = FakeHost::new();
    host.spawn_process(FakeProcess::new(600, "editor", None));
    let cancel = CancellationToken::new();
    let (registry, _protocol, _observer) =
        termination_fixture(&host, ThrottleLevel::Normal, &cancel).await;
    let observer = RecordingObserver::new();
    let protocol = TerminationProtocol::new(
        registry.clone(),
        Arc::clone(&host) as Arc<dyn ProcessHost>,
        ThrottleReader::fixed(ThrottleLevel::Normal),
        fast_termination_settings(),
        Arc::clone(&observer) as Arc<dyn TransitionObserver>,
    );

    protocol.terminate(handle_of(&registry, 600)).await;

    let states: Vec<TerminationState> = observer
        .terminations
        .lock()
        .unwrap()
        .iter()
        .map(|a| a.state)
        .collect();
    assert_eq!(
        states,
        vec![
            TerminationState::Requested,
            TerminationState::GracefulSent,
            TerminationState::WaitingForExit,
            TerminationState::Confirmed,
        ]
    );
    cancel.cancel();
}

#[tokio::test]
async fn reused_pid_is_never_force_killed() {
    let host = FakeHost::new();
    host.spawn_process(FakeProcess::stubborn(700, "victim"));
    let cancel = CancellationToken::new();
    let (registry, protocol, _observer) =
        termination_fixture(&host, ThrottleLevel::Normal, &cancel).await;
    let victim = handle_of(&registry, 700);

    let pending = {
        let protocol = protocol.clone();
        tokio::spawn(async move { protocol.terminate(victim).await })
    };
    assert!(wait_until(Duration::from_secs(1), || !host.signals_for(700).is_empty()).await);

    // The victim exits unnoticed and a protected process takes its pid.
    host.mute_notifications(true);
    host.kill_process(700);
    host.spawn_process(FakeProcess::stubborn(700, "essential-daemon"));
    let attempt = pending.await.unwrap();

    assert_eq!(
        attempt.path(),
        vec![
            TerminationState::Requested,
            TerminationState::GracefulSent,
            TerminationState::WaitingForExit,
            TerminationState::Confirmed,
        ]
    );
    assert_eq!(host.signals_for(700), vec![SignalKind::Graceful]);
    assert!(host.is_running(700));
    assert_eq!(registry.classify(700), Some(Classification::Protected));
    cancel.cancel();
}

#[tokio::test]
async fn stale_handle_for_reused_pid_sends_nothing() {
    let host = FakeHost::new();
    host.spawn_process(FakeProcess::new(701, "editor", None));
    let cancel = CancellationToken::new();
    let (registry, protocol, _observer) =
        termination_fixture(&host, ThrottleLevel::Normal, &cancel).await;
    let stale = handle_of(&registry, 701);

    host.mute_notifications(true);
    host.kill_process(701);
    host.spawn_process(FakeProcess::new(701, "player", None));
    assert!(
        wait_until(Duration::from_secs(2), || {
            registry.get(701).is_some_and(|h| h.display_name == "player")
        })
        .await
    );

    let attempt = protocol.terminate(stale).await;

    assert!(attempt.is_confirmed());
    assert_eq!(
        attempt.path(),
        vec![TerminationState::Requested, TerminationState::Confirmed]
    );
    assert!(host.signals_for(701).is_empty());
    assert!(host.is_running(701));
    cancel.cancel();
}

#[tokio::test]
async fn protection_gained_during_grace_blocks_force() {
    let host = FakeHost::new();
    host.spawn_process(FakeProcess::stubborn(702, "editor"));
    let cancel = CancellationToken::new();
    let (registry, protocol, _observer) =
        termination_fixture(&host, ThrottleLevel::Normal, &cancel).await;
    let editor = handle_of(&registry, 702);

    let pending = {
        let protocol = protocol.clone();
        tokio::spawn(async move { protocol.terminate(editor).await })
    };
    assert!(wait_until(Duration::from_secs(1), || !host.signals_for(702).is_empty()).await);
    registry.set_rules(ClassificationRule::new(&["editor"], &[] as &[&str]).unwrap());
    let attempt = pending.await.unwrap();

    assert_eq!(attempt.failure, Some(FailureReason::ProtectedProcessRejected));
    assert_eq!(host.signals_for(702), vec![SignalKind::Graceful]);
    assert!(host.is_running(702));
    cancel.cancel();
}

#[tokio::test]
async fn undeliverable_graceful_signal_fails_without_escalating() {
    let host = FakeHost::new();
    host.spawn_process(FakeProcess::new(703, "editor", None));
    let cancel = CancellationToken::new();
    let (registry, protocol, _observer) =
        termination_fixture(&host, ThrottleLevel::Normal, &cancel).await;
    host.fail_signals(true);

    let attempt = protocol.terminate(handle_of(&registry, 703)).await;

    assert_eq!(
        attempt.path(),
        vec![TerminationState::Requested, TerminationState::Failed]
    );
    assert!(matches!(attempt.failure, Some(FailureReason::SignalFailed(_))));
    assert!(host.signals().is_empty());
    assert!(host.is_running(703));
    cancel.cancel();
}

#[tokio::test]
async fn unbounded_deadlines_do_not_overflow() {
    let host = FakeHost::new();
    host.spawn_process(FakeProcess::new(704, "editor", None));
    let cancel = CancellationToken::new();
    let (registry, _protocol, _observer) =
        termination_fixture(&host, ThrottleLevel::Normal, &cancel).await;
    let protocol = TerminationProtocol::new(
        registry.clone(),
        Arc::clone(&host) as Arc<dyn ProcessHost>,
        ThrottleReader::fixed(ThrottleLevel::Normal),
        TerminationSettings {
            grace_period: Duration::MAX,
            force_timeout: Duration::MAX,
            force_spacing: Duration::MAX,
        },
        RecordingObserver::new() as Arc<dyn TransitionObserver>,
    );

    let attempt = protocol.terminate(handle_of(&registry, 704)).await;

    assert!(attempt.is_confirmed());
    cancel.cancel();
}
