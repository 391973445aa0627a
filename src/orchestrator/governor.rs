//! Resource governor: keeps the orchestrator lighter than what it observes.
//!
//! Samples the orchestrator's own memory use and the host's thermal/power
//! state on a fixed interval, maps the reading to a [`ThrottleLevel`], and
//! publishes a new level only after two consecutive samples moved the same
//! way.
//! The sampling interval itself is never throttled.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::events::{EventHub, EventStream};
use super::observer::TransitionObserver;
use crate::host::{HostPressure, ResourceSampler, SelfUsage};
use crate::models::throttle::ThrottleLevel;

/// Consecutive samples on the same side of the current level required
/// before a change is published.
pub const DEBOUNCE_SAMPLES: u32 = 2;

/// Capacity of each throttle-change subscriber queue.
const CHANGE_QUEUE_CAPACITY: usize = 16;

/// Governor thresholds with durations resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GovernorSettings {
    /// Fixed sampling interval.
    pub sample_interval: Duration,
    /// Own resident memory above which the level is `Constrained`.
    pub warning_bytes: u64,
    /// Own resident memory above which the level is `Emergency`.
    pub emergency_bytes: u64,
}

impl Default for GovernorSettings {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_secs(2),
            warning_bytes: 256 * 1024 * 1024,
            emergency_bytes: 512 * 1024 * 1024,
        }
    }
}

/// One governor reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GovernorSample {
    /// Own usage at sampling time.
    pub usage: SelfUsage,
    /// Host pressure at sampling time.
    pub pressure: HostPressure,
    /// Level this reading maps to, before debouncing.
    pub raw_level: ThrottleLevel,
}

/// Cheap, clonable read access to the current throttle level.
#[derive(Debug, Clone)]
pub struct ThrottleReader {
    rx: watch::Receiver<ThrottleLevel>,
}

impl ThrottleReader {
    /// A reader pinned to one level, for components run without a governor.
    #[must_use]
    pub fn fixed(level: ThrottleLevel) -> Self {
        let (_tx, rx) = watch::channel(level);
        Self { rx }
    }

    /// Level in effect right now. May change between two calls.
    #[must_use]
    pub fn current(&self) -> ThrottleLevel {
        *self.rx.borrow()
    }
}

/// Tracks a run of samples that all lie on the same side of the current
/// level.
#[derive(Debug, Default)]
struct Debounce {
    /// Level of the run closest to the current level.
    pending: Option<ThrottleLevel>,
    pending_count: u32,
}

impl Debounce {
    /// Feed one raw level; returns the levels to publish, in order.
    ///
    /// A change needs [`DEBOUNCE_SAMPLES`] consecutive samples moving in the
    /// same direction. The published level is the one every sample in the
    /// run agrees on, so readings that alternate between the two upper
    /// bands still escalate to the lower of them.
    fn observe(&mut self, current: ThrottleLevel, raw: ThrottleLevel) -> Vec<ThrottleLevel> {
        self.push(current, raw);
        if self.pending_count < DEBOUNCE_SAMPLES {
            return Vec::new();
        }
        let Some(target) = self.pending else {
            return Vec::new();
        };
        // The latest sample may already point past the published level.
        *self = Self::default();
        self.push(target, raw);
        vec![target]
    }

    fn push(&mut self, current: ThrottleLevel, raw: ThrottleLevel) {
        if raw == current {
            *self = Self::default();
            return;
        }
        let escalating = raw > current;
        match self.pending {
            Some(pending) if (pending > current) == escalating => {
                self.pending = Some(if escalating {
                    pending.min(raw)
                } else {
                    pending.max(raw)
                });
                self.pending_count += 1;
            }
            _ => {
                self.pending = Some(raw);
                self.pending_count = 1;
            }
        }
    }
}

/// Samples own usage and publishes throttle-level changes.
pub struct ResourceGovernor {
    sampler: Arc<dyn ResourceSampler>,
    settings: GovernorSettings,
    level_tx: watch::Sender<ThrottleLevel>,
    changes: EventHub<ThrottleLevel>,
    debounce: Mutex<Debounce>,
    last_sample: Mutex<Option<GovernorSample>>,
    observer: Arc<dyn TransitionObserver>,
}

impl ResourceGovernor {
    /// Construct a governor starting at `Normal`.
    #[must_use]
    pub fn new(
        sampler: Arc<dyn ResourceSampler>,
        settings: GovernorSettings,
        observer: Arc<dyn TransitionObserver>,
    ) -> Self {
        let (level_tx, _) = watch::channel(ThrottleLevel::Normal);
        Self {
            sampler,
            settings,
            level_tx,
            changes: EventHub::new("throttle", CHANGE_QUEUE_CAPACITY),
            debounce: Mutex::new(Debounce::default()),
            last_sample: Mutex::new(None),
            observer,
        }
    }

    /// Level currently in effect.
    #[must_use]
    pub fn current_level(&self) -> ThrottleLevel {
        *self.level_tx.borrow()
    }

    /// Stream of level changes (never periodic repeats).
    #[must_use]
    pub fn subscribe(&self) -> EventStream<ThrottleLevel> {
        self.changes.subscribe()
    }

    /// Reader handed to the other components.
    #[must_use]
    pub fn throttle(&self) -> ThrottleReader {
        ThrottleReader {
            rx: self.level_tx.subscribe(),
        }
    }

    /// Most recent reading, if any sample succeeded yet.
    #[must_use]
    pub fn last_sample(&self) -> Option<GovernorSample> {
        *self.last_sample.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Map a reading to a level using the fixed thresholds.
    #[must_use]
    pub fn evaluate(&self, usage: SelfUsage, pressure: HostPressure) -> ThrottleLevel {
        let by_memory = if usage.resident_bytes > self.settings.emergency_bytes {
            ThrottleLevel::Emergency
        } else if usage.resident_bytes > self.settings.warning_bytes {
            ThrottleLevel::Constrained
        } else {
            ThrottleLevel::Normal
        };
        let by_host = match pressure {
            HostPressure::Nominal => ThrottleLevel::Normal,
            HostPressure::Elevated => ThrottleLevel::Constrained,
            HostPressure::Critical => ThrottleLevel::Emergency,
        };
        by_memory.max(by_host)
    }

    /// Take one sample and publish any resulting level change.
    ///
    /// Returns the levels published by this sample, in order. A failed
    /// reading is logged and leaves the level untouched.
    pub async fn sample_once(&self) -> Vec<ThrottleLevel> {
        let sampler = Arc::clone(&self.sampler);
        let reading =
            tokio::task::spawn_blocking(move || (sampler.sample_self(), sampler.host_pressure()))
                .await;

        let (usage, pressure) = match reading {
            Ok((Ok(usage), pressure)) => (usage, pressure),
            Ok((Err(err), _)) => {
                warn!(%err, "own resource sample failed");
                return Vec::new();
            }
            Err(err) => {
                warn!(%err, "resource sampler task panicked");
                return Vec::new();
            }
        };

        let raw_level = self.evaluate(usage, pressure);
        *self.last_sample.lock().unwrap_or_else(PoisonError::into_inner) = Some(GovernorSample {
            usage,
            pressure,
            raw_level,
        });
        debug!(
            resident_bytes = usage.resident_bytes,
            cpu_fraction = usage.cpu_fraction,
            ?pressure,
            raw_level = raw_level.as_str(),
            "governor sample"
        );

        let emitted = {
            let mut debounce = self.debounce.lock().unwrap_or_else(PoisonError::into_inner);
            debounce.observe(self.current_level(), raw_level)
        };

        for level in &emitted {
            let previous = self.level_tx.send_replace(*level);
            debug!(
                from = previous.as_str(),
                to = level.as_str(),
                "throttle level changed"
            );
            self.changes.publish(*level);
            self.observer.throttle_changed(previous, *level);
        }
        emitted
    }

    /// Spawn the fixed-interval sampling loop.
    #[must_use]
    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let governor = Arc::clone(self);
        tokio::spawn(
            async move {
                loop {
                    governor.sample_once().await;
                    tokio::select! {
                        () = cancel.cancelled() => {
                            info!("resource governor shutting down");
                            break;
                        }
                        () = tokio::time::sleep(governor.settings.sample_interval) => {}
                    }
                }
            }
            .instrument(info_span!("resource_governor")),
        )
    }
}
