//! Publish/subscribe channel with bounded, drop-oldest subscriber queues.
//!
//! Publishing never blocks: each subscriber reads from its own cursor into
//! a bounded ring, and a subscriber that falls behind loses its oldest
//! undelivered events (logged as a warning) instead of stalling the
//! producer.

use tokio::sync::broadcast;
use tracing::warn;

/// Producer side shared by a component that emits events.
#[derive(Debug)]
pub struct EventHub<T: Clone> {
    tx: broadcast::Sender<T>,
    topic: &'static str,
}

impl<T: Clone> Clone for EventHub<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            topic: self.topic,
        }
    }
}

impl<T: Clone> EventHub<T> {
    /// Create a hub whose subscribers each buffer up to `capacity` events.
    ///
    /// A zero capacity is raised to one.
    #[must_use]
    pub fn new(topic: &'static str, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx, topic }
    }

    /// Publish an event to every current subscriber. Never blocks.
    pub fn publish(&self, event: T) {
        // No subscribers is not an error.
        let _ = self.tx.send(event);
    }

    /// Open a new subscription; it only sees events published afterwards.
    #[must_use]
    pub fn subscribe(&self) -> EventStream<T> {
        EventStream {
            rx: self.tx.subscribe(),
            topic: self.topic,
            dropped: 0,
        }
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Consumer side of an [`EventHub`].
#[derive(Debug)]
pub struct EventStream<T: Clone> {
    rx: broadcast::Receiver<T>,
    topic: &'static str,
    dropped: u64,
}

impl<T: Clone> EventStream<T> {
    /// Wait for the next event. Returns `None` once the hub is gone.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => self.record_drop(skipped),
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Take the next buffered event without waiting.
    pub fn try_recv(&mut self) -> Option<T> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => self.record_drop(skipped),
                Err(_) => return None,
            }
        }
    }

    /// Total events this subscriber lost to overflow.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    fn record_drop(&mut self, skipped: u64) {
        self.dropped += skipped;
        warn!(
            topic = self.topic,
            skipped,
            total_dropped = self.dropped,
            "slow subscriber lost oldest events"
        );
    }
}
