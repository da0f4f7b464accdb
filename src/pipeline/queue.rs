use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::domain::Event;
use crate::health::HealthMetrics;

/// Default capacity of every pipeline queue.
pub const DEFAULT_CAPACITY: usize = 1000;

/// Log one warning per this many dropped events on a queue.
const DROP_WARN_EVERY: u64 = 1000;

/// Enqueue failures.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum QueueError {
    /// The queue was full; the event was dropped and counted.
    #[error("queue {queue} full, dropped {kind} event")]
    CapacityExceeded {
        queue: &'static str,
        kind: &'static str,
    },

    /// The consumer is gone; nothing will read this queue again.
    #[error("queue {queue} closed")]
    Closed { queue: &'static str },
}

/// Producer half of a bounded pipeline queue.
///
/// `offer` never waits: when the queue is full the event is dropped and the
/// `events_dropped_total{queue}` counter is incremented (drop-and-count). Only
/// `send` waits for capacity, so announcements and the terminal event always
/// arrive.
#[derive(Clone)]
pub struct EventSender {
    name: &'static str,
    tx: mpsc::Sender<Event>,
    health: Arc<HealthMetrics>,
}

/// Creates a named bounded queue.
pub fn channel(
    name: &'static str,
    capacity: usize,
    health: Arc<HealthMetrics>,
) -> (EventSender, mpsc::Receiver<Event>) {
    let (tx, rx) = mpsc::channel(capacity);
    (EventSender { name, tx, health }, rx)
}

impl EventSender {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Attempts to enqueue without waiting.
    pub fn offer(&self, event: Event) -> Result<(), QueueError> {
        match self.tx.try_send(event) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(event)) => {
                let counter = self.health.events_dropped.with_label_values(&[self.name]);
                counter.inc();
                let dropped = counter.get();
                if dropped % DROP_WARN_EVERY == 1 {
                    warn!(queue = self.name, dropped, "queue full, dropping events");
                }
                Err(QueueError::CapacityExceeded {
                    queue: self.name,
                    kind: event.kind(),
                })
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(QueueError::Closed { queue: self.name }),
        }
    }

    /// Enqueues an event that must not be dropped, waiting for capacity if
    /// needed. Used for channel announcements and the terminal event.
    pub async fn send(&self, event: Event) -> Result<(), QueueError> {
        let kind = event.kind();
        self.tx.send(event).await.map_err(|_| {
            debug!(queue = self.name, kind, "consumer gone before delivery");
            QueueError::Closed { queue: self.name }
        })
    }

    /// Number of events the queue can still accept.
    pub fn remaining_capacity(&self) -> usize {
        self.tx.capacity()
    }
}
