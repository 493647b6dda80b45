//! NotificationHub - broadcast-based fan-out of queue events.
//!
//! Best effort: a subscriber that falls behind lags and must resync through
//! `status` / `list_recent`. The hub is never the source of truth.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::broadcast;

use crate::domain::QueueEvent;

const DEFAULT_CAPACITY: usize = 1024;

pub struct NotificationHub {
    tx: broadcast::Sender<QueueEvent>,
    published: AtomicU64,
}

impl NotificationHub {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            published: AtomicU64::new(0),
        }
    }

    /// Publish to current subscribers. Never blocks.
    ///
    /// Returns how many subscribers the event was handed to.
    pub fn publish(&self, event: QueueEvent) -> usize {
        self.published.fetch_add(1, Ordering::Relaxed);
        self.tx.send(event).unwrap_or(0)
    }

    /// Events published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

impl Default for NotificationHub {
    fn default() -> Self {
        Self::new()
    }
}
