//! PublisherLoop - 定期的な QueueSnapshot の配信
//!
//! # フロー
//! 1. `snapshot_interval` ごとに QueueManager::snapshot() を組み立てる
//! 2. NotificationHub に `QueueEvent::Snapshot` として publish
//!
//! 購読者がいなければ store を読みません。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::domain::{QueueError, QueueEvent};
use crate::queue::QueueManager;

pub struct PublisherLoop {
    manager: Arc<QueueManager>,
    interval: Duration,
}

impl PublisherLoop {
    pub fn new(manager: Arc<QueueManager>, interval: Duration) -> Self {
        Self { manager, interval }
    }

    /// Publish one snapshot. Returns how many subscribers received it.
    pub async fn run_once(&self) -> Result<usize, QueueError> {
        let hub = self.manager.hub();
        if hub.subscriber_count() == 0 {
            return Ok(0);
        }
        let snapshot = self.manager.snapshot().await?;
        Ok(hub.publish(QueueEvent::Snapshot(snapshot)))
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        warn!(error = %e, "snapshot publish failed");
                    }
                }
            }
        }
        debug!("publisher loop stopped");
    }
}
