//! ReconcileLoop - index と store の突き合わせ
//!
//! index は正本ではないので、定期的に TaskStore の Queued と比べて
//! 足りない id を push し、もう Queued でない id を外します。
//! 別プロセスが同じ store に submit した場合もここで拾われます。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::domain::QueueError;
use crate::queue::QueueManager;

pub struct ReconcileLoop {
    manager: Arc<QueueManager>,
    interval: Duration,
}

impl ReconcileLoop {
    pub fn new(manager: Arc<QueueManager>, interval: Duration) -> Self {
        Self { manager, interval }
    }

    /// Returns `(added, removed)`.
    pub async fn run_once(&self) -> Result<(usize, usize), QueueError> {
        self.manager.resync_index().await
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        // the first tick fires immediately and the index was just rebuilt
        ticker.tick().await;
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        warn!(error = %e, "index reconciliation failed");
                    }
                }
            }
        }
        debug!("reconcile loop stopped");
    }
}
