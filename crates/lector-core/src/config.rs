//! QueueConfig - キューとワーカーの設定
//!
//! orphan_policy だけは既定値を持ちません。クラッシュで取り残された Running
//! タスクをどう扱うかは、運用者が明示的に選びます。

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::OrphanPolicy;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{field} must be greater than 0")]
    Zero { field: &'static str },

    #[error("{field} must be at least {min:?}")]
    TooShort { field: &'static str, min: Duration },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    pub orphan_policy: OrphanPolicy,

    /// Submissions fail QueueFull once this many tasks are Queued.
    #[serde(default = "defaults::max_queue_size")]
    pub max_queue_size: usize,

    #[serde(default = "defaults::worker_count")]
    pub worker_count: usize,

    /// How long a Sync submission waits for a terminal state.
    #[serde(default = "defaults::sync_timeout")]
    pub sync_timeout: Duration,

    /// Minimum spacing between persisted progress updates.
    #[serde(default = "defaults::progress_interval")]
    pub progress_interval: Duration,

    /// Audio of terminal tasks is reclaimed this long after `finished_at`.
    #[serde(default = "defaults::retention_horizon")]
    pub retention_horizon: Duration,

    #[serde(default = "defaults::retention_interval")]
    pub retention_interval: Duration,

    /// Delete reclaimed terminal records this long after `finished_at`.
    #[serde(default)]
    pub prune_records_after: Option<Duration>,

    #[serde(default = "defaults::reconcile_interval")]
    pub reconcile_interval: Duration,

    #[serde(default = "defaults::snapshot_interval")]
    pub snapshot_interval: Duration,

    #[serde(default = "defaults::recent_limit")]
    pub recent_limit: usize,
}

mod defaults {
    use std::time::Duration;

    pub fn max_queue_size() -> usize {
        10
    }

    pub fn worker_count() -> usize {
        1
    }

    pub fn sync_timeout() -> Duration {
        Duration::from_secs(300)
    }

    pub fn progress_interval() -> Duration {
        Duration::from_millis(500)
    }

    pub fn retention_horizon() -> Duration {
        Duration::from_secs(30 * 60)
    }

    pub fn retention_interval() -> Duration {
        Duration::from_secs(60 * 60)
    }

    pub fn reconcile_interval() -> Duration {
        Duration::from_secs(5)
    }

    pub fn snapshot_interval() -> Duration {
        Duration::from_secs(1)
    }

    pub fn recent_limit() -> usize {
        10
    }
}

impl QueueConfig {
    pub fn new(orphan_policy: OrphanPolicy) -> Self {
        Self {
            orphan_policy,
            max_queue_size: defaults::max_queue_size(),
            worker_count: defaults::worker_count(),
            sync_timeout: defaults::sync_timeout(),
            progress_interval: defaults::progress_interval(),
            retention_horizon: defaults::retention_horizon(),
            retention_interval: defaults::retention_interval(),
            prune_records_after: None,
            reconcile_interval: defaults::reconcile_interval(),
            snapshot_interval: defaults::snapshot_interval(),
            recent_limit: defaults::recent_limit(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let nonzero = [
            ("max_queue_size", self.max_queue_size),
            ("worker_count", self.worker_count),
            ("recent_limit", self.recent_limit),
        ];
        for (field, value) in nonzero {
            if value == 0 {
                return Err(ConfigError::Zero { field });
            }
        }

        let intervals = [
            ("sync_timeout", self.sync_timeout),
            ("retention_interval", self.retention_interval),
            ("reconcile_interval", self.reconcile_interval),
            ("snapshot_interval", self.snapshot_interval),
        ];
        for (field, value) in intervals {
            if value.is_zero() {
                return Err(ConfigError::Zero { field });
            }
        }

        if let Some(prune) = self.prune_records_after
            && prune < self.retention_horizon
        {
            return Err(ConfigError::TooShort {
                field: "prune_records_after",
                min: self.retention_horizon,
            });
        }
        Ok(())
    }
}
