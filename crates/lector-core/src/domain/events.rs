//! Events - NotificationHub に流れるイベント
//!
//! イベントは通知のためのものであり、正本ではありません。
//! 取りこぼした subscriber は `status` / `list_recent` で再同期します。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::TaskId;
use super::state::TaskState;
use super::task::Task;
use crate::app::status::QueueSnapshot;

/// QueueEvent は購読者に配送されるイベント
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueEvent {
    /// A task was created or changed state or progress.
    TaskChanged(TaskChanged),

    /// Periodic full view for dashboards.
    Snapshot(QueueSnapshot),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskChanged {
    pub task_id: TaskId,
    pub state: TaskState,
    pub progress: u8,
    pub queue_depth: usize,
    pub at: DateTime<Utc>,
}

impl TaskChanged {
    pub fn from_task(task: &Task, queue_depth: usize) -> Self {
        Self {
            task_id: task.id,
            state: task.state,
            progress: task.progress,
            queue_depth,
            at: task.updated_at,
        }
    }
}

impl QueueEvent {
    /// The task this event is about, if any.
    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            QueueEvent::TaskChanged(change) => Some(change.task_id),
            QueueEvent::Snapshot(_) => None,
        }
    }
}
