//! Status - キューの見え方（snapshot と統計）
//!
//! どちらも TaskStore と index から組み立てる読み取り専用のビューです。

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{Priority, Task, TaskId};
use crate::ports::QueueCounts;
use crate::queue::IndexEntry;

/// Queued task with its position in pop order (1-based).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingEntry {
    pub position: usize,
    pub task_id: TaskId,
    pub priority: Priority,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunningEntry {
    pub task_id: TaskId,
    pub progress: u8,
    pub started_at: Option<DateTime<Utc>>,
}

impl From<&Task> for RunningEntry {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.id,
            progress: task.progress,
            started_at: task.started_at,
        }
    }
}

/// Full view of the queue at one instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub counts: QueueCounts,
    pub queue_depth: usize,
    pub max_queue_size: usize,
    pub pending: Vec<PendingEntry>,
    pub running: Vec<RunningEntry>,
    /// Most recently submitted tasks, newest first.
    pub recent: Vec<Task>,
    pub at: DateTime<Utc>,
}

impl QueueSnapshot {
    pub fn new(
        counts: QueueCounts,
        index: Vec<IndexEntry>,
        running: &[Task],
        recent: Vec<Task>,
        max_queue_size: usize,
        at: DateTime<Utc>,
    ) -> Self {
        let pending: Vec<PendingEntry> = index
            .into_iter()
            .enumerate()
            .map(|(i, e)| PendingEntry {
                position: i + 1,
                task_id: e.task_id,
                priority: e.priority,
                submitted_at: e.submitted_at,
            })
            .collect();

        Self {
            counts,
            queue_depth: pending.len(),
            max_queue_size,
            pending,
            running: running.iter().map(RunningEntry::from).collect(),
            recent,
            at,
        }
    }
}

/// Averages over tasks that finished inside a trailing window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statistics {
    pub window_secs: u64,
    pub workers: usize,
    pub finished: usize,
    /// Mean time between submission and claim, seconds.
    pub average_wait_secs: f64,
    /// Share of worker capacity spent processing, percent.
    pub load_percent: f64,
}

impl Statistics {
    pub fn compute(finished: &[Task], window: Duration, workers: usize) -> Self {
        let waits: Vec<f64> = finished
            .iter()
            .filter_map(Task::waiting_time)
            .map(|d| d.as_secs_f64())
            .collect();
        let average_wait = if waits.is_empty() {
            0.0
        } else {
            waits.iter().sum::<f64>() / waits.len() as f64
        };

        let busy: f64 = finished
            .iter()
            .filter_map(Task::processing_time)
            .map(|d| d.as_secs_f64())
            .sum();
        let capacity = window.as_secs_f64() * workers as f64;
        let load = if capacity > 0.0 {
            busy / capacity * 100.0
        } else {
            0.0
        };

        Self {
            window_secs: window.as_secs(),
            workers,
            finished: finished.len(),
            average_wait_secs: round2(average_wait),
            load_percent: round2(load),
        }
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
