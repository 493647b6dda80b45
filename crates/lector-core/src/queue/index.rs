//! Priority index over Queued task ids.
//!
//! The index holds only ids and sort keys. It is rebuilt from the task store
//! at startup and never trusted alone: a popped id still has to be claimed
//! through the store.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashSet};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::domain::{Priority, Task, TaskId};

/// Sort key of one queued task.
///
/// Ordering is "greater pops first": higher priority, then earlier
/// submission, then smaller id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub task_id: TaskId,
    pub priority: Priority,
    pub submitted_at: DateTime<Utc>,
}

impl IndexEntry {
    pub fn of(task: &Task) -> Self {
        Self {
            task_id: task.id,
            priority: task.priority,
            submitted_at: task.submitted_at,
        }
    }

    fn key(&self) -> (Priority, Reverse<DateTime<Utc>>, Reverse<TaskId>) {
        (self.priority, Reverse(self.submitted_at), Reverse(self.task_id))
    }
}

impl PartialOrd for IndexEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IndexEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

/// Max-heap with lazy removal.
///
/// `live` is the set of ids that may still be popped; heap entries whose id
/// is no longer live are discarded when they reach the top.
#[derive(Debug, Default)]
pub struct PriorityIndex {
    heap: BinaryHeap<IndexEntry>,
    live: HashSet<TaskId>,
}

impl PriorityIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the id was already present.
    pub fn push(&mut self, entry: IndexEntry) -> bool {
        if !self.live.insert(entry.task_id) {
            return false;
        }
        self.heap.push(entry);
        true
    }

    pub fn pop_highest(&mut self) -> Option<IndexEntry> {
        while let Some(entry) = self.heap.pop() {
            if self.live.remove(&entry.task_id) {
                return Some(entry);
            }
        }
        None
    }

    pub fn remove(&mut self, task_id: TaskId) -> bool {
        let removed = self.live.remove(&task_id);
        if self.live.is_empty() {
            self.heap.clear();
        }
        removed
    }

    pub fn contains(&self, task_id: TaskId) -> bool {
        self.live.contains(&task_id)
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Live entries in pop order.
    pub fn snapshot(&self) -> Vec<IndexEntry> {
        let mut entries: Vec<IndexEntry> = self
            .heap
            .iter()
            .filter(|e| self.live.contains(&e.task_id))
            .copied()
            .collect();
        entries.sort_by(|a, b| b.cmp(a));
        entries.dedup_by_key(|e| e.task_id);
        entries
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.live.clear();
    }
}

/// Shared index used by the queue manager and the workers.
///
/// # 実装
/// - `std::sync::Mutex` は `.await` をまたいで保持しない
/// - `next()` は `Notify` を登録してから確認するので push を取りこぼさない
#[derive(Debug, Default)]
pub struct QueueIndex {
    inner: Mutex<PriorityIndex>,
    pushed: Notify,
}

impl QueueIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PriorityIndex> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, entry: IndexEntry) -> bool {
        let added = self.lock().push(entry);
        if added {
            self.pushed.notify_waiters();
        }
        added
    }

    pub fn pop_highest(&self) -> Option<IndexEntry> {
        self.lock().pop_highest()
    }

    pub fn remove(&self, task_id: TaskId) -> bool {
        self.lock().remove(task_id)
    }

    pub fn contains(&self, task_id: TaskId) -> bool {
        self.lock().contains(task_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn snapshot(&self) -> Vec<IndexEntry> {
        self.lock().snapshot()
    }

    /// Replace the content with `entries` (startup rebuild).
    pub fn reset(&self, entries: impl IntoIterator<Item = IndexEntry>) {
        let added = {
            let mut index = self.lock();
            index.clear();
            let mut added = false;
            for entry in entries {
                added |= index.push(entry);
            }
            added
        };
        if added {
            self.pushed.notify_waiters();
        }
    }

    /// Pop the highest entry, waiting until one is pushed.
    pub async fn next(&self) -> IndexEntry {
        loop {
            let notified = self.pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(entry) = self.pop_highest() {
                return entry;
            }
            notified.await;
        }
    }
}
