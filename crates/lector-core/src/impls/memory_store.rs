//! InMemoryTaskStore - テスト・開発用の正本
//!
//! プロセスが終わればすべて消えます。永続化が必要なら SqliteTaskStore を使います。

use std::cmp::Reverse;
use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::domain::{QueueError, Task, TaskId, TaskPatch, TaskState};
use crate::ports::{HistoryPage, HistoryQuery, QueueCounts, TaskStore};

/// InMemoryTaskStore は HashMap 上の TaskStore
///
/// # 実装詳細
/// - 1 つの `tokio::sync::Mutex` で全タスクを守るので、同一 task への
///   更新は自然に直列化される
/// - 一覧系は毎回フルスキャン（件数が少ない前提）
#[derive(Default)]
pub struct InMemoryTaskStore {
    tasks: Mutex<HashMap<TaskId, Task>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn pop_order(a: &Task, b: &Task) -> std::cmp::Ordering {
    (Reverse(a.priority), a.submitted_at, a.id).cmp(&(Reverse(b.priority), b.submitted_at, b.id))
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn insert(&self, task: &Task) -> Result<TaskId, QueueError> {
        let mut tasks = self.tasks.lock().await;
        if tasks.contains_key(&task.id) {
            return Err(QueueError::storage(format!("duplicate task id {}", task.id)));
        }
        tasks.insert(task.id, task.clone());
        Ok(task.id)
    }

    async fn update(&self, id: TaskId, patch: &TaskPatch) -> Result<Task, QueueError> {
        let mut tasks = self.tasks.lock().await;
        let stored = tasks.get_mut(&id).ok_or(QueueError::NotFound(id))?;

        // apply to a copy so a rejected patch leaves the record untouched
        let mut next = stored.clone();
        next.apply(patch)?;
        *stored = next.clone();
        Ok(next)
    }

    async fn update_if(
        &self,
        id: TaskId,
        expected: TaskState,
        patch: &TaskPatch,
    ) -> Result<Option<Task>, QueueError> {
        let mut tasks = self.tasks.lock().await;
        let stored = tasks.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        if stored.state != expected {
            return Ok(None);
        }

        let mut next = stored.clone();
        next.apply(patch)?;
        *stored = next.clone();
        Ok(Some(next))
    }

    async fn update_claimed(
        &self,
        id: TaskId,
        started_at: DateTime<Utc>,
        patch: &TaskPatch,
    ) -> Result<Option<Task>, QueueError> {
        let mut tasks = self.tasks.lock().await;
        let stored = tasks.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        if !stored.holds_claim(started_at) {
            return Ok(None);
        }

        let mut next = stored.clone();
        next.apply(patch)?;
        *stored = next.clone();
        Ok(Some(next))
    }

    async fn get(&self, id: TaskId) -> Result<Task, QueueError> {
        let tasks = self.tasks.lock().await;
        tasks.get(&id).cloned().ok_or(QueueError::NotFound(id))
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<Task>, QueueError> {
        let tasks = self.tasks.lock().await;
        let mut all: Vec<Task> = tasks.values().cloned().collect();
        all.sort_by(|a, b| (b.submitted_at, b.id).cmp(&(a.submitted_at, a.id)));
        all.truncate(limit);
        Ok(all)
    }

    async fn list_by_state(&self, state: TaskState) -> Result<Vec<Task>, QueueError> {
        let tasks = self.tasks.lock().await;
        let mut matching: Vec<Task> = tasks.values().filter(|t| t.state == state).cloned().collect();
        matching.sort_by(pop_order);
        Ok(matching)
    }

    async fn list_history(&self, query: &HistoryQuery) -> Result<HistoryPage, QueueError> {
        let tasks = self.tasks.lock().await;
        let states = query.filter.states();
        let mut matching: Vec<Task> = tasks
            .values()
            .filter(|t| states.contains(&t.state))
            .cloned()
            .collect();
        matching.sort_by(|a, b| (b.updated_at, b.id).cmp(&(a.updated_at, a.id)));

        let total = matching.len();
        let page = matching
            .into_iter()
            .skip(query.offset())
            .take(query.page_size)
            .collect();
        Ok(HistoryPage::new(page, total, query))
    }

    async fn list_finished_since(&self, since: DateTime<Utc>) -> Result<Vec<Task>, QueueError> {
        let tasks = self.tasks.lock().await;
        let mut matching: Vec<Task> = tasks
            .values()
            .filter(|t| t.state.is_terminal() && t.finished_at.is_some_and(|f| f >= since))
            .cloned()
            .collect();
        matching.sort_by_key(|t| (t.finished_at, t.id));
        Ok(matching)
    }

    async fn list_reclaimable(&self, cutoff: DateTime<Utc>) -> Result<Vec<Task>, QueueError> {
        let tasks = self.tasks.lock().await;
        let mut matching: Vec<Task> = tasks
            .values()
            .filter(|t| {
                t.state.is_terminal()
                    && t.audio.is_some()
                    && t.finished_at.is_some_and(|f| f < cutoff)
            })
            .cloned()
            .collect();
        matching.sort_by_key(|t| (t.finished_at, t.id));
        Ok(matching)
    }

    async fn counts(&self) -> Result<QueueCounts, QueueError> {
        let tasks = self.tasks.lock().await;
        let mut counts = QueueCounts::default();
        for task in tasks.values() {
            counts.add(task.state, 1);
        }
        Ok(counts)
    }

    async fn prune(&self, cutoff: DateTime<Utc>) -> Result<usize, QueueError> {
        let mut tasks = self.tasks.lock().await;
        let before = tasks.len();
        tasks.retain(|_, t| {
            !(t.state.is_terminal()
                && t.audio.is_none()
                && t.finished_at.is_some_and(|f| f < cutoff))
        });
        Ok(before - tasks.len())
    }
}
