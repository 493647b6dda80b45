//! TaskStore port - 正本（source of truth）
//!
//! TaskStore は全タスクの永続レコードを排他的に所有します。
//! PriorityIndex は並び順のキーだけを持ち、常にここと突き合わせます。
//!
//! # 実装
//! - `impls::SqliteTaskStore`: 永続化（本番用）
//! - `impls::InMemoryTaskStore`: テスト・開発用

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::domain::task::INTERRUPTED_ERROR;
use crate::domain::{OrphanPolicy, QueueError, Task, TaskId, TaskPatch, TaskState};

/// TaskStore は状態・結果・タイムスタンプの正本
///
/// # 設計原則
/// - すべての書き込みは返る前に atomic かつ durable
/// - 同一 task への更新は直列化される（トランザクション内で read → apply → write）
/// - claim / cancel は `update_if` による条件付き遷移。プロセス内ロックではなく
///   ストア側で「今 Queued なら Running に」を保証する
/// - worker の進捗・結果は `update_claimed` で自分の claim にだけ書く
/// - パッチは `Task::apply` で検証され、不正な遷移は InvalidState
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Persist a new task. Fails if the id already exists.
    async fn insert(&self, task: &Task) -> Result<TaskId, QueueError>;

    /// Apply `patch` to the stored task and return the new snapshot.
    async fn update(&self, id: TaskId, patch: &TaskPatch) -> Result<Task, QueueError>;

    /// Apply `patch` only if the task is currently in `expected`.
    ///
    /// `Ok(None)` means another writer got there first.
    async fn update_if(
        &self,
        id: TaskId,
        expected: TaskState,
        patch: &TaskPatch,
    ) -> Result<Option<Task>, QueueError>;

    /// Apply `patch` only while the task is Running under the claim that
    /// started at `started_at` (see `Task::holds_claim`).
    ///
    /// `Ok(None)` means the claim was lost, e.g. another process recovered
    /// the task and a different worker claimed it again.
    async fn update_claimed(
        &self,
        id: TaskId,
        started_at: DateTime<Utc>,
        patch: &TaskPatch,
    ) -> Result<Option<Task>, QueueError>;

    async fn get(&self, id: TaskId) -> Result<Task, QueueError>;

    /// Most recently submitted first.
    async fn list_recent(&self, limit: usize) -> Result<Vec<Task>, QueueError>;

    /// Tasks in `state`, in pop order (priority desc, submitted_at asc).
    async fn list_by_state(&self, state: TaskState) -> Result<Vec<Task>, QueueError>;

    /// Terminal tasks, most recently updated first.
    async fn list_history(&self, query: &HistoryQuery) -> Result<HistoryPage, QueueError>;

    /// Terminal tasks with `finished_at >= since`.
    async fn list_finished_since(&self, since: DateTime<Utc>) -> Result<Vec<Task>, QueueError>;

    /// Terminal tasks finished before `cutoff` that still hold audio.
    async fn list_reclaimable(&self, cutoff: DateTime<Utc>) -> Result<Vec<Task>, QueueError>;

    async fn counts(&self) -> Result<QueueCounts, QueueError>;

    /// Delete terminal records whose audio is already reclaimed and that
    /// finished before `cutoff`. Returns the number of deleted records.
    async fn prune(&self, cutoff: DateTime<Utc>) -> Result<usize, QueueError>;

    /// Reclassify tasks left in Running by a previous process.
    ///
    /// Must run before any worker of this process starts, otherwise it would
    /// steal live tasks.
    async fn recover_orphans(
        &self,
        policy: OrphanPolicy,
        now: DateTime<Utc>,
    ) -> Result<Vec<TaskId>, QueueError> {
        let patch = match policy {
            OrphanPolicy::Requeue => TaskPatch::Requeue { at: now },
            OrphanPolicy::Fail => TaskPatch::Fail {
                error: INTERRUPTED_ERROR.to_string(),
                at: now,
            },
        };

        let mut recovered = Vec::new();
        for task in self.list_by_state(TaskState::Running).await? {
            match self.update_if(task.id, TaskState::Running, &patch).await? {
                Some(_) => recovered.push(task.id),
                None => warn!(task_id = %task.id, "orphan changed state during recovery"),
            }
        }
        Ok(recovered)
    }
}

/// Number of tasks per state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub queued: usize,
    pub running: usize,
    pub done: usize,
    pub failed: usize,
}

impl QueueCounts {
    pub fn add(&mut self, state: TaskState, n: usize) {
        match state {
            TaskState::Queued => self.queued += n,
            TaskState::Running => self.running += n,
            TaskState::Done => self.done += n,
            TaskState::Failed => self.failed += n,
        }
    }

    pub fn total(&self) -> usize {
        self.queued + self.running + self.done + self.failed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryFilter {
    #[default]
    All,
    Done,
    Failed,
}

impl HistoryFilter {
    pub fn states(self) -> &'static [TaskState] {
        match self {
            HistoryFilter::All => &[TaskState::Done, TaskState::Failed],
            HistoryFilter::Done => &[TaskState::Done],
            HistoryFilter::Failed => &[TaskState::Failed],
        }
    }
}

impl std::str::FromStr for HistoryFilter {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(HistoryFilter::All),
            "done" | "completed" => Ok(HistoryFilter::Done),
            "failed" => Ok(HistoryFilter::Failed),
            other => Err(QueueError::InvalidArgument(format!(
                "unknown history filter '{other}'"
            ))),
        }
    }
}

/// One page of the terminal-task history (1-based pages).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryQuery {
    pub page: usize,
    pub page_size: usize,
    pub filter: HistoryFilter,
}

impl HistoryQuery {
    pub const MAX_PAGE_SIZE: usize = 500;

    pub fn new(page: usize, page_size: usize, filter: HistoryFilter) -> Result<Self, QueueError> {
        if page == 0 {
            return Err(QueueError::InvalidArgument("page starts at 1".into()));
        }
        if page_size == 0 || page_size > Self::MAX_PAGE_SIZE {
            return Err(QueueError::InvalidArgument(format!(
                "page_size must be in 1..={}",
                Self::MAX_PAGE_SIZE
            )));
        }
        Ok(Self {
            page,
            page_size,
            filter,
        })
    }

    pub fn offset(&self) -> usize {
        (self.page - 1).saturating_mul(self.page_size)
    }
}

impl Default for HistoryQuery {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: 50,
            filter: HistoryFilter::All,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryPage {
    pub tasks: Vec<Task>,
    pub total_count: usize,
    pub total_pages: usize,
    pub current_page: usize,
    pub page_size: usize,
    pub has_next: bool,
    pub has_prev: bool,
}

impl HistoryPage {
    pub fn new(tasks: Vec<Task>, total_count: usize, query: &HistoryQuery) -> Self {
        let total_pages = total_count.div_ceil(query.page_size);
        Self {
            tasks,
            total_count,
            total_pages,
            current_page: query.page,
            page_size: query.page_size,
            has_next: query.page < total_pages,
            has_prev: query.page > 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(1, 10, 25, 3, true, false)]
    #[case(3, 10, 25, 3, false, true)]
    #[case(2, 10, 20, 2, false, true)]
    #[case(1, 50, 0, 0, false, false)]
    fn history_page_math(
        #[case] page: usize,
        #[case] page_size: usize,
        #[case] total: usize,
        #[case] total_pages: usize,
        #[case] has_next: bool,
        #[case] has_prev: bool,
    ) {
        let query = HistoryQuery::new(page, page_size, HistoryFilter::All).unwrap();
        let p = HistoryPage::new(Vec::new(), total, &query);
        assert_eq!(p.total_pages, total_pages);
        assert_eq!(p.has_next, has_next);
        assert_eq!(p.has_prev, has_prev);
    }

    #[test]
    fn history_query_validates() {
        assert!(HistoryQuery::new(0, 10, HistoryFilter::All).is_err());
        assert!(HistoryQuery::new(1, 0, HistoryFilter::All).is_err());
        assert!(HistoryQuery::new(1, 501, HistoryFilter::All).is_err());
        assert_eq!(
            HistoryQuery::new(3, 20, HistoryFilter::Done).unwrap().offset(),
            40
        );
    }

    #[test]
    fn counts_total() {
        let mut c = QueueCounts::default();
        c.add(TaskState::Queued, 2);
        c.add(TaskState::Failed, 1);
        assert_eq!(c.total(), 3);
        assert_eq!(c.queued, 2);
    }
}
