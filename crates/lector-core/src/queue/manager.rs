//! QueueManager - submit / status / cancel の窓口
//!
//! リクエスト処理側と Worker Loop の両方がここを通ります。
//! すべての変更は TaskStore に書いてから index と hub に反映します。
//!
//! # 設計原則
//! - 検証エラーは永続化の前に返す
//! - index に入っている id は必ず store にレコードがある（insert → push の順）
//! - Sync の待機は check → subscribe → re-check（取りこぼし防止）

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::app::hub::NotificationHub;
use crate::app::status::{QueueSnapshot, Statistics};
use crate::config::QueueConfig;
use crate::domain::{
    AudioRef, Priority, QueueError, QueueEvent, SubmitMode, Task, TaskChanged, TaskId, TaskPatch,
    TaskState, Transcript,
};
use crate::ports::{
    AudioStore, Clock, HistoryPage, HistoryQuery, IdGenerator, QueueCounts, TaskStore,
};
use crate::queue::index::{IndexEntry, QueueIndex};

/// Upper bound between store reads while a Sync submission waits.
const WAIT_POLL_INTERVAL: Duration = Duration::from_secs(1);

pub struct QueueManager {
    store: Arc<dyn TaskStore>,
    audio: Arc<dyn AudioStore>,
    index: Arc<QueueIndex>,
    hub: Arc<NotificationHub>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    config: QueueConfig,
    max_queue_size: AtomicUsize,
}

impl QueueManager {
    pub fn new(
        store: Arc<dyn TaskStore>,
        audio: Arc<dyn AudioStore>,
        hub: Arc<NotificationHub>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        config: QueueConfig,
    ) -> Self {
        let max_queue_size = AtomicUsize::new(config.max_queue_size);
        Self {
            store,
            audio,
            index: Arc::new(QueueIndex::new()),
            hub,
            clock,
            ids,
            config,
            max_queue_size,
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn audio(&self) -> &Arc<dyn AudioStore> {
        &self.audio
    }

    pub fn index(&self) -> &Arc<QueueIndex> {
        &self.index
    }

    pub fn hub(&self) -> &Arc<NotificationHub> {
        &self.hub
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn queue_depth(&self) -> usize {
        self.index.len()
    }

    pub fn max_queue_size(&self) -> usize {
        self.max_queue_size.load(Ordering::Relaxed)
    }

    pub fn set_max_queue_size(&self, size: usize) -> Result<(), QueueError> {
        if size == 0 {
            return Err(QueueError::InvalidArgument(
                "max_queue_size must be greater than 0".into(),
            ));
        }
        let previous = self.max_queue_size.swap(size, Ordering::Relaxed);
        info!(previous, max_queue_size = size, "queue limit changed");
        Ok(())
    }

    /// Submit an already stored audio blob.
    ///
    /// Async returns the Queued snapshot. Sync waits up to `sync_timeout`
    /// and returns the Done snapshot, `Model` for a Failed task, or
    /// `DeadlineExceeded`.
    pub async fn submit(
        &self,
        audio: AudioRef,
        priority: i64,
        mode: SubmitMode,
    ) -> Result<Task, QueueError> {
        let priority = Priority::new(priority)?;
        let task = self.enqueue(audio, priority, mode).await?;
        self.finish_submit(task).await
    }

    /// Store `bytes` and submit them. The blob is removed again if the task
    /// could not be persisted.
    pub async fn submit_audio(
        &self,
        bytes: &[u8],
        extension: &str,
        priority: i64,
        mode: SubmitMode,
    ) -> Result<Task, QueueError> {
        let priority = Priority::new(priority)?;
        self.check_capacity()?;

        let audio = self.audio.put(bytes, extension).await?;
        let task = match self.enqueue(audio.clone(), priority, mode).await {
            Ok(task) => task,
            Err(err) => {
                if let Err(cleanup) = self.audio.delete(&audio).await {
                    warn!(audio = %audio, error = %cleanup, "orphaned audio blob");
                }
                return Err(err);
            }
        };
        self.finish_submit(task).await
    }

    fn check_capacity(&self) -> Result<(), QueueError> {
        let depth = self.index.len();
        let capacity = self.max_queue_size();
        if depth >= capacity {
            return Err(QueueError::QueueFull { depth, capacity });
        }
        Ok(())
    }

    async fn enqueue(
        &self,
        audio: AudioRef,
        priority: Priority,
        mode: SubmitMode,
    ) -> Result<Task, QueueError> {
        self.check_capacity()?;

        let task = Task::new(
            self.ids.generate_task_id(),
            audio,
            priority,
            mode,
            self.clock.now(),
        );
        self.store.insert(&task).await?;
        self.index.push(IndexEntry::of(&task));
        self.notify(&task);

        info!(
            task_id = %task.id,
            priority = task.priority.get(),
            mode = mode.as_str(),
            queue_depth = self.index.len(),
            "task submitted"
        );
        Ok(task)
    }

    async fn finish_submit(&self, task: Task) -> Result<Task, QueueError> {
        if task.mode == SubmitMode::Async {
            return Ok(task);
        }

        let task = self
            .wait_for_terminal(task.id, self.config.sync_timeout)
            .await?;
        match task.state {
            TaskState::Failed => Err(QueueError::Model {
                task_id: task.id,
                message: task.error.unwrap_or_default(),
            }),
            _ => Ok(task),
        }
    }

    pub async fn status(&self, id: TaskId) -> Result<Task, QueueError> {
        self.store.get(id).await
    }

    /// Cancel a Queued task. Running and terminal tasks fail InvalidState.
    pub async fn cancel(&self, id: TaskId) -> Result<Task, QueueError> {
        let patch = TaskPatch::Cancel {
            at: self.clock.now(),
        };
        match self.store.update_if(id, TaskState::Queued, &patch).await? {
            Some(task) => {
                self.index.remove(id);
                self.notify(&task);
                info!(task_id = %id, "task cancelled");
                Ok(task)
            }
            None => {
                let current = self.store.get(id).await?;
                Err(QueueError::InvalidState {
                    task_id: id,
                    state: current.state,
                    action: patch.action(),
                })
            }
        }
    }

    /// Wait until `id` is Done or Failed.
    pub async fn wait_for_terminal(&self, id: TaskId, timeout: Duration) -> Result<Task, QueueError> {
        let task = self.store.get(id).await?;
        if task.state.is_terminal() {
            return Ok(task);
        }

        let mut events = self.hub.subscribe();

        // a terminal write between the first read and subscribe is seen here
        let task = self.store.get(id).await?;
        if task.state.is_terminal() {
            return Ok(task);
        }

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let now = tokio::time::Instant::now();
            if now >= deadline {
                debug!(task_id = %id, ?timeout, "sync wait timed out");
                return Err(QueueError::DeadlineExceeded {
                    task_id: id,
                    waited: timeout,
                });
            }

            // another process writing the same store does not publish here
            let wake = (now + WAIT_POLL_INTERVAL).min(deadline);
            let reread = match tokio::time::timeout_at(wake, events.recv()).await {
                Ok(Ok(QueueEvent::TaskChanged(change))) => {
                    change.task_id == id && change.state.is_terminal()
                }
                Ok(Ok(QueueEvent::Snapshot(_))) => false,
                Ok(Err(RecvError::Lagged(skipped))) => {
                    debug!(task_id = %id, skipped, "waiter lagged, rereading task");
                    true
                }
                Ok(Err(RecvError::Closed)) => {
                    return Err(QueueError::storage("notification hub closed"));
                }
                Err(_) => true,
            };

            if reread {
                let task = self.store.get(id).await?;
                if task.state.is_terminal() {
                    return Ok(task);
                }
            }
        }
    }

    pub async fn list_recent(&self, limit: usize) -> Result<Vec<Task>, QueueError> {
        self.store.list_recent(limit).await
    }

    pub async fn history(&self, query: &HistoryQuery) -> Result<HistoryPage, QueueError> {
        self.store.list_history(query).await
    }

    pub async fn counts(&self) -> Result<QueueCounts, QueueError> {
        self.store.counts().await
    }

    pub async fn snapshot(&self) -> Result<QueueSnapshot, QueueError> {
        let counts = self.store.counts().await?;
        let running = self.store.list_by_state(TaskState::Running).await?;
        let recent = self.store.list_recent(self.config.recent_limit).await?;
        Ok(QueueSnapshot::new(
            counts,
            self.index.snapshot(),
            &running,
            recent,
            self.max_queue_size(),
            self.clock.now(),
        ))
    }

    /// Waiting time and load over the trailing `window`.
    pub async fn statistics(&self, window: Duration, workers: usize) -> Result<Statistics, QueueError> {
        let window_chrono = chrono::Duration::from_std(window)
            .map_err(|_| QueueError::InvalidArgument(format!("window too large: {window:?}")))?;
        let since = self.clock.now() - window_chrono;
        let finished = self.store.list_finished_since(since).await?;
        Ok(Statistics::compute(&finished, window, workers))
    }

    /// Replace the index with every Queued task in the store.
    ///
    /// Runs at startup after orphan recovery and before any worker.
    pub async fn rebuild_index(&self) -> Result<usize, QueueError> {
        let queued = self.store.list_by_state(TaskState::Queued).await?;
        let count = queued.len();
        self.index.reset(queued.iter().map(IndexEntry::of));
        info!(queue_depth = count, "priority index rebuilt");
        Ok(count)
    }

    /// Bring the index back in line with the store.
    ///
    /// Returns `(added, removed)`.
    pub async fn resync_index(&self) -> Result<(usize, usize), QueueError> {
        // snapshot first: anything pushed after it is already in the store
        let indexed = self.index.snapshot();
        let queued = self.store.list_by_state(TaskState::Queued).await?;

        let mut added = 0;
        for task in &queued {
            if self.index.push(IndexEntry::of(task)) {
                added += 1;
            }
        }

        let mut removed = 0;
        for entry in indexed {
            if !queued.iter().any(|t| t.id == entry.task_id) && self.index.remove(entry.task_id) {
                removed += 1;
            }
        }

        if added > 0 || removed > 0 {
            warn!(added, removed, "priority index drifted from store");
        }
        Ok((added, removed))
    }

    /// Conditionally move a popped task to Running.
    ///
    /// `Ok(None)` when someone else claimed or cancelled it first.
    pub async fn claim(&self, id: TaskId) -> Result<Option<Task>, QueueError> {
        let patch = TaskPatch::Claim {
            at: self.clock.now(),
        };
        let claimed = self.store.update_if(id, TaskState::Queued, &patch).await?;
        if let Some(task) = &claimed {
            self.notify(task);
        }
        Ok(claimed)
    }

    pub async fn record_progress(&self, claimed: &Task, percent: u8) -> Result<Option<Task>, QueueError> {
        let patch = TaskPatch::Progress {
            percent,
            at: self.clock.now(),
        };
        self.write_claimed(claimed, &patch).await
    }

    /// Record the transcript. `Ok(None)` when the claim was lost meanwhile.
    pub async fn complete(
        &self,
        claimed: &Task,
        transcript: Transcript,
    ) -> Result<Option<Task>, QueueError> {
        let patch = TaskPatch::Complete {
            transcript,
            at: self.clock.now(),
        };
        self.write_claimed(claimed, &patch).await
    }

    pub async fn fail(
        &self,
        claimed: &Task,
        error: impl Into<String>,
    ) -> Result<Option<Task>, QueueError> {
        let patch = TaskPatch::Fail {
            error: error.into(),
            at: self.clock.now(),
        };
        self.write_claimed(claimed, &patch).await
    }

    /// Write only onto the claim `claimed` came from.
    async fn write_claimed(
        &self,
        claimed: &Task,
        patch: &TaskPatch,
    ) -> Result<Option<Task>, QueueError> {
        let started_at = claimed.started_at.ok_or(QueueError::InvalidState {
            task_id: claimed.id,
            state: claimed.state,
            action: patch.action(),
        })?;
        let task = self
            .store
            .update_claimed(claimed.id, started_at, patch)
            .await?;
        if let Some(task) = &task {
            self.notify(task);
        }
        Ok(task)
    }

    fn notify(&self, task: &Task) {
        let change = TaskChanged::from_task(task, self.index.len());
        self.hub.publish(QueueEvent::TaskChanged(change));
    }
}
