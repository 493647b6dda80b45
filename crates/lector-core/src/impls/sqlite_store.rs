//! SqliteTaskStore - 永続化された正本
//!
//! # 実装
//! - 1 本の接続を `std::sync::Mutex` で共有し、呼び出しは `spawn_blocking` で実行
//! - WAL + `synchronous=FULL`: 書き込みは返る前に durable
//! - 更新は `BEGIN IMMEDIATE` の中で read → `Task::apply` → write。
//!   データベース単位で writer が直列化されるので、同一 task の更新が
//!   交錯することはない
//! - タイムスタンプは Unix マイクロ秒の INTEGER

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params, params_from_iter};
use tracing::debug;

use crate::domain::{
    AudioRef, Priority, QueueError, SubmitMode, Task, TaskId, TaskPatch, TaskState, Transcript,
};
use crate::ports::{HistoryPage, HistoryQuery, QueueCounts, TaskStore};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS tasks (
    id           TEXT PRIMARY KEY NOT NULL,
    priority     INTEGER NOT NULL CHECK (priority BETWEEN 1 AND 100),
    state        TEXT NOT NULL CHECK (state IN ('queued', 'running', 'done', 'failed')),
    mode         TEXT NOT NULL CHECK (mode IN ('sync', 'async')),
    audio_ref    TEXT,
    progress     INTEGER NOT NULL DEFAULT 0,
    result       TEXT,
    error        TEXT,
    submitted_at INTEGER NOT NULL,
    updated_at   INTEGER NOT NULL,
    started_at   INTEGER,
    finished_at  INTEGER,
    reclaimed_at INTEGER
);
CREATE INDEX IF NOT EXISTS idx_tasks_state_order ON tasks (state, priority DESC, submitted_at);
CREATE INDEX IF NOT EXISTS idx_tasks_updated_at ON tasks (updated_at);
CREATE INDEX IF NOT EXISTS idx_tasks_finished_at ON tasks (finished_at);
";

const COLUMNS: &str = "id, priority, state, mode, audio_ref, progress, result, error, \
                       submitted_at, updated_at, started_at, finished_at, reclaimed_at";

const TERMINAL: &str = "('done', 'failed')";

/// SqliteTaskStore は SQLite ファイル上の TaskStore
///
/// 複数プロセスが同じファイルを開いても、claim は条件付き UPDATE なので
/// 1 つの task を 2 つの worker が取ることはありません。
#[derive(Clone)]
pub struct SqliteTaskStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteTaskStore {
    /// Open (or create) the database file and apply the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, QueueError> {
        let conn = Connection::open(path.as_ref())?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, QueueError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, QueueError> {
        conn.busy_timeout(Duration::from_secs(5))?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        conn.execute_batch(SCHEMA)?;
        debug!(journal_mode = %mode, "task store opened");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, QueueError>
    where
        F: FnOnce(&mut Connection) -> Result<T, QueueError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut guard)
        })
        .await
        .map_err(|e| QueueError::storage(format!("store task failed: {e}")))?
    }
}

fn to_micros(at: DateTime<Utc>) -> i64 {
    at.timestamp_micros()
}

fn from_micros(value: i64) -> Result<DateTime<Utc>, QueueError> {
    DateTime::from_timestamp_micros(value)
        .ok_or_else(|| QueueError::storage(format!("timestamp out of range: {value}")))
}

fn from_micros_opt(value: Option<i64>) -> Result<Option<DateTime<Utc>>, QueueError> {
    value.map(from_micros).transpose()
}

/// Raw column values; converted to a `Task` outside the rusqlite row closure.
struct TaskRow {
    id: String,
    priority: i64,
    state: String,
    mode: String,
    audio_ref: Option<String>,
    progress: i64,
    result: Option<String>,
    error: Option<String>,
    submitted_at: i64,
    updated_at: i64,
    started_at: Option<i64>,
    finished_at: Option<i64>,
    reclaimed_at: Option<i64>,
}

impl TaskRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            priority: row.get(1)?,
            state: row.get(2)?,
            mode: row.get(3)?,
            audio_ref: row.get(4)?,
            progress: row.get(5)?,
            result: row.get(6)?,
            error: row.get(7)?,
            submitted_at: row.get(8)?,
            updated_at: row.get(9)?,
            started_at: row.get(10)?,
            finished_at: row.get(11)?,
            reclaimed_at: row.get(12)?,
        })
    }

    fn into_task(self) -> Result<Task, QueueError> {
        let id: TaskId = self
            .id
            .parse()
            .map_err(|e| QueueError::storage(format!("corrupt task id: {e}")))?;
        let result = self
            .result
            .map(|json| serde_json::from_str::<Transcript>(&json))
            .transpose()?;

        Ok(Task {
            id,
            priority: Priority::new(self.priority)?,
            mode: self.mode.parse::<SubmitMode>()?,
            state: self.state.parse::<TaskState>()?,
            audio: self.audio_ref.map(AudioRef::new),
            progress: self.progress.clamp(0, 100) as u8,
            result,
            error: self.error,
            submitted_at: from_micros(self.submitted_at)?,
            updated_at: from_micros(self.updated_at)?,
            started_at: from_micros_opt(self.started_at)?,
            finished_at: from_micros_opt(self.finished_at)?,
            reclaimed_at: from_micros_opt(self.reclaimed_at)?,
        })
    }
}

fn query_tasks<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<Vec<Task>, QueueError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, TaskRow::read)?;
    let mut tasks = Vec::new();
    for row in rows {
        tasks.push(row?.into_task()?);
    }
    Ok(tasks)
}

fn select_task(conn: &Connection, id: TaskId) -> Result<Option<Task>, QueueError> {
    let sql = format!("SELECT {COLUMNS} FROM tasks WHERE id = ?1");
    conn.query_row(&sql, params![id.to_string()], TaskRow::read)
        .optional()?
        .map(TaskRow::into_task)
        .transpose()
}

fn write_task(conn: &Connection, task: &Task) -> Result<(), QueueError> {
    let result = task.result.as_ref().map(serde_json::to_string).transpose()?;
    conn.execute(
        "UPDATE tasks SET priority = ?2, state = ?3, mode = ?4, audio_ref = ?5, progress = ?6,
                result = ?7, error = ?8, submitted_at = ?9, updated_at = ?10,
                started_at = ?11, finished_at = ?12, reclaimed_at = ?13
         WHERE id = ?1",
        params![
            task.id.to_string(),
            i64::from(task.priority),
            task.state.as_str(),
            task.mode.as_str(),
            task.audio.as_ref().map(AudioRef::as_str),
            i64::from(task.progress),
            result,
            task.error,
            to_micros(task.submitted_at),
            to_micros(task.updated_at),
            task.started_at.map(to_micros),
            task.finished_at.map(to_micros),
            task.reclaimed_at.map(to_micros),
        ],
    )?;
    Ok(())
}

/// Read, check `guard`, apply, write. All inside one IMMEDIATE transaction.
fn patch_task(
    conn: &mut Connection,
    id: TaskId,
    guard: impl FnOnce(&Task) -> bool,
    patch: &TaskPatch,
) -> Result<Option<Task>, QueueError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let mut task = select_task(&tx, id)?.ok_or(QueueError::NotFound(id))?;

    if !guard(&task) {
        return Ok(None);
    }
    if task.apply(patch)? {
        write_task(&tx, &task)?;
    }
    tx.commit()?;
    Ok(Some(task))
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn insert(&self, task: &Task) -> Result<TaskId, QueueError> {
        let task = task.clone();
        self.with_conn(move |conn| {
            let result = task.result.as_ref().map(serde_json::to_string).transpose()?;
            let sql = format!(
                "INSERT INTO tasks ({COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
            );
            conn.execute(
                &sql,
                params![
                    task.id.to_string(),
                    i64::from(task.priority),
                    task.state.as_str(),
                    task.mode.as_str(),
                    task.audio.as_ref().map(AudioRef::as_str),
                    i64::from(task.progress),
                    result,
                    task.error,
                    to_micros(task.submitted_at),
                    to_micros(task.updated_at),
                    task.started_at.map(to_micros),
                    task.finished_at.map(to_micros),
                    task.reclaimed_at.map(to_micros),
                ],
            )?;
            Ok(task.id)
        })
        .await
    }

    async fn update(&self, id: TaskId, patch: &TaskPatch) -> Result<Task, QueueError> {
        let patch = patch.clone();
        self.with_conn(move |conn| {
            patch_task(conn, id, |_| true, &patch)?.ok_or(QueueError::NotFound(id))
        })
        .await
    }

    async fn update_if(
        &self,
        id: TaskId,
        expected: TaskState,
        patch: &TaskPatch,
    ) -> Result<Option<Task>, QueueError> {
        let patch = patch.clone();
        self.with_conn(move |conn| patch_task(conn, id, |t| t.state == expected, &patch))
            .await
    }

    async fn update_claimed(
        &self,
        id: TaskId,
        started_at: DateTime<Utc>,
        patch: &TaskPatch,
    ) -> Result<Option<Task>, QueueError> {
        let patch = patch.clone();
        self.with_conn(move |conn| {
            patch_task(conn, id, |t| t.holds_claim(started_at), &patch)
        })
        .await
    }

    async fn get(&self, id: TaskId) -> Result<Task, QueueError> {
        self.with_conn(move |conn| select_task(conn, id)?.ok_or(QueueError::NotFound(id)))
            .await
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<Task>, QueueError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {COLUMNS} FROM tasks ORDER BY submitted_at DESC, id DESC LIMIT ?1"
            );
            query_tasks(conn, &sql, params![limit])
        })
        .await
    }

    async fn list_by_state(&self, state: TaskState) -> Result<Vec<Task>, QueueError> {
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {COLUMNS} FROM tasks WHERE state = ?1
                 ORDER BY priority DESC, submitted_at ASC, id ASC"
            );
            query_tasks(conn, &sql, params![state.as_str()])
        })
        .await
    }

    async fn list_history(&self, query: &HistoryQuery) -> Result<HistoryPage, QueueError> {
        let query = *query;
        self.with_conn(move |conn| {
            let states: Vec<&str> = query.filter.states().iter().map(|s| s.as_str()).collect();
            let placeholders = vec!["?"; states.len()].join(", ");

            let count_sql = format!("SELECT COUNT(*) FROM tasks WHERE state IN ({placeholders})");
            let total: i64 =
                conn.query_row(&count_sql, params_from_iter(states.iter()), |row| row.get(0))?;

            let page_sql = format!(
                "SELECT {COLUMNS} FROM tasks WHERE state IN ({placeholders})
                 ORDER BY updated_at DESC, id DESC LIMIT {} OFFSET {}",
                query.page_size,
                query.offset()
            );
            let tasks = query_tasks(conn, &page_sql, params_from_iter(states.iter()))?;
            Ok(HistoryPage::new(tasks, total.max(0) as usize, &query))
        })
        .await
    }

    async fn list_finished_since(&self, since: DateTime<Utc>) -> Result<Vec<Task>, QueueError> {
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {COLUMNS} FROM tasks
                 WHERE state IN {TERMINAL} AND finished_at >= ?1
                 ORDER BY finished_at ASC, id ASC"
            );
            query_tasks(conn, &sql, params![to_micros(since)])
        })
        .await
    }

    async fn list_reclaimable(&self, cutoff: DateTime<Utc>) -> Result<Vec<Task>, QueueError> {
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {COLUMNS} FROM tasks
                 WHERE state IN {TERMINAL} AND audio_ref IS NOT NULL AND finished_at < ?1
                 ORDER BY finished_at ASC, id ASC"
            );
            query_tasks(conn, &sql, params![to_micros(cutoff)])
        })
        .await
    }

    async fn counts(&self) -> Result<QueueCounts, QueueError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT state, COUNT(*) FROM tasks GROUP BY state")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;

            let mut counts = QueueCounts::default();
            for row in rows {
                let (state, n) = row?;
                counts.add(state.parse()?, n.max(0) as usize);
            }
            Ok(counts)
        })
        .await
    }

    async fn prune(&self, cutoff: DateTime<Utc>) -> Result<usize, QueueError> {
        self.with_conn(move |conn| {
            let sql = format!(
                "DELETE FROM tasks
                 WHERE state IN {TERMINAL} AND audio_ref IS NULL AND finished_at < ?1"
            );
            Ok(conn.execute(&sql, params![to_micros(cutoff)])?)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ErrorKind, OrphanPolicy, Segment};
    use crate::ports::HistoryFilter;
    use chrono::TimeZone;
    use ulid::Ulid;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn task(priority: i64, offset_secs: i64) -> Task {
        Task::new(
            TaskId::from_ulid(Ulid::new()),
            AudioRef::new("audio-x.wav"),
            Priority::new(priority).unwrap(),
            SubmitMode::Sync,
            t0() + chrono::Duration::seconds(offset_secs),
        )
    }

    #[tokio::test]
    async fn full_row_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.db");

        let t = task(42, 0);
        {
            let store = SqliteTaskStore::open(&path).unwrap();
            store.insert(&t).await.unwrap();
            store.update(t.id, &TaskPatch::Claim { at: t0() }).await.unwrap();
            store
                .update(t.id, &TaskPatch::Complete {
                    transcript: Transcript::new("hello", 0.8).with_segments(vec![Segment {
                        speaker: Some("0".into()),
                        start_ms: 0,
                        end_ms: 1500,
                        text: "hello".into(),
                    }]),
                    at: t0() + chrono::Duration::milliseconds(1234),
                })
                .await
                .unwrap();
        }

        let store = SqliteTaskStore::open(&path).unwrap();
        let got = store.get(t.id).await.unwrap();
        assert_eq!(got.state, TaskState::Done);
        assert_eq!(got.priority.get(), 42);
        assert_eq!(got.mode, SubmitMode::Sync);
        assert_eq!(got.result.as_ref().unwrap().segments.len(), 1);
        assert_eq!(got.finished_at, Some(t0() + chrono::Duration::milliseconds(1234)));
    }

    #[tokio::test]
    async fn unknown_id_is_not_found() {
        let store = SqliteTaskStore::open_in_memory().unwrap();
        let id = TaskId::from_ulid(Ulid::new());
        assert_eq!(store.get(id).await.unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(
            store
                .update(id, &TaskPatch::Cancel { at: t0() })
                .await
                .unwrap_err()
                .kind(),
            ErrorKind::NotFound
        );
    }

    #[tokio::test]
    async fn concurrent_claims_have_one_winner() {
        let store = Arc::new(SqliteTaskStore::open_in_memory().unwrap());
        let t = task(10, 0);
        store.insert(&t).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .update_if(t.id, TaskState::Queued, &TaskPatch::Claim { at: t0() })
                    .await
                    .unwrap()
                    .is_some()
            }));
        }

        let mut winners = 0;
        for h in handles {
            if h.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn claims_through_separate_connections_have_one_winner() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.db");
        let handles = [
            Arc::new(SqliteTaskStore::open(&path).unwrap()),
            Arc::new(SqliteTaskStore::open(&path).unwrap()),
        ];

        for round in 0..20 {
            let t = task(10, round);
            handles[0].insert(&t).await.unwrap();

            let mut claimers = Vec::new();
            for i in 0..8 {
                let store = handles[i % 2].clone();
                claimers.push(tokio::spawn(async move {
                    store
                        .update_if(t.id, TaskState::Queued, &TaskPatch::Claim { at: t0() })
                        .await
                        .unwrap()
                        .is_some()
                }));
            }

            let mut winners = 0;
            for c in claimers {
                if c.await.unwrap() {
                    winners += 1;
                }
            }
            assert_eq!(winners, 1, "round {round}");
            assert_eq!(handles[1].get(t.id).await.unwrap().state, TaskState::Running);
        }
    }

    #[tokio::test]
    async fn result_of_a_lost_claim_is_not_written() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.db");
        let worker = SqliteTaskStore::open(&path).unwrap();
        let other = SqliteTaskStore::open(&path).unwrap();

        let t = task(10, 0);
        worker.insert(&t).await.unwrap();
        let first = t0() + chrono::Duration::seconds(1);
        let claimed = worker
            .update_if(t.id, TaskState::Queued, &TaskPatch::Claim { at: first })
            .await
            .unwrap()
            .unwrap();

        // another process recovers the task and claims it again
        let second = t0() + chrono::Duration::seconds(5);
        other
            .recover_orphans(OrphanPolicy::Requeue, second)
            .await
            .unwrap();
        other
            .update_if(t.id, TaskState::Queued, &TaskPatch::Claim { at: second })
            .await
            .unwrap()
            .unwrap();

        let done = TaskPatch::Complete {
            transcript: Transcript::new("stale", 1.0),
            at: second,
        };
        let started = claimed.started_at.unwrap();
        assert!(worker.update_claimed(t.id, started, &done).await.unwrap().is_none());

        let current = other.get(t.id).await.unwrap();
        assert_eq!(current.state, TaskState::Running);
        assert!(current.result.is_none());
        assert!(other.update_claimed(t.id, second, &done).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn queued_scan_is_in_pop_order() {
        let store = SqliteTaskStore::open_in_memory().unwrap();
        let a = task(10, 1);
        let b = task(20, 2);
        let c = task(20, 3);
        for t in [&c, &a, &b] {
            store.insert(t).await.unwrap();
        }
        let ids: Vec<_> = store
            .list_by_state(TaskState::Queued)
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(ids, vec![b.id, c.id, a.id]);
    }

    #[tokio::test]
    async fn restart_recovery_leaves_no_running_task() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.db");
        let t = task(10, 0);
        {
            let store = SqliteTaskStore::open(&path).unwrap();
            store.insert(&t).await.unwrap();
            store.update(t.id, &TaskPatch::Claim { at: t0() }).await.unwrap();
        }

        let store = SqliteTaskStore::open(&path).unwrap();
        store.recover_orphans(OrphanPolicy::Fail, t0()).await.unwrap();
        assert_eq!(store.counts().await.unwrap().running, 0);
        assert_eq!(store.get(t.id).await.unwrap().state, TaskState::Failed);
    }

    #[tokio::test]
    async fn retention_queries() {
        let store = SqliteTaskStore::open_in_memory().unwrap();
        let old = task(10, 0);
        let fresh = task(10, 1);
        store.insert(&old).await.unwrap();
        store.insert(&fresh).await.unwrap();
        store.update(old.id, &TaskPatch::Cancel { at: t0() }).await.unwrap();
        store
            .update(fresh.id, &TaskPatch::Cancel { at: t0() + chrono::Duration::hours(2) })
            .await
            .unwrap();

        let cutoff = t0() + chrono::Duration::hours(1);
        let reclaimable = store.list_reclaimable(cutoff).await.unwrap();
        assert_eq!(reclaimable.len(), 1);
        assert_eq!(reclaimable[0].id, old.id);

        assert_eq!(store.list_finished_since(cutoff).await.unwrap().len(), 1);

        store
            .update(old.id, &TaskPatch::ReclaimAudio { at: cutoff })
            .await
            .unwrap();
        assert!(store.list_reclaimable(cutoff).await.unwrap().is_empty());
        assert_eq!(store.prune(cutoff).await.unwrap(), 1);
        assert_eq!(store.counts().await.unwrap().total(), 1);

        let page = store
            .list_history(&HistoryQuery::new(1, 10, HistoryFilter::Failed).unwrap())
            .await
            .unwrap();
        assert_eq!(page.total_count, 1);
        assert_eq!(page.tasks[0].id, fresh.id);
    }
}
