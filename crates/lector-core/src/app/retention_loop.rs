//! RetentionLoop - 音声ファイルの回収
//!
//! # フロー
//! 1. 定期的に finished_at < now - horizon の終了済みタスクを検索
//! 2. AudioStore から blob を削除（すでに無ければそのまま）
//! 3. TaskStore の audio 参照を外し reclaimed_at を記録
//! 4. `prune_records_after` があれば古いレコード自体も削除
//!
//! 冪等: 回収済みのタスクは検索に出てこないので、何度回しても同じ結果です。

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::domain::{QueueError, TaskPatch};
use crate::ports::{AudioStore, Clock, TaskStore};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetentionReport {
    pub scanned: usize,
    pub reclaimed: usize,
    pub failed: usize,
    pub pruned: usize,
}

pub struct RetentionLoop {
    store: Arc<dyn TaskStore>,
    audio: Arc<dyn AudioStore>,
    clock: Arc<dyn Clock>,
    horizon: Duration,
    prune_after: Option<Duration>,
    interval: Duration,
}

fn to_chrono(d: Duration) -> Result<chrono::Duration, QueueError> {
    chrono::Duration::from_std(d)
        .map_err(|_| QueueError::InvalidArgument(format!("duration too large: {d:?}")))
}

impl RetentionLoop {
    pub fn new(
        store: Arc<dyn TaskStore>,
        audio: Arc<dyn AudioStore>,
        clock: Arc<dyn Clock>,
        horizon: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            audio,
            clock,
            horizon,
            prune_after: None,
            interval,
        }
    }

    pub fn with_pruning(mut self, after: Option<Duration>) -> Self {
        self.prune_after = after;
        self
    }

    /// One scan.
    pub async fn run_once(&self) -> Result<RetentionReport, QueueError> {
        let now = self.clock.now();
        let cutoff = now - to_chrono(self.horizon)?;
        let candidates = self.store.list_reclaimable(cutoff).await?;

        let mut report = RetentionReport {
            scanned: candidates.len(),
            ..RetentionReport::default()
        };

        for task in candidates {
            let Some(audio) = task.audio.as_ref() else {
                continue;
            };
            match self.audio.delete(audio).await {
                Ok(true) => {}
                Ok(false) => debug!(task_id = %task.id, audio = %audio, "audio already gone"),
                Err(e) => {
                    warn!(task_id = %task.id, audio = %audio, error = %e, "audio delete failed");
                    report.failed += 1;
                    continue;
                }
            }

            match self
                .store
                .update(task.id, &TaskPatch::ReclaimAudio { at: now })
                .await
            {
                Ok(_) => report.reclaimed += 1,
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "could not mark audio reclaimed");
                    report.failed += 1;
                }
            }
        }

        if let Some(after) = self.prune_after {
            report.pruned = self.store.prune(now - to_chrono(after)?).await?;
        }

        if report.scanned > 0 || report.pruned > 0 {
            info!(
                scanned = report.scanned,
                reclaimed = report.reclaimed,
                failed = report.failed,
                pruned = report.pruned,
                "retention pass"
            );
        }
        Ok(report)
    }

    /// Scan every `interval` until shutdown.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        warn!(error = %e, "retention pass failed");
                    }
                }
            }
        }
        debug!("retention loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AudioRef, Priority, SubmitMode, Task, TaskId, TaskState, Transcript};
    use crate::impls::{InMemoryTaskStore, LocalAudioStore};
    use crate::ports::{FixedClock, UlidGenerator};
    use chrono::{DateTime, TimeZone, Utc};
    use tempfile::TempDir;
    use ulid::Ulid;

    struct Fixture {
        store: Arc<InMemoryTaskStore>,
        audio: Arc<LocalAudioStore>,
        clock: Arc<FixedClock>,
        _dir: TempDir,
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(FixedClock::new(t0()));
        let audio = LocalAudioStore::open(dir.path(), Arc::new(UlidGenerator::new(clock.clone())))
            .await
            .unwrap();
        Fixture {
            store: Arc::new(InMemoryTaskStore::new()),
            audio: Arc::new(audio),
            clock,
            _dir: dir,
        }
    }

    impl Fixture {
        fn retention(&self) -> RetentionLoop {
            RetentionLoop::new(
                self.store.clone(),
                self.audio.clone(),
                self.clock.clone(),
                Duration::from_secs(30 * 60),
                Duration::from_secs(3600),
            )
        }

        /// A task with a real blob, moved to Done at the current clock.
        async fn done_task(&self) -> Task {
            let audio = self.audio.put(b"RIFF", "wav").await.unwrap();
            let task = Task::new(
                TaskId::from_ulid(Ulid::new()),
                audio,
                Priority::new(10).unwrap(),
                SubmitMode::Async,
                self.clock.now(),
            );
            self.store.insert(&task).await.unwrap();
            let at = self.clock.now();
            self.store.update(task.id, &TaskPatch::Claim { at }).await.unwrap();
            self.store
                .update(task.id, &TaskPatch::Complete {
                    transcript: Transcript::new("ok", 1.0),
                    at,
                })
                .await
                .unwrap()
        }
    }

    #[tokio::test]
    async fn reclaims_once_past_the_horizon() {
        let f = fixture().await;
        let task = f.done_task().await;
        let audio = task.audio.clone().unwrap();
        let retention = f.retention();

        f.clock.advance(chrono::Duration::minutes(29));
        assert_eq!(retention.run_once().await.unwrap().reclaimed, 0);

        f.clock.advance(chrono::Duration::minutes(2));
        let report = retention.run_once().await.unwrap();
        assert_eq!((report.scanned, report.reclaimed, report.failed), (1, 1, 0));

        let after = f.store.get(task.id).await.unwrap();
        assert!(after.audio.is_none());
        assert_eq!(after.reclaimed_at, Some(f.clock.now()));
        assert_eq!(after.state, TaskState::Done);
        assert!(f.audio.read(&audio).await.is_err());

        // second pass is a no-op
        f.clock.advance(chrono::Duration::hours(1));
        let again = retention.run_once().await.unwrap();
        assert_eq!(again, RetentionReport::default());
        assert_eq!(f.store.get(task.id).await.unwrap(), after);
    }

    #[tokio::test]
    async fn missing_blob_still_counts_as_reclaimed() {
        let f = fixture().await;
        let task = f.done_task().await;
        f.audio.delete(task.audio.as_ref().unwrap()).await.unwrap();

        f.clock.advance(chrono::Duration::hours(1));
        let report = f.retention().run_once().await.unwrap();
        assert_eq!(report.reclaimed, 1);
    }

    #[tokio::test]
    async fn queued_tasks_keep_their_audio() {
        let f = fixture().await;
        let task = Task::new(
            TaskId::from_ulid(Ulid::new()),
            AudioRef::new("audio-queued.wav"),
            Priority::new(10).unwrap(),
            SubmitMode::Async,
            f.clock.now(),
        );
        f.store.insert(&task).await.unwrap();

        f.clock.advance(chrono::Duration::days(1));
        let report = f.retention().run_once().await.unwrap();
        assert_eq!(report.scanned, 0);
        assert!(f.store.get(task.id).await.unwrap().audio.is_some());
    }

    #[tokio::test]
    async fn pruning_removes_reclaimed_records() {
        let f = fixture().await;
        let task = f.done_task().await;
        let retention = f.retention().with_pruning(Some(Duration::from_secs(2 * 3600)));

        f.clock.advance(chrono::Duration::hours(1));
        let first = retention.run_once().await.unwrap();
        assert_eq!((first.reclaimed, first.pruned), (1, 0));

        f.clock.advance(chrono::Duration::hours(2));
        let second = retention.run_once().await.unwrap();
        assert_eq!(second.pruned, 1);
        assert!(f.store.get(task.id).await.is_err());
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let f = fixture().await;
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(f.retention().run(rx));
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
