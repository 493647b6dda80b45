//! WorkerLoop - タスク実行ループ
//!
//! # フロー
//! 1. QueueIndex::next() で task_id 取得（空なら push まで待つ）
//! 2. QueueManager::claim() で Queued → Running（負けたら捨てて次へ）
//! 3. AudioStore から音声を読み、Transcriber を別タスクで実行
//! 4. 進捗は `progress_interval` ごとに保存
//! 5. Done + result / Failed + error を保存して 1 に戻る
//!
//! 認識の失敗は自動リトライしません。再実行は呼び出し側の再投入です。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::domain::{Task, TaskId, Transcript};
use crate::ports::{ProgressReporter, Transcriber};
use crate::queue::QueueManager;

/// Worker group handle.
/// - `request_shutdown` で新しいタスクの取得を止める
/// - `shutdown(grace)` で実行中のタスクを待ち、間に合わなければ abort
pub struct WorkerGroup {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerGroup {
    /// Spawn `n` workers.
    pub fn spawn(n: usize, manager: Arc<QueueManager>, transcriber: Arc<dyn Transcriber>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut joins = Vec::with_capacity(n);
        for worker_id in 0..n {
            let manager = Arc::clone(&manager);
            let transcriber = Arc::clone(&transcriber);
            let mut rx = shutdown_rx.clone();

            let join = tokio::spawn(async move {
                worker_loop(worker_id, manager, transcriber, &mut rx).await;
            });
            joins.push(join);
        }
        info!(workers = n, "worker group started");

        Self { shutdown_tx, joins }
    }

    pub fn len(&self) -> usize {
        self.joins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.joins.is_empty()
    }

    /// Stop taking new tasks. In-flight transcriptions keep running.
    pub fn request_shutdown(&self) {
        // ignore send error: receivers may already be dropped
        let _ = self.shutdown_tx.send(true);
    }

    /// Stop, wait up to `grace` for in-flight work, then abort the rest.
    ///
    /// Returns how many workers were aborted. Aborting a worker also aborts
    /// its transcription. The task stays Running and is handled by the next
    /// startup recovery.
    pub async fn shutdown(self, grace: Duration) -> usize {
        self.request_shutdown();

        let deadline = Instant::now() + grace;
        let mut aborted = 0;
        for mut join in self.joins {
            if tokio::time::timeout_at(deadline, &mut join).await.is_err() {
                join.abort();
                aborted += 1;
            }
        }
        if aborted > 0 {
            warn!(aborted, "workers aborted after grace period");
        } else {
            info!("worker group stopped");
        }
        aborted
    }
}

async fn worker_loop(
    worker_id: usize,
    manager: Arc<QueueManager>,
    transcriber: Arc<dyn Transcriber>,
    shutdown_rx: &mut watch::Receiver<bool>,
) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        // next() は待つので shutdown と競合させる
        let entry = tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            entry = manager.index().next() => entry,
        };

        process(worker_id, &manager, &transcriber, entry.task_id).await;
    }
    debug!(worker_id, "worker stopped");
}

async fn process(
    worker_id: usize,
    manager: &QueueManager,
    transcriber: &Arc<dyn Transcriber>,
    task_id: TaskId,
) {
    let task = match manager.claim(task_id).await {
        Ok(Some(task)) => task,
        Ok(None) => {
            debug!(worker_id, task_id = %task_id, "lost claim race");
            return;
        }
        Err(e) => {
            warn!(worker_id, task_id = %task_id, error = %e, "claim failed");
            return;
        }
    };
    info!(
        worker_id,
        task_id = %task_id,
        priority = task.priority.get(),
        "task claimed"
    );

    match transcribe(manager, transcriber, &task).await {
        Ok(transcript) => match manager.complete(&task, transcript).await {
            Ok(Some(done)) => info!(
                worker_id,
                task_id = %task_id,
                elapsed_ms = done.processing_time().map(|d| d.as_millis() as u64),
                "task done"
            ),
            Ok(None) => warn!(worker_id, task_id = %task_id, "claim lost, result discarded"),
            Err(e) => error!(worker_id, task_id = %task_id, error = %e, "could not record result"),
        },
        Err(message) => {
            warn!(worker_id, task_id = %task_id, error = %message, "task failed");
            match manager.fail(&task, message).await {
                Ok(Some(_)) => {}
                Ok(None) => warn!(worker_id, task_id = %task_id, "claim lost, failure discarded"),
                Err(e) => error!(worker_id, task_id = %task_id, error = %e, "could not record failure"),
            }
        }
    }
}

/// Aborts the transcription when the worker future is dropped, e.g. by
/// `WorkerGroup::shutdown` after the grace period.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Run the transcriber on its own task so a panic cannot unwind the loop.
async fn transcribe(
    manager: &QueueManager,
    transcriber: &Arc<dyn Transcriber>,
    task: &Task,
) -> Result<Transcript, String> {
    let Some(audio) = task.audio.clone() else {
        return Err("audio file not found: already reclaimed".to_string());
    };
    let bytes = manager
        .audio()
        .read(&audio)
        .await
        .map_err(|e| format!("could not read audio {audio}: {e}"))?;

    let (reporter, mut progress_rx) = ProgressReporter::channel();
    let transcriber = Arc::clone(transcriber);
    let mut job = AbortOnDrop(tokio::spawn(async move {
        transcriber.transcribe_with_progress(&bytes, &reporter).await
    }));

    let interval = manager.config().progress_interval;
    let mut last_saved: Option<Instant> = None;
    let mut progress_open = true;
    loop {
        tokio::select! {
            joined = &mut job.0 => {
                return match joined {
                    Ok(Ok(transcript)) => Ok(transcript),
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(e) if e.is_panic() => Err("transcriber panicked".to_string()),
                    Err(e) => Err(format!("transcriber stopped: {e}")),
                };
            }
            changed = progress_rx.changed(), if progress_open => {
                if changed.is_err() {
                    progress_open = false;
                    continue;
                }
                let percent = *progress_rx.borrow_and_update();
                if last_saved.is_some_and(|at| at.elapsed() < interval) {
                    continue;
                }
                last_saved = Some(Instant::now());
                match manager.record_progress(task, percent).await {
                    Ok(Some(_)) => {}
                    Ok(None) => debug!(task_id = %task.id, "progress after lost claim"),
                    Err(e) => debug!(task_id = %task.id, error = %e, "progress not saved"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::hub::NotificationHub;
    use crate::config::QueueConfig;
    use crate::domain::{
        AudioRef, ErrorKind, OrphanPolicy, QueueEvent, SubmitMode, TaskState,
    };
    use crate::impls::{InMemoryTaskStore, LocalAudioStore};
    use crate::ports::{Clock, IdGenerator, SystemClock, TranscribeError, UlidGenerator};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
    use tempfile::TempDir;

    /// Returns the audio bytes as text.
    struct Echo;

    #[async_trait]
    impl Transcriber for Echo {
        async fn transcribe(&self, audio: &[u8]) -> Result<Transcript, TranscribeError> {
            Ok(Transcript::new(String::from_utf8_lossy(audio), 0.9))
        }
    }

    /// Records the order in which audio arrives.
    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Transcriber for Recorder {
        async fn transcribe(&self, audio: &[u8]) -> Result<Transcript, TranscribeError> {
            let text = String::from_utf8_lossy(audio).to_string();
            self.seen.lock().unwrap().push(text.clone());
            Ok(Transcript::new(text, 1.0))
        }
    }

    /// Fails on "bad", panics on "boom", echoes anything else.
    struct Picky;

    #[async_trait]
    impl Transcriber for Picky {
        async fn transcribe(&self, audio: &[u8]) -> Result<Transcript, TranscribeError> {
            match audio {
                b"bad" => Err(TranscribeError::Model("cannot decode".into())),
                b"boom" => panic!("engine crashed"),
                other => Ok(Transcript::new(String::from_utf8_lossy(other), 0.5)),
            }
        }
    }

    struct Hang;

    #[async_trait]
    impl Transcriber for Hang {
        async fn transcribe(&self, _audio: &[u8]) -> Result<Transcript, TranscribeError> {
            std::future::pending().await
        }
    }

    /// Sleeps, then marks that it ran to the end.
    #[derive(Default)]
    struct Slow {
        finished: AtomicBool,
    }

    #[async_trait]
    impl Transcriber for Slow {
        async fn transcribe(&self, _audio: &[u8]) -> Result<Transcript, TranscribeError> {
            tokio::time::sleep(Duration::from_millis(300)).await;
            self.finished.store(true, AtomicOrdering::SeqCst);
            Ok(Transcript::new("slow", 1.0))
        }
    }

    struct Halfway;

    #[async_trait]
    impl Transcriber for Halfway {
        async fn transcribe(&self, _audio: &[u8]) -> Result<Transcript, TranscribeError> {
            Ok(Transcript::new("", 1.0))
        }

        async fn transcribe_with_progress(
            &self,
            _audio: &[u8],
            progress: &ProgressReporter,
        ) -> Result<Transcript, TranscribeError> {
            progress.report(50);
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(Transcript::new("halfway", 1.0))
        }
    }

    async fn manager(config: QueueConfig) -> (Arc<QueueManager>, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let ids: Arc<dyn IdGenerator> = Arc::new(UlidGenerator::new(clock.clone()));
        let audio = LocalAudioStore::open(dir.path(), ids.clone()).await.unwrap();
        let manager = QueueManager::new(
            Arc::new(InMemoryTaskStore::new()),
            Arc::new(audio),
            Arc::new(NotificationHub::new()),
            clock,
            ids,
            config,
        );
        (Arc::new(manager), dir)
    }

    fn config() -> QueueConfig {
        let mut config = QueueConfig::new(OrphanPolicy::Fail);
        config.sync_timeout = Duration::from_secs(5);
        config.progress_interval = Duration::ZERO;
        config
    }

    #[tokio::test]
    async fn sync_submit_returns_done() {
        let (manager, _dir) = manager(config()).await;
        let workers = WorkerGroup::spawn(1, manager.clone(), Arc::new(Echo));

        let task = manager
            .submit_audio(b"hello world", "wav", 100, SubmitMode::Sync)
            .await
            .unwrap();
        assert_eq!(task.state, TaskState::Done);
        assert_eq!(task.progress, 100);
        assert_eq!(task.result.unwrap().text, "hello world");

        assert_eq!(workers.shutdown(Duration::from_secs(1)).await, 0);
    }

    #[tokio::test]
    async fn hanging_transcriber_hits_sync_deadline() {
        let mut cfg = config();
        cfg.sync_timeout = Duration::from_millis(100);
        let (manager, _dir) = manager(cfg).await;
        let workers = WorkerGroup::spawn(1, manager.clone(), Arc::new(Hang));

        let err = manager
            .submit_audio(b"x", "wav", 100, SubmitMode::Sync)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeadlineExceeded);

        assert_eq!(workers.shutdown(Duration::from_millis(50)).await, 1);
        assert_eq!(manager.counts().await.unwrap().running, 1);
    }

    #[tokio::test]
    async fn aborted_worker_stops_its_transcription() {
        let (manager, _dir) = manager(config()).await;
        let slow = Arc::new(Slow::default());
        let workers = WorkerGroup::spawn(1, manager.clone(), slow.clone());

        let task = manager
            .submit_audio(b"x", "wav", 10, SubmitMode::Async)
            .await
            .unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while manager.status(task.id).await.unwrap().state != TaskState::Running
            && Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(workers.shutdown(Duration::from_millis(10)).await, 1);
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert!(!slow.finished.load(AtomicOrdering::SeqCst));
        // left for startup recovery
        assert_eq!(manager.status(task.id).await.unwrap().state, TaskState::Running);
    }

    #[tokio::test]
    async fn failures_and_panics_do_not_stop_the_loop() {
        let (manager, _dir) = manager(config()).await;
        let workers = WorkerGroup::spawn(1, manager.clone(), Arc::new(Picky));

        let bad = manager
            .submit_audio(b"bad", "wav", 50, SubmitMode::Sync)
            .await
            .unwrap_err();
        assert_eq!(bad.kind(), ErrorKind::ModelError);
        assert!(bad.to_string().contains("cannot decode"));

        let boom = manager
            .submit_audio(b"boom", "wav", 50, SubmitMode::Sync)
            .await
            .unwrap_err();
        assert!(boom.to_string().contains("panicked"));

        let ok = manager
            .submit_audio(b"fine", "wav", 50, SubmitMode::Sync)
            .await
            .unwrap();
        assert_eq!(ok.state, TaskState::Done);

        let counts = manager.counts().await.unwrap();
        assert_eq!((counts.done, counts.failed), (1, 2));
        workers.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn missing_audio_fails_the_task() {
        let (manager, _dir) = manager(config()).await;
        let workers = WorkerGroup::spawn(1, manager.clone(), Arc::new(Echo));

        let err = manager
            .submit(AudioRef::new("audio-gone.wav"), 10, SubmitMode::Sync)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ModelError);
        assert!(err.to_string().contains("audio-gone.wav"));
        workers.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn tasks_run_in_priority_order() {
        let (manager, _dir) = manager(config()).await;
        for (bytes, priority) in [(&b"a"[..], 10), (&b"b"[..], 20), (&b"c"[..], 20)] {
            manager
                .submit_audio(bytes, "wav", priority, SubmitMode::Async)
                .await
                .unwrap();
        }

        let recorder = Arc::new(Recorder::default());
        let workers = WorkerGroup::spawn(1, manager.clone(), recorder.clone());

        let deadline = Instant::now() + Duration::from_secs(5);
        while manager.counts().await.unwrap().done < 3 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(*recorder.seen.lock().unwrap(), vec!["b", "c", "a"]);
        workers.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn progress_is_broadcast() {
        let (manager, _dir) = manager(config()).await;
        let mut events = manager.hub().subscribe();
        let workers = WorkerGroup::spawn(1, manager.clone(), Arc::new(Halfway));

        let task = manager
            .submit_audio(b"x", "wav", 10, SubmitMode::Sync)
            .await
            .unwrap();
        assert_eq!(task.state, TaskState::Done);

        let mut progress = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let QueueEvent::TaskChanged(change) = event {
                progress.push((change.state, change.progress));
            }
        }
        assert!(progress.contains(&(TaskState::Running, 50)));
        assert_eq!(progress.last(), Some(&(TaskState::Done, 100)));
        workers.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn many_workers_share_the_queue() {
        let mut cfg = config();
        cfg.max_queue_size = 100;
        let (manager, _dir) = manager(cfg).await;
        let workers = WorkerGroup::spawn(4, manager.clone(), Arc::new(Echo));
        assert_eq!(workers.len(), 4);

        let mut handles = Vec::new();
        for i in 0..20 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move {
                manager
                    .submit_audio(format!("n{i}").as_bytes(), "wav", 50, SubmitMode::Sync)
                    .await
            }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap().unwrap().state, TaskState::Done);
        }
        let counts = manager.counts().await.unwrap();
        assert_eq!(counts.done, 20);
        assert_eq!(counts.running, 0);
        workers.shutdown(Duration::from_secs(1)).await;
    }
}
