//! AppBuilder - アプリケーションの構築とワイヤリング
//!
//! # 起動順序
//! 1. 設定の検証（Fail-fast）
//! 2. 取り残された Running を orphan_policy に従って処理
//! 3. TaskStore の Queued から PriorityIndex を再構築
//! 4. ワーカーと周期ループを起動
//!
//! 2 と 3 が終わるまでワーカーは起動しません。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::app::hub::NotificationHub;
use crate::app::publisher_loop::PublisherLoop;
use crate::app::reconcile_loop::ReconcileLoop;
use crate::app::retention_loop::RetentionLoop;
use crate::app::worker_loop::WorkerGroup;
use crate::config::{ConfigError, QueueConfig};
use crate::domain::{QueueError, TaskId};
use crate::ports::{AudioStore, Clock, IdGenerator, SystemClock, TaskStore, Transcriber, UlidGenerator};
use crate::queue::QueueManager;

/// BuildError はアプリケーション構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("{0} was not provided to the builder")]
    Missing(&'static str),

    #[error("startup failed: {0}")]
    Startup(#[from] QueueError),
}

/// AppBuilder はアプリケーションを構築
///
/// # 使用例
/// ```ignore
/// let app = AppBuilder::new(QueueConfig::new(OrphanPolicy::Requeue))
///     .task_store(Arc::new(SqliteTaskStore::open("lector.db")?))
///     .audio_store(Arc::new(audio))
///     .transcriber(Arc::new(engine))
///     .start()
///     .await?;
/// ```
pub struct AppBuilder {
    config: QueueConfig,
    store: Option<Arc<dyn TaskStore>>,
    audio: Option<Arc<dyn AudioStore>>,
    transcriber: Option<Arc<dyn Transcriber>>,
    clock: Arc<dyn Clock>,
    ids: Option<Arc<dyn IdGenerator>>,
    hub: Option<Arc<NotificationHub>>,
}

impl AppBuilder {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            store: None,
            audio: None,
            transcriber: None,
            clock: Arc::new(SystemClock),
            ids: None,
            hub: None,
        }
    }

    pub fn task_store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn audio_store(mut self, audio: Arc<dyn AudioStore>) -> Self {
        self.audio = Some(audio);
        self
    }

    pub fn transcriber(mut self, transcriber: Arc<dyn Transcriber>) -> Self {
        self.transcriber = Some(transcriber);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn hub(mut self, hub: Arc<NotificationHub>) -> Self {
        self.hub = Some(hub);
        self
    }

    fn manager(&mut self) -> Result<Arc<QueueManager>, BuildError> {
        self.config.validate()?;
        let store = self.store.clone().ok_or(BuildError::Missing("task store"))?;
        let audio = self.audio.clone().ok_or(BuildError::Missing("audio store"))?;
        let ids: Arc<dyn IdGenerator> = match self.ids.clone() {
            Some(ids) => ids,
            None => Arc::new(UlidGenerator::new(self.clock.clone())),
        };
        let hub = self.hub.clone().unwrap_or_default();

        Ok(Arc::new(QueueManager::new(
            store,
            audio,
            hub,
            self.clock.clone(),
            ids,
            self.config.clone(),
        )))
    }

    /// Manager for a process that only submits and inspects.
    ///
    /// No orphan recovery and no workers: another process may own the
    /// Running tasks. The index is loaded so depth and QueueFull are right.
    pub async fn connect(mut self) -> Result<Arc<QueueManager>, BuildError> {
        let manager = self.manager()?;
        manager.rebuild_index().await?;
        Ok(manager)
    }

    /// Recover, rebuild the index, then start workers and periodic loops.
    pub async fn start(mut self) -> Result<App, BuildError> {
        let manager = self.manager()?;
        let transcriber = self
            .transcriber
            .clone()
            .ok_or(BuildError::Missing("transcriber"))?;
        let config = self.config.clone();

        let recovered = manager
            .store()
            .recover_orphans(config.orphan_policy, manager.clock().now())
            .await?;
        if !recovered.is_empty() {
            warn!(
                count = recovered.len(),
                policy = ?config.orphan_policy,
                "recovered orphaned tasks"
            );
        }
        manager.rebuild_index().await?;

        let workers = WorkerGroup::spawn(config.worker_count, manager.clone(), transcriber);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let retention = RetentionLoop::new(
            manager.store().clone(),
            manager.audio().clone(),
            manager.clock().clone(),
            config.retention_horizon,
            config.retention_interval,
        )
        .with_pruning(config.prune_records_after);
        let reconcile = ReconcileLoop::new(manager.clone(), config.reconcile_interval);
        let publisher = PublisherLoop::new(manager.clone(), config.snapshot_interval);

        let loops = vec![
            tokio::spawn(retention.run(shutdown_rx.clone())),
            tokio::spawn(reconcile.run(shutdown_rx.clone())),
            tokio::spawn(publisher.run(shutdown_rx)),
        ];

        info!(
            workers = config.worker_count,
            queue_depth = manager.queue_depth(),
            "lector started"
        );
        Ok(App {
            manager,
            workers,
            shutdown_tx,
            loops,
            recovered,
        })
    }
}

/// App はアプリケーションのランタイム
///
/// `shutdown` を呼ぶまでワーカーと周期ループが動き続けます。
pub struct App {
    manager: Arc<QueueManager>,
    workers: WorkerGroup,
    shutdown_tx: watch::Sender<bool>,
    loops: Vec<JoinHandle<()>>,
    recovered: Vec<TaskId>,
}

impl App {
    pub fn manager(&self) -> &Arc<QueueManager> {
        &self.manager
    }

    /// Tasks reclassified by startup recovery.
    pub fn recovered(&self) -> &[TaskId] {
        &self.recovered
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Stop loops, drain workers for up to `grace`. Returns aborted workers.
    pub async fn shutdown(self, grace: Duration) -> usize {
        let _ = self.shutdown_tx.send(true);
        let aborted = self.workers.shutdown(grace).await;
        for handle in self.loops {
            let _ = handle.await;
        }
        info!(aborted, "lector stopped");
        aborted
    }
}
