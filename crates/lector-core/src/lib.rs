//! lector-core
//!
//! Core building blocks for the Lector transcription queue.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, task, state, transcript, errors, events）
//! - **ports**: 抽象化レイヤー（TaskStore, AudioStore, Transcriber, Clock, IdGenerator）
//! - **impls**: 実装（SqliteTaskStore, InMemoryTaskStore, LocalAudioStore）
//! - **queue**: PriorityIndex と QueueManager
//! - **app**: 実行時の部品（builder, hub, worker_loop, retention/reconcile/publisher ループ）
//! - **config**: QueueConfig

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod ports;
pub mod queue;

pub use app::{App, AppBuilder, BuildError, NotificationHub};
pub use config::{ConfigError, QueueConfig};
pub use domain::{ErrorKind, QueueError};
pub use queue::QueueManager;
