//! Ports - 抽象化レイヤー
//!
//! このモジュールは Hexagonal Architecture の「ポート」を定義します。
//! 各 trait は外部システム（SQLite、ファイルシステム、認識エンジンなど）への
//! インターフェースを提供し、実装の詳細を隠蔽します。
//!
//! # 設計原則
//! - TaskStore が source of truth（正本）
//! - PriorityIndex（`queue`）は id と並び順キーだけを持つ
//! - 音声 blob は AudioStore に置き、タスクはキーだけを持つ

pub mod audio_store;
pub mod clock;
pub mod id_generator;
pub mod task_store;
pub mod transcriber;

// 主要な trait を再エクスポート
pub use self::audio_store::AudioStore;
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::task_store::{HistoryFilter, HistoryPage, HistoryQuery, QueueCounts, TaskStore};
pub use self::transcriber::{ProgressReporter, TranscribeError, Transcriber};
