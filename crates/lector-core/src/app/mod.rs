//! App - アプリケーション層
//!
//! このモジュールは、ports と queue を組み合わせて実行時の部品を提供します。
//!
//! # 主要コンポーネント
//! - **AppBuilder / App**: 起動時の復旧・index 再構築とワイヤリング
//! - **NotificationHub**: タスク変更の fan-out
//! - **WorkerGroup**: タスク実行ループ（pop→claim→transcribe→complete）
//! - **RetentionLoop**: 古い音声ファイルの回収
//! - **ReconcileLoop**: index と store の突き合わせ
//! - **PublisherLoop**: QueueSnapshot の定期配信

pub mod builder;
pub mod hub;
pub mod publisher_loop;
pub mod reconcile_loop;
pub mod retention_loop;
pub mod status;
pub mod worker_loop;

// 主要な型を再エクスポート
pub use self::builder::{App, AppBuilder, BuildError};
pub use self::hub::NotificationHub;
pub use self::publisher_loop::PublisherLoop;
pub use self::reconcile_loop::ReconcileLoop;
pub use self::retention_loop::{RetentionLoop, RetentionReport};
pub use self::status::{PendingEntry, QueueSnapshot, RunningEntry, Statistics};
pub use self::worker_loop::WorkerGroup;
