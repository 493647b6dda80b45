//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **SqliteTaskStore**: 本番用の正本（SQLite ファイル）
//! - **InMemoryTaskStore**: テスト用の正本
//! - **LocalAudioStore**: ローカルディレクトリの音声置き場

pub mod local_audio;
pub mod memory_store;
pub mod sqlite_store;

// 主要な型を再エクスポート
pub use self::local_audio::LocalAudioStore;
pub use self::memory_store::InMemoryTaskStore;
pub use self::sqlite_store::SqliteTaskStore;
