//! AudioStore port - 音声 blob のストレージ
//!
//! タスクは `AudioRef`（キー）だけを持ち、実体はここに置きます。
//! retention ループが期限切れの blob を削除します。

use async_trait::async_trait;

use crate::domain::{AudioRef, QueueError};

/// AudioStore はアップロードされた音声を保存
///
/// # 設計原則
/// - `delete` は冪等（すでに無ければ `Ok(false)`）
/// - キーは不透明な文字列。パスとして解釈するのは実装側
#[async_trait]
pub trait AudioStore: Send + Sync {
    /// Store `bytes` and return the key. `extension` is a hint like "wav".
    async fn put(&self, bytes: &[u8], extension: &str) -> Result<AudioRef, QueueError>;

    async fn read(&self, audio: &AudioRef) -> Result<Vec<u8>, QueueError>;

    /// Remove the blob. Returns `false` if it was already gone.
    async fn delete(&self, audio: &AudioRef) -> Result<bool, QueueError>;
}
