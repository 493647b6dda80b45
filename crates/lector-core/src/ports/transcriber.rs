//! Transcriber port - 音声認識エンジンの抽象化
//!
//! エンジンは不透明で遅い前提です。Worker Loop だけが呼び出し、
//! リクエスト処理の経路には乗せません。

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;

use crate::domain::Transcript;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TranscribeError {
    /// The audio could not be decoded or is empty.
    #[error("bad audio input: {0}")]
    BadInput(String),

    #[error("model error: {0}")]
    Model(String),

    #[error("transcription timed out after {0:?}")]
    Timeout(Duration),
}

/// Transcriber は音声バイト列をテキストに変換
///
/// 失敗はタスク単位で Failed として記録され、自動リトライはしません。
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, audio: &[u8]) -> Result<Transcript, TranscribeError>;

    /// Engines that can report progress override this.
    async fn transcribe_with_progress(
        &self,
        audio: &[u8],
        progress: &ProgressReporter,
    ) -> Result<Transcript, TranscribeError> {
        let _ = progress;
        self.transcribe(audio).await
    }
}

/// Progress sink handed to a transcriber.
///
/// Values are clamped to 0..=99 and only ever increase; 100 is written by
/// the worker together with the result.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    tx: watch::Sender<u8>,
}

impl ProgressReporter {
    pub fn channel() -> (Self, watch::Receiver<u8>) {
        let (tx, rx) = watch::channel(0);
        (Self { tx }, rx)
    }

    pub fn report(&self, percent: u8) {
        let percent = percent.min(99);
        self.tx.send_if_modified(|current| {
            if percent > *current {
                *current = percent;
                true
            } else {
                false
            }
        });
    }

    pub fn current(&self) -> u8 {
        *self.tx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl Transcriber for Echo {
        async fn transcribe(&self, audio: &[u8]) -> Result<Transcript, TranscribeError> {
            if audio.is_empty() {
                return Err(TranscribeError::BadInput("empty".into()));
            }
            Ok(Transcript::new(String::from_utf8_lossy(audio), 1.0))
        }
    }

    #[test]
    fn progress_is_monotonic_and_capped() {
        let (reporter, rx) = ProgressReporter::channel();
        reporter.report(30);
        reporter.report(10);
        assert_eq!(*rx.borrow(), 30);
        reporter.report(250);
        assert_eq!(reporter.current(), 99);
    }

    #[tokio::test]
    async fn default_progress_variant_delegates() {
        let (reporter, _rx) = ProgressReporter::channel();
        let t = Echo.transcribe_with_progress(b"hello", &reporter).await.unwrap();
        assert_eq!(t.text, "hello");
        assert_eq!(
            Echo.transcribe(b"").await.unwrap_err(),
            TranscribeError::BadInput("empty".into())
        );
    }
}
