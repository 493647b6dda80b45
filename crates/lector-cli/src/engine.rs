//! CommandTranscriber - 外部エンジンを子プロセスとして呼ぶ Transcriber
//!
//! # プロトコル
//! - 音声バイト列を stdin に流し込む
//! - stdout に `{"text": ..., "confidence": ..., "segments": [...]}` を 1 つ書く
//! - 非ゼロ終了は ModelError、stderr の末尾をメッセージに含める

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use lector_core::domain::{Segment, Transcript};
use lector_core::ports::{TranscribeError, Transcriber};
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

const STDERR_TAIL: usize = 512;

#[derive(Debug, Deserialize)]
struct EngineOutput {
    text: String,
    #[serde(default = "full_confidence")]
    confidence: f32,
    #[serde(default)]
    segments: Vec<Segment>,
}

fn full_confidence() -> f32 {
    1.0
}

#[derive(Debug, Clone)]
pub struct CommandTranscriber {
    program: String,
    args: Vec<String>,
    timeout: Option<Duration>,
}

impl CommandTranscriber {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    async fn run(&self, audio: &[u8]) -> Result<std::process::Output, TranscribeError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TranscribeError::Model(format!("cannot start {}: {e}", self.program)))?;

        // stdin is fed concurrently so a chatty engine cannot block on a full stdout pipe
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| TranscribeError::Model("engine stdin unavailable".to_string()))?;
        let bytes = audio.to_vec();
        let feeder = tokio::spawn(async move {
            let result = stdin.write_all(&bytes).await;
            drop(stdin);
            result
        });

        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
                .await
                .map_err(|_| TranscribeError::Timeout(limit))?,
            None => child.wait_with_output().await,
        }
        .map_err(|e| TranscribeError::Model(format!("engine i/o: {e}")))?;

        if let Ok(Err(e)) = feeder.await {
            // engines may exit before reading everything
            debug!(error = %e, "engine closed stdin early");
        }
        Ok(output)
    }
}

#[async_trait]
impl Transcriber for CommandTranscriber {
    async fn transcribe(&self, audio: &[u8]) -> Result<Transcript, TranscribeError> {
        if audio.is_empty() {
            return Err(TranscribeError::BadInput("empty audio".to_string()));
        }
        let output = self.run(audio).await?;
        if !output.status.success() {
            return Err(TranscribeError::Model(format!(
                "engine exited with {}: {}",
                output.status,
                stderr_tail(&output.stderr)
            )));
        }
        parse_output(&output.stdout)
    }
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    let start = text
        .char_indices()
        .rev()
        .nth(STDERR_TAIL)
        .map(|(i, _)| i)
        .unwrap_or(0);
    text[start..].to_string()
}

fn parse_output(stdout: &[u8]) -> Result<Transcript, TranscribeError> {
    let out: EngineOutput = serde_json::from_slice(stdout)
        .map_err(|e| TranscribeError::Model(format!("unreadable engine output: {e}")))?;
    Ok(Transcript::new(out.text, out.confidence).with_segments(out.segments))
}
