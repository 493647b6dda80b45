//! Transcript model: what a transcriber returns and what a Done task keeps.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// One timed piece of a transcript, optionally attributed to a speaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speaker: Option<String>,
    pub start_ms: u64,
    pub end_ms: u64,
    pub text: String,
}

/// Result of a successful transcription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    pub text: String,

    /// Engine confidence in `0.0..=1.0`.
    pub confidence: f32,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub segments: Vec<Segment>,
}

impl Transcript {
    pub fn new(text: impl Into<String>, confidence: f32) -> Self {
        Self {
            text: text.into(),
            confidence: confidence.clamp(0.0, 1.0),
            segments: Vec::new(),
        }
    }

    pub fn with_segments(mut self, segments: Vec<Segment>) -> Self {
        self.segments = segments;
        self
    }

    /// Default gap under which two segments of one speaker are merged.
    pub const DEFAULT_MERGE_GAP: Duration = Duration::from_secs(2);

    /// Merge consecutive segments of the same speaker into display lines.
    ///
    /// Segments are merged while the speaker stays the same and the silence
    /// between them is at most `max_gap`. Each line looks like
    /// `[1.00s - 4.50s] Speaker 0: text`.
    pub fn speaker_lines(&self, max_gap: Duration) -> Vec<String> {
        let Some((first, rest)) = self.segments.split_first() else {
            return Vec::new();
        };

        let max_gap_ms = max_gap.as_millis();
        let mut lines = Vec::new();
        let mut speaker = first.speaker.as_deref();
        let mut text = first.text.trim().to_string();
        let mut start_ms = first.start_ms;
        let mut end_ms = first.end_ms;

        for seg in rest {
            // a segment that starts before the previous one ended has no gap
            let gap_ms = u128::from(seg.start_ms.saturating_sub(end_ms));
            if seg.speaker.as_deref() == speaker && gap_ms <= max_gap_ms {
                text.push_str(seg.text.trim());
                end_ms = seg.end_ms;
                continue;
            }
            lines.push(format_line(speaker, start_ms, end_ms, &text));
            speaker = seg.speaker.as_deref();
            text = seg.text.trim().to_string();
            start_ms = seg.start_ms;
            end_ms = seg.end_ms;
        }
        lines.push(format_line(speaker, start_ms, end_ms, &text));
        lines
    }
}

fn format_line(speaker: Option<&str>, start_ms: u64, end_ms: u64, text: &str) -> String {
    format!(
        "[{:.2}s - {:.2}s] Speaker {}: {}",
        start_ms as f64 / 1000.0,
        end_ms as f64 / 1000.0,
        speaker.unwrap_or("?"),
        text
    )
}
