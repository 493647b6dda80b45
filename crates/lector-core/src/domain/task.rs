//! Task record and the patches that move it through its lifecycle.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::QueueError;
use super::ids::TaskId;
use super::state::TaskState;
use super::transcript::Transcript;

/// Error stored on a task cancelled while still Queued.
pub const CANCELLED_ERROR: &str = "cancelled";

/// Error stored on a Running task failed by startup recovery.
pub const INTERRUPTED_ERROR: &str = "interrupted: worker stopped before the task finished";

/// Task priority in `1..=100`. Higher is served first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct Priority(u8);

impl Priority {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 100;

    pub fn new(value: i64) -> Result<Self, QueueError> {
        if value < i64::from(Self::MIN) || value > i64::from(Self::MAX) {
            return Err(QueueError::InvalidArgument(format!(
                "priority {value} outside {}..={}",
                Self::MIN,
                Self::MAX
            )));
        }
        // range checked above
        Ok(Self(value as u8))
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

impl TryFrom<i64> for Priority {
    type Error = QueueError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Priority> for i64 {
    fn from(p: Priority) -> Self {
        i64::from(p.0)
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// How the submitter waits for the result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitMode {
    /// `submit` blocks until the task is terminal or the sync timeout fires.
    Sync,
    /// `submit` returns as soon as the task is persisted.
    Async,
}

impl SubmitMode {
    pub fn as_str(self) -> &'static str {
        match self {
            SubmitMode::Sync => "sync",
            SubmitMode::Async => "async",
        }
    }
}

impl FromStr for SubmitMode {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sync" => Ok(SubmitMode::Sync),
            "async" => Ok(SubmitMode::Async),
            other => Err(QueueError::InvalidArgument(format!(
                "unknown mode '{other}' (expected sync|async)"
            ))),
        }
    }
}

/// Opaque key of an audio blob in an `AudioStore`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AudioRef(String);

impl AudioRef {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AudioRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One transcription job.
///
/// Design:
/// - The task store owns these records; everything else holds snapshots.
/// - All mutation goes through `apply`, which enforces the state machine
///   and the `result iff Done` / `error iff Failed` invariants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub priority: Priority,
    pub mode: SubmitMode,
    pub state: TaskState,

    /// `None` once retention reclaimed the blob.
    pub audio: Option<AudioRef>,

    /// 0..=100
    pub progress: u8,
    pub result: Option<Transcript>,
    pub error: Option<String>,

    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub reclaimed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(
        id: TaskId,
        audio: AudioRef,
        priority: Priority,
        mode: SubmitMode,
        submitted_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            priority,
            mode,
            state: TaskState::Queued,
            audio: Some(audio),
            progress: 0,
            result: None,
            error: None,
            submitted_at,
            updated_at: submitted_at,
            started_at: None,
            finished_at: None,
            reclaimed_at: None,
        }
    }

    /// Time spent in the queue before a worker claimed the task.
    pub fn waiting_time(&self) -> Option<Duration> {
        let started = self.started_at?;
        (started - self.submitted_at).to_std().ok()
    }

    /// Time between claim and terminal write.
    pub fn processing_time(&self) -> Option<Duration> {
        let (started, finished) = (self.started_at?, self.finished_at?);
        (finished - started).to_std().ok()
    }

    /// Still Running under the claim made at `started_at`.
    ///
    /// Compared at microsecond precision, which is what the store keeps.
    pub fn holds_claim(&self, started_at: DateTime<Utc>) -> bool {
        self.state == TaskState::Running
            && self.started_at.map(|at| at.timestamp_micros()) == Some(started_at.timestamp_micros())
    }

    /// Apply a patch, enforcing the lifecycle rules.
    ///
    /// Returns `Ok(false)` when the patch is a no-op (reclaiming audio that
    /// is already gone, or a progress value that is not higher).
    pub fn apply(&mut self, patch: &TaskPatch) -> Result<bool, QueueError> {
        let reject = |task: &Task| QueueError::InvalidState {
            task_id: task.id,
            state: task.state,
            action: patch.action(),
        };

        match patch {
            TaskPatch::Claim { at } => {
                if self.state != TaskState::Queued {
                    return Err(reject(self));
                }
                self.state = TaskState::Running;
                self.progress = 0;
                self.started_at = Some(*at);
            }
            TaskPatch::Progress { percent, .. } => {
                if self.state != TaskState::Running {
                    return Err(reject(self));
                }
                let percent = (*percent).min(100);
                if percent <= self.progress {
                    return Ok(false);
                }
                self.progress = percent;
            }
            TaskPatch::Complete { transcript, at } => {
                if !self.state.can_transition_to(TaskState::Done) {
                    return Err(reject(self));
                }
                self.state = TaskState::Done;
                self.progress = 100;
                self.result = Some(transcript.clone());
                self.error = None;
                self.finished_at = Some(*at);
            }
            TaskPatch::Fail { error, at } => {
                if self.state != TaskState::Running {
                    return Err(reject(self));
                }
                self.state = TaskState::Failed;
                self.result = None;
                self.error = Some(error.clone());
                self.finished_at = Some(*at);
            }
            TaskPatch::Cancel { at } => {
                if self.state != TaskState::Queued {
                    return Err(reject(self));
                }
                self.state = TaskState::Failed;
                self.error = Some(CANCELLED_ERROR.to_string());
                self.finished_at = Some(*at);
            }
            TaskPatch::Requeue { .. } => {
                if self.state != TaskState::Running {
                    return Err(reject(self));
                }
                self.state = TaskState::Queued;
                self.progress = 0;
                self.started_at = None;
            }
            TaskPatch::ReclaimAudio { at } => {
                if !self.state.is_terminal() {
                    return Err(reject(self));
                }
                if self.audio.is_none() {
                    return Ok(false);
                }
                self.audio = None;
                self.reclaimed_at = Some(*at);
            }
        }

        self.updated_at = patch.at();
        Ok(true)
    }
}

/// A single lifecycle step for a task.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskPatch {
    /// Queued -> Running.
    Claim { at: DateTime<Utc> },
    /// Running, progress raised.
    Progress { percent: u8, at: DateTime<Utc> },
    /// Running -> Done.
    Complete {
        transcript: Transcript,
        at: DateTime<Utc>,
    },
    /// Running -> Failed.
    Fail { error: String, at: DateTime<Utc> },
    /// Queued -> Failed("cancelled").
    Cancel { at: DateTime<Utc> },
    /// Running -> Queued. Startup recovery only.
    Requeue { at: DateTime<Utc> },
    /// Terminal, audio reference cleared.
    ReclaimAudio { at: DateTime<Utc> },
}

impl TaskPatch {
    pub fn at(&self) -> DateTime<Utc> {
        match self {
            TaskPatch::Claim { at }
            | TaskPatch::Progress { at, .. }
            | TaskPatch::Complete { at, .. }
            | TaskPatch::Fail { at, .. }
            | TaskPatch::Cancel { at }
            | TaskPatch::Requeue { at }
            | TaskPatch::ReclaimAudio { at } => *at,
        }
    }

    /// Verb used in `InvalidState` messages.
    pub fn action(&self) -> &'static str {
        match self {
            TaskPatch::Claim { .. } => "claim",
            TaskPatch::Progress { .. } => "report progress for",
            TaskPatch::Complete { .. } => "complete",
            TaskPatch::Fail { .. } => "fail",
            TaskPatch::Cancel { .. } => "cancel",
            TaskPatch::Requeue { .. } => "requeue",
            TaskPatch::ReclaimAudio { .. } => "reclaim audio of",
        }
    }
}
