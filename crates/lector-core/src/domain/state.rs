//! Task state machine.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::errors::QueueError;

/// Task state.
///
/// State transitions:
/// - Queued -> Running -> Done
/// - Queued -> Running -> Failed
/// - Queued -> Failed (cancelled before a worker claimed it)
///
/// Running -> Queued exists only for startup recovery and is not reachable
/// through `can_transition_to`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting in the priority index.
    Queued,

    /// Claimed by exactly one worker.
    Running,

    /// Transcript stored.
    Done,

    /// Error stored.
    Failed,
}

impl TaskState {
    pub const ALL: [TaskState; 4] = [
        TaskState::Queued,
        TaskState::Running,
        TaskState::Done,
        TaskState::Failed,
    ];

    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Done | TaskState::Failed)
    }

    /// Forward transitions allowed during normal operation.
    ///
    /// Staying in the same non-terminal state is allowed so progress updates
    /// on a Running task pass the same check.
    pub fn can_transition_to(self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Queued, Queued)
                | (Queued, Running)
                | (Queued, Failed)
                | (Running, Running)
                | (Running, Done)
                | (Running, Failed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Queued => "queued",
            TaskState::Running => "running",
            TaskState::Done => "done",
            TaskState::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(TaskState::Queued),
            "running" => Ok(TaskState::Running),
            "done" => Ok(TaskState::Done),
            "failed" => Ok(TaskState::Failed),
            other => Err(QueueError::InvalidArgument(format!(
                "unknown task state '{other}'"
            ))),
        }
    }
}

/// What happens to tasks found in Running at startup.
///
/// No worker owns them any more. There is no `Default`; the operator
/// picks one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrphanPolicy {
    /// Put the task back into the queue with its original priority and
    /// submission time.
    Requeue,

    /// Mark the task Failed with an "interrupted" error.
    Fail,
}

impl FromStr for OrphanPolicy {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "requeue" => Ok(OrphanPolicy::Requeue),
            "fail" => Ok(OrphanPolicy::Fail),
            other => Err(QueueError::InvalidArgument(format!(
                "unknown orphan policy '{other}' (expected requeue|fail)"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(TaskState::Queued, TaskState::Running, true)]
    #[case(TaskState::Queued, TaskState::Failed, true)]
    #[case(TaskState::Running, TaskState::Done, true)]
    #[case(TaskState::Running, TaskState::Failed, true)]
    #[case(TaskState::Running, TaskState::Queued, false)]
    #[case(TaskState::Queued, TaskState::Done, false)]
    #[case(TaskState::Done, TaskState::Running, false)]
    #[case(TaskState::Failed, TaskState::Queued, false)]
    #[case(TaskState::Done, TaskState::Failed, false)]
    fn transitions_are_monotonic(
        #[case] from: TaskState,
        #[case] to: TaskState,
        #[case] allowed: bool,
    ) {
        assert_eq!(from.can_transition_to(to), allowed);
    }

    #[test]
    fn terminal_states() {
        assert!(TaskState::Done.is_terminal());
        assert!(TaskState::Failed.is_terminal());
        assert!(!TaskState::Queued.is_terminal());
        assert!(!TaskState::Running.is_terminal());
    }

    #[test]
    fn string_form_roundtrips() {
        for state in TaskState::ALL {
            assert_eq!(state.as_str().parse::<TaskState>().unwrap(), state);
        }
        assert!("processing".parse::<TaskState>().is_err());
    }

    #[test]
    fn orphan_policy_parses() {
        assert_eq!("requeue".parse::<OrphanPolicy>().unwrap(), OrphanPolicy::Requeue);
        assert_eq!("fail".parse::<OrphanPolicy>().unwrap(), OrphanPolicy::Fail);
        assert!("retry".parse::<OrphanPolicy>().is_err());
    }
}
