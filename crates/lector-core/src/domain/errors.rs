//! Errors - エラー型と分類
//!
//! すべての操作は `QueueError` を返し、`kind()` で運用上の分類
//! （`ErrorKind`）に写像されます。分類ごとに別々のステータスを報告します。

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use super::ids::TaskId;
use super::state::TaskState;

/// ErrorKind は実行エラーの分類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad priority, mode or other caller input. Fails before persistence.
    InvalidArgument,
    /// Unknown task id.
    NotFound,
    /// Illegal transition, e.g. cancel of a Running task.
    InvalidState,
    /// The transcriber failed for this task.
    ModelError,
    /// A Sync submission did not reach a terminal state in time.
    DeadlineExceeded,
    /// Persistence I/O failure.
    StorageError,
    /// Backpressure: the queue already holds `max_queue_size` tasks.
    QueueFull,
}

impl ErrorKind {
    /// HTTP-style status reported for this kind.
    pub fn status_code(self) -> u16 {
        match self {
            ErrorKind::InvalidArgument => 400,
            ErrorKind::NotFound => 404,
            ErrorKind::InvalidState => 409,
            ErrorKind::QueueFull => 429,
            ErrorKind::StorageError => 500,
            ErrorKind::ModelError => 502,
            ErrorKind::DeadlineExceeded => 504,
        }
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("task not found: {0}")]
    NotFound(TaskId),

    #[error("cannot {action} task {task_id} in state {state}")]
    InvalidState {
        task_id: TaskId,
        state: TaskState,
        action: &'static str,
    },

    #[error("transcription failed for {task_id}: {message}")]
    Model { task_id: TaskId, message: String },

    #[error("task {task_id} not finished after {waited:?}")]
    DeadlineExceeded { task_id: TaskId, waited: Duration },

    #[error("queue is full ({depth}/{capacity})")]
    QueueFull { depth: usize, capacity: usize },

    #[error("storage error: {0}")]
    Storage(String),
}

impl QueueError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            QueueError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            QueueError::NotFound(_) => ErrorKind::NotFound,
            QueueError::InvalidState { .. } => ErrorKind::InvalidState,
            QueueError::Model { .. } => ErrorKind::ModelError,
            QueueError::DeadlineExceeded { .. } => ErrorKind::DeadlineExceeded,
            QueueError::QueueFull { .. } => ErrorKind::QueueFull,
            QueueError::Storage(_) => ErrorKind::StorageError,
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        QueueError::Storage(message.into())
    }
}

impl From<rusqlite::Error> for QueueError {
    fn from(err: rusqlite::Error) -> Self {
        QueueError::Storage(err.to_string())
    }
}

impl From<std::io::Error> for QueueError {
    fn from(err: std::io::Error) -> Self {
        QueueError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::Storage(format!("json: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use ulid::Ulid;

    #[test]
    fn every_kind_reports_a_distinct_status() {
        let kinds = [
            ErrorKind::InvalidArgument,
            ErrorKind::NotFound,
            ErrorKind::InvalidState,
            ErrorKind::ModelError,
            ErrorKind::DeadlineExceeded,
            ErrorKind::StorageError,
            ErrorKind::QueueFull,
        ];
        let codes: HashSet<u16> = kinds.iter().map(|k| k.status_code()).collect();
        assert_eq!(codes.len(), kinds.len());
    }

    #[test]
    fn errors_map_to_kinds() {
        let id = TaskId::from_ulid(Ulid::new());
        assert_eq!(QueueError::NotFound(id).kind(), ErrorKind::NotFound);
        assert_eq!(
            QueueError::InvalidState {
                task_id: id,
                state: TaskState::Running,
                action: "cancel",
            }
            .kind(),
            ErrorKind::InvalidState
        );
        let io = std::io::Error::other("disk gone");
        assert_eq!(QueueError::from(io).kind(), ErrorKind::StorageError);
    }

    #[test]
    fn invalid_state_message_names_action_and_state() {
        let id = TaskId::from_ulid(Ulid::new());
        let err = QueueError::InvalidState {
            task_id: id,
            state: TaskState::Running,
            action: "cancel",
        };
        let msg = err.to_string();
        assert!(msg.contains("cancel"));
        assert!(msg.contains("running"));
    }
}
