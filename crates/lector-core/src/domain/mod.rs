//! Domain model (ids, task record, state machine, transcript, errors, events).
//!
//! ここは永続化やランタイムを前提にしない層です。
//! 状態遷移のルールは `Task::apply` に集約しています。

pub mod errors;
pub mod events;
pub mod ids;
pub mod state;
pub mod task;
pub mod transcript;

pub use self::errors::{ErrorKind, QueueError};
pub use self::events::{QueueEvent, TaskChanged};
pub use self::ids::{AudioId, TaskId};
pub use self::state::{OrphanPolicy, TaskState};
pub use self::task::{AudioRef, Priority, SubmitMode, Task, TaskPatch};
pub use self::transcript::{Segment, Transcript};
