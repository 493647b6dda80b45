//! Queue module: the priority index and the manager that fronts it.

pub mod index;
pub mod manager;

pub use index::{IndexEntry, PriorityIndex, QueueIndex};
pub use manager::QueueManager;
