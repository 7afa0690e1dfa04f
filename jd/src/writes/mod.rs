//! Serialized write path to the shared knowledge store

mod operation;
mod queue;

pub use operation::{WriteCallback, WriteError, WriteOp, WriteOperation};
pub use queue::{WriteQueue, WriteQueueConfig, WriteQueueStats};
