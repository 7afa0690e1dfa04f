//! Write operations carried by the queue

use knowledgestore::{Entity, KnowledgeStore, Relationship, RunRecord, Snapshot, StoreError};
use serde_json::Value;
use thiserror::Error;

/// Why a write did not commit
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WriteError {
    #[error("write queue is closed")]
    QueueClosed,

    #[error("write queue is full")]
    Full,

    #[error("write batch rolled back: {0}")]
    BatchFailed(String),
}

/// One mutation against the shared store
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    AddEntity(Entity),
    AddRelationship(Relationship),
    LogRun(RunRecord),
    AddSnapshot(Snapshot),
    /// Raw statement escape hatch with positional parameters
    Raw { sql: String, params: Vec<Value> },
}

impl WriteOp {
    pub fn raw(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Self::Raw { sql: sql.into(), params }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::AddEntity(_) => "add_entity",
            Self::AddRelationship(_) => "add_relationship",
            Self::LogRun(_) => "log_run",
            Self::AddSnapshot(_) => "add_snapshot",
            Self::Raw { .. } => "raw",
        }
    }

    pub(crate) fn apply(&self, store: &mut dyn KnowledgeStore) -> Result<Value, StoreError> {
        match self {
            Self::AddEntity(entity) => store.add_entity(entity),
            Self::AddRelationship(rel) => store.add_relationship(rel),
            Self::LogRun(record) => store.log_run(record),
            Self::AddSnapshot(snapshot) => store.add_snapshot(snapshot),
            Self::Raw { sql, params } => store.execute_raw(sql, params),
        }
    }
}

/// Invoked exactly once with the op's result, after commit or on failure
pub type WriteCallback = Box<dyn FnOnce(Result<Value, WriteError>) + Send + 'static>;

/// A queued write plus its optional completion callback
pub struct WriteOperation {
    pub op: WriteOp,
    callback: Option<WriteCallback>,
}

impl WriteOperation {
    pub fn new(op: WriteOp) -> Self {
        Self { op, callback: None }
    }

    pub fn with_callback<F>(op: WriteOp, callback: F) -> Self
    where
        F: FnOnce(Result<Value, WriteError>) + Send + 'static,
    {
        Self {
            op,
            callback: Some(Box::new(callback)),
        }
    }

    /// Hand the result to the callback, if any
    ///
    /// A panicking callback is logged and swallowed so it cannot take the
    /// writer down with it.
    pub(crate) fn complete(self, result: Result<Value, WriteError>) {
        if let Some(callback) = self.callback {
            let kind = self.op.kind();
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || callback(result)));
            if outcome.is_err() {
                tracing::error!(%kind, "Write callback panicked");
            }
        }
    }
}

impl std::fmt::Debug for WriteOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteOperation")
            .field("op", &self.op)
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}

impl From<WriteOp> for WriteOperation {
    fn from(op: WriteOp) -> Self {
        Self::new(op)
    }
}
