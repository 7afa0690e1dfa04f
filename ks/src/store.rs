//! KnowledgeStore trait

use serde_json::Value;

use crate::{Entity, Relationship, RunRecord, Snapshot, StoreError};

/// Single-writer store interface
///
/// Every mutation returns an opaque JSON result which the write path hands
/// back to whoever asked for the write. Implementations are `Send` so the
/// owning writer task can live on any runtime thread, but they are never
/// shared: exactly one owner issues calls, in order.
pub trait KnowledgeStore: Send {
    /// Open a write transaction
    fn begin(&mut self) -> Result<(), StoreError>;

    /// Commit the open transaction
    fn commit(&mut self) -> Result<(), StoreError>;

    /// Roll back the open transaction
    fn rollback(&mut self) -> Result<(), StoreError>;

    fn add_entity(&mut self, entity: &Entity) -> Result<Value, StoreError>;

    fn add_relationship(&mut self, relationship: &Relationship) -> Result<Value, StoreError>;

    fn log_run(&mut self, record: &RunRecord) -> Result<Value, StoreError>;

    fn add_snapshot(&mut self, snapshot: &Snapshot) -> Result<Value, StoreError>;

    /// Execute a raw write statement with positional parameters
    fn execute_raw(&mut self, sql: &str, params: &[Value]) -> Result<Value, StoreError>;
}
