//! KnowledgeStore - the shared, single-writer store jobs report progress into
//!
//! The store is deliberately dumb: it exposes a transaction bracket
//! (`begin`/`commit`/`rollback`), four named mutations and a raw statement
//! escape hatch. Anything that needs a richer query surface talks to the
//! database directly.
//!
//! Callers are expected to funnel every write through a single owner (see
//! `jobdaemon::writes::WriteQueue`); nothing in here is safe to share between
//! concurrent writers.

mod error;
mod sqlite;
mod store;
mod types;

pub use error::StoreError;
pub use sqlite::{SqliteStore, Table};
pub use store::KnowledgeStore;
pub use types::{Entity, Relationship, RunRecord, Snapshot};
