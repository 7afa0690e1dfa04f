//! SQLite-backed KnowledgeStore
//!
//! SQLite allows a single writer at a time; a second connection that tries to
//! write while a transaction is open gets `SQLITE_BUSY` once the busy timeout
//! runs out. The tables below are the minimum needed to persist the named
//! mutations.

use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use rusqlite::{Connection, params, params_from_iter};
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::{Entity, KnowledgeStore, Relationship, RunRecord, Snapshot, StoreError};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS entities (
    id          TEXT PRIMARY KEY,
    kind        TEXT NOT NULL,
    name        TEXT NOT NULL,
    properties  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS relationships (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    source      TEXT NOT NULL,
    target      TEXT NOT NULL,
    kind        TEXT NOT NULL,
    properties  TEXT NOT NULL,
    created_at  TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS runs (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id      TEXT NOT NULL,
    iteration   INTEGER NOT NULL,
    status      TEXT NOT NULL,
    cost        REAL NOT NULL,
    detail      TEXT NOT NULL,
    logged_at   TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_runs_run_id ON runs(run_id);
CREATE TABLE IF NOT EXISTS snapshots (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id      TEXT NOT NULL,
    label       TEXT NOT NULL,
    content     TEXT NOT NULL,
    created_at  TEXT NOT NULL
);
";

/// Tables managed by [`SqliteStore`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Entities,
    Relationships,
    Runs,
    Snapshots,
}

impl Table {
    fn name(self) -> &'static str {
        match self {
            Table::Entities => "entities",
            Table::Relationships => "relationships",
            Table::Runs => "runs",
            Table::Snapshots => "snapshots",
        }
    }
}

/// KnowledgeStore over a single SQLite connection
pub struct SqliteStore {
    conn: Connection,
    in_transaction: bool,
}

impl SqliteStore {
    /// Open (or create) a database file
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        debug!(path = %path.display(), "SqliteStore::open: called");
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Rejected(format!("cannot create {}: {}", parent.display(), e)))?;
        }
        let conn = Connection::open(path)?;
        let store = Self::init(conn)?;
        info!(path = %path.display(), "Opened knowledge store");
        Ok(store)
    }

    /// Open a private in-memory database
    pub fn open_in_memory() -> Result<Self, StoreError> {
        debug!("SqliteStore::open_in_memory: called");
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn,
            in_transaction: false,
        })
    }

    /// Count rows in one of the managed tables
    pub fn count(&self, table: Table) -> Result<u64, StoreError> {
        let sql = format!("SELECT COUNT(*) FROM {}", table.name());
        let count: i64 = self.conn.query_row(&sql, [], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }

    /// Fetch an entity by id
    pub fn entity(&self, id: &str) -> Result<Option<Entity>, StoreError> {
        debug!(%id, "SqliteStore::entity: called");
        let mut stmt = self
            .conn
            .prepare("SELECT id, kind, name, properties FROM entities WHERE id = ?1")?;
        let mut rows = stmt.query(params![id])?;
        match rows.next()? {
            Some(row) => {
                let properties: String = row.get(3)?;
                Ok(Some(Entity {
                    id: row.get(0)?,
                    kind: row.get(1)?,
                    name: row.get(2)?,
                    properties: serde_json::from_str(&properties)?,
                }))
            }
            None => Ok(None),
        }
    }

    /// Run log entries for one run, in iteration order
    pub fn runs(&self, run_id: &str) -> Result<Vec<RunRecord>, StoreError> {
        debug!(%run_id, "SqliteStore::runs: called");
        let mut stmt = self
            .conn
            .prepare("SELECT run_id, iteration, status, cost, detail FROM runs WHERE run_id = ?1 ORDER BY iteration, id")?;
        let rows = stmt.query_map(params![run_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, u32>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, f64>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (run_id, iteration, status, cost, detail) = row?;
            records.push(RunRecord {
                run_id,
                iteration,
                status,
                cost,
                detail: serde_json::from_str(&detail)?,
            });
        }
        Ok(records)
    }

    fn require_transaction(&self) -> Result<(), StoreError> {
        if self.in_transaction {
            Ok(())
        } else {
            Err(StoreError::NoTransaction)
        }
    }
}

/// Map a JSON parameter onto the closest SQLite value
fn to_sql_value(value: &Value) -> rusqlite::types::Value {
    use rusqlite::types::Value as Sql;
    match value {
        Value::Null => Sql::Null,
        Value::Bool(b) => Sql::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Sql::Integer(i),
            None => Sql::Real(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => Sql::Text(s.clone()),
        other => Sql::Text(other.to_string()),
    }
}

impl KnowledgeStore for SqliteStore {
    fn begin(&mut self) -> Result<(), StoreError> {
        debug!("SqliteStore::begin: called");
        if self.in_transaction {
            return Err(StoreError::TransactionOpen);
        }
        // IMMEDIATE takes the write lock up front so conflicts surface here,
        // not halfway through a batch
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        self.in_transaction = true;
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        debug!("SqliteStore::commit: called");
        self.require_transaction()?;
        self.conn.execute_batch("COMMIT")?;
        self.in_transaction = false;
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), StoreError> {
        debug!("SqliteStore::rollback: called");
        self.require_transaction()?;
        self.in_transaction = false;
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }

    fn add_entity(&mut self, entity: &Entity) -> Result<Value, StoreError> {
        debug!(id = %entity.id, kind = %entity.kind, "SqliteStore::add_entity: called");
        self.require_transaction()?;
        let properties = serde_json::to_string(&entity.properties)?;
        self.conn.execute(
            "INSERT INTO entities (id, kind, name, properties, updated_at) VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET kind = excluded.kind, name = excluded.name,
                 properties = excluded.properties, updated_at = excluded.updated_at",
            params![entity.id, entity.kind, entity.name, properties, Utc::now().to_rfc3339()],
        )?;
        Ok(json!({ "entity_id": entity.id }))
    }

    fn add_relationship(&mut self, relationship: &Relationship) -> Result<Value, StoreError> {
        debug!(
            source = %relationship.source,
            target = %relationship.target,
            kind = %relationship.kind,
            "SqliteStore::add_relationship: called"
        );
        self.require_transaction()?;
        let properties = serde_json::to_string(&relationship.properties)?;
        self.conn.execute(
            "INSERT INTO relationships (source, target, kind, properties, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                relationship.source,
                relationship.target,
                relationship.kind,
                properties,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(json!({ "relationship_id": self.conn.last_insert_rowid() }))
    }

    fn log_run(&mut self, record: &RunRecord) -> Result<Value, StoreError> {
        debug!(run_id = %record.run_id, iteration = record.iteration, "SqliteStore::log_run: called");
        self.require_transaction()?;
        let detail = serde_json::to_string(&record.detail)?;
        self.conn.execute(
            "INSERT INTO runs (run_id, iteration, status, cost, detail, logged_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.run_id,
                record.iteration,
                record.status,
                record.cost,
                detail,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(json!({ "run_log_id": self.conn.last_insert_rowid() }))
    }

    fn add_snapshot(&mut self, snapshot: &Snapshot) -> Result<Value, StoreError> {
        debug!(run_id = %snapshot.run_id, label = %snapshot.label, "SqliteStore::add_snapshot: called");
        self.require_transaction()?;
        let content = serde_json::to_string(&snapshot.content)?;
        self.conn.execute(
            "INSERT INTO snapshots (run_id, label, content, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![snapshot.run_id, snapshot.label, content, Utc::now().to_rfc3339()],
        )?;
        Ok(json!({ "snapshot_id": self.conn.last_insert_rowid() }))
    }

    fn execute_raw(&mut self, sql: &str, params: &[Value]) -> Result<Value, StoreError> {
        debug!(%sql, param_count = params.len(), "SqliteStore::execute_raw: called");
        self.require_transaction()?;
        let values: Vec<rusqlite::types::Value> = params.iter().map(to_sql_value).collect();
        let changed = self.conn.execute(sql, params_from_iter(values))?;
        Ok(json!({ "rows_affected": changed }))
    }
}
