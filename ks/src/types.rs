//! Typed payloads for the named store mutations

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A node in the knowledge graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Stable identifier; re-adding the same id updates the entity
    pub id: String,

    /// Entity kind (e.g. "concept", "document", "person")
    pub kind: String,

    /// Display name
    pub name: String,

    /// Free-form properties
    #[serde(default)]
    pub properties: Value,
}

impl Entity {
    pub fn new(id: impl Into<String>, kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            name: name.into(),
            properties: Value::Null,
        }
    }

    pub fn with_properties(mut self, properties: Value) -> Self {
        self.properties = properties;
        self
    }
}

/// A directed edge between two entities
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub source: String,
    pub target: String,
    pub kind: String,
    #[serde(default)]
    pub properties: Value,
}

impl Relationship {
    pub fn new(source: impl Into<String>, target: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            kind: kind.into(),
            properties: Value::Null,
        }
    }
}

/// One iteration of a job run, as recorded in the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub iteration: u32,
    pub status: String,
    #[serde(default)]
    pub cost: f64,
    #[serde(default)]
    pub detail: Value,
}

/// A labelled point-in-time document attached to a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub run_id: String,
    pub label: String,
    pub content: Value,
}
