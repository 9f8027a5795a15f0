//! Versioned table schema for the local store.
//!
//! Indexes are derived data: they are rebuilt from rows on every open, so a
//! schema upgrade only has to decide which tables survive.

use crate::{Error, Result};

/// Current on-disk schema version
pub const SCHEMA_VERSION: u32 = 4;

pub const DIVISIONS: &str = "divisions";
pub const SPLITS: &str = "splits";
pub const EXERCISES: &str = "exercises";
pub const WORKOUT_LOGS: &str = "workout_logs";
pub const PENDING_DIVISION_CREATES: &str = "pending_division_creates";
pub const ID_ALIASES: &str = "id_aliases";

/// How a table's primary key is obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPath {
    /// Key is read from the named field and must be present on put
    Explicit(&'static str),
    /// Key is read from the named field; when absent the store assigns the
    /// next integer and writes it back into the row
    AutoIncrement(&'static str),
}

impl KeyPath {
    pub fn field(&self) -> &'static str {
        match self {
            KeyPath::Explicit(f) | KeyPath::AutoIncrement(f) => f,
        }
    }

    pub fn is_auto_increment(&self) -> bool {
        matches!(self, KeyPath::AutoIncrement(_))
    }
}

/// Declaration of one table
#[derive(Debug, Clone)]
pub struct TableSchema {
    pub name: &'static str,
    pub key: KeyPath,
    pub indexes: Vec<&'static str>,
}

impl TableSchema {
    pub fn new(name: &'static str, key: KeyPath) -> Self {
        Self {
            name,
            key,
            indexes: Vec::new(),
        }
    }

    pub fn index(mut self, field: &'static str) -> Self {
        self.indexes.push(field);
        self
    }

    /// True if `field` can be used for an equality lookup
    pub fn is_queryable(&self, field: &str) -> bool {
        self.key.field() == field || self.indexes.iter().any(|f| *f == field)
    }
}

/// Complete set of tables at one schema version
#[derive(Debug, Clone)]
pub struct Schema {
    pub version: u32,
    pub tables: Vec<TableSchema>,
}

impl Schema {
    pub fn table(&self, name: &str) -> Result<&TableSchema> {
        self.tables
            .iter()
            .find(|t| t.name == name)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown table: {}", name)))
    }

    /// Check that data written at `found` can be opened with this schema
    pub fn check_compatible(&self, found: u32) -> Result<()> {
        if found > self.version {
            return Err(Error::SchemaMismatch(format!(
                "data written with schema version {}, this build supports up to {}",
                found, self.version
            )));
        }
        Ok(())
    }
}

/// Schema of the fitness mirror tables and the pending-write queue
pub fn fitness_schema() -> Schema {
    Schema {
        version: SCHEMA_VERSION,
        tables: vec![
            TableSchema::new(DIVISIONS, KeyPath::Explicit("id"))
                .index("owner_id")
                .index("created_at"),
            TableSchema::new(SPLITS, KeyPath::Explicit("id"))
                .index("division_id")
                .index("order_index"),
            TableSchema::new(EXERCISES, KeyPath::Explicit("id"))
                .index("split_id")
                .index("name")
                .index("muscle_group"),
            TableSchema::new(WORKOUT_LOGS, KeyPath::AutoIncrement("local_id"))
                .index("workout_id")
                .index("split_id")
                .index("exercise_id")
                .index("sync_state")
                .index("timestamp"),
            TableSchema::new(PENDING_DIVISION_CREATES, KeyPath::Explicit("id"))
                .index("created_at"),
            TableSchema::new(ID_ALIASES, KeyPath::Explicit("local_id")).index("remote_id"),
        ],
    }
}
