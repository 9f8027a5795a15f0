/// Remote store abstraction
///
/// The remote relational store is the database of record. It assigns ids to
/// divisions and splits, and accepts logs as a multi-row insert that either
/// succeeds or fails as a whole.

use async_trait::async_trait;
use fitsync_core::{Division, Split, WorkoutLog};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::RemoteError;

pub mod memory;

#[cfg(feature = "http")]
pub mod http;

pub use memory::MemoryRemote;

#[cfg(feature = "http")]
pub use http::HttpRemote;

pub const REMOTE_DIVISIONS: &str = "workout_divisions";
pub const REMOTE_SPLITS: &str = "workout_splits";
pub const REMOTE_EXERCISES: &str = "exercises";
pub const REMOTE_WORKOUT_LOGS: &str = "workout_logs";

/// Column holding the owner identity on remote rows
pub const REMOTE_OWNER_FIELD: &str = "user_id";

/// A log as submitted to the remote store, without device-local fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteWorkoutLog {
    pub workout_id: String,
    pub split_id: String,
    pub exercise_id: String,
    pub weight: f64,
    pub reps: u32,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ref: Option<Uuid>,
}

impl RemoteWorkoutLog {
    pub fn from_log(log: &WorkoutLog, with_client_ref: bool) -> Self {
        Self {
            workout_id: log.workout_id.clone(),
            split_id: log.split_id.clone(),
            exercise_id: log.exercise_id.clone(),
            weight: log.weight,
            reps: log.reps,
            timestamp: log.timestamp.clone(),
            client_ref: with_client_ref.then_some(log.client_ref),
        }
    }
}

/// Division insert payload; the remote store assigns `id` and `created_at`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewDivision {
    #[serde(rename = "user_id")]
    pub owner_id: String,
    pub name: String,
    pub frequency: String,
}

impl From<&Division> for NewDivision {
    fn from(division: &Division) -> Self {
        Self {
            owner_id: division.owner_id.clone(),
            name: division.name.clone(),
            frequency: division.frequency.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSplit {
    pub division_id: String,
    pub name: String,
    pub order_index: i64,
}

impl NewSplit {
    /// Payload for `split` re-parented under the remote division `division_id`
    pub fn for_division(split: &Split, division_id: &str) -> Self {
        Self {
            division_id: division_id.to_string(),
            name: split.name.clone(),
            order_index: split.order_index,
        }
    }
}

/// Equality-filtered read of one remote table
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RemoteQuery {
    pub table: String,
    pub filters: Vec<(String, Value)>,
    pub order_by: Option<String>,
}

impl RemoteQuery {
    pub fn new(table: &str) -> Self {
        Self {
            table: table.to_string(),
            ..Self::default()
        }
    }

    pub fn eq(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.filters.push((field.to_string(), value.into()));
        self
    }

    /// Order ascending by `field`
    pub fn order_by(mut self, field: &str) -> Self {
        self.order_by = Some(field.to_string());
        self
    }

    /// True if `row` satisfies every filter
    pub fn matches(&self, row: &Value) -> bool {
        self.filters
            .iter()
            .all(|(field, value)| row.get(field) == Some(value))
    }
}

/// Operations consumed from the remote store
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Insert all rows in one call; success or failure covers the whole batch
    async fn insert_workout_logs(&self, rows: &[RemoteWorkoutLog]) -> Result<(), RemoteError>;

    /// Insert a division and return it with its remote id
    async fn insert_division(&self, division: &NewDivision) -> Result<Division, RemoteError>;

    /// Insert splits and return them, in input order, with their remote ids
    async fn insert_splits(&self, splits: &[NewSplit]) -> Result<Vec<Split>, RemoteError>;

    async fn select(&self, query: &RemoteQuery) -> Result<Vec<Value>, RemoteError>;

    /// Delete a division; the remote store cascades to its splits and exercises
    async fn delete_division(&self, id: &str) -> Result<(), RemoteError>;
}
