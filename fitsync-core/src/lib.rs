pub mod config;
pub mod error;
pub mod history;
pub mod journal;
pub mod model;
pub mod schema;
pub mod snapshot;
pub mod store;
pub mod types;

pub use config::StoreConfig;
pub use error::{Error, Result};
pub use model::{
    is_local_id, new_local_id, Division, Exercise, IdAlias, NewSet, PendingDivisionCreate,
    Split, SyncState, WorkoutLog,
};
pub use schema::{
    fitness_schema, KeyPath, Schema, TableSchema, DIVISIONS, EXERCISES, ID_ALIASES,
    PENDING_DIVISION_CREATES, SCHEMA_VERSION, SPLITS, WORKOUT_LOGS,
};
pub use store::{Query, Store, StoreChange, Transaction};
pub use types::*;
