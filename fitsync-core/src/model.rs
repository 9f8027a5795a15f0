//! Workout data model mirrored from the remote store.

use crate::schema::{
    DIVISIONS, EXERCISES, ID_ALIASES, PENDING_DIVISION_CREATES, SPLITS, WORKOUT_LOGS,
};
use crate::{Entity, Error, FieldValue, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

const LOCAL_ID_PREFIX: &str = "local-";

/// Generate a device-local temporary identifier
pub fn new_local_id() -> String {
    format!("{}{}", LOCAL_ID_PREFIX, Uuid::new_v4())
}

/// True for identifiers produced by [`new_local_id`]; those never name a
/// remote row
pub fn is_local_id(id: &str) -> bool {
    id.starts_with(LOCAL_ID_PREFIX)
}

/// A training program, e.g. "PPL"
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Division {
    pub id: String,
    /// Remote rows name this column `user_id`
    #[serde(alias = "user_id")]
    pub owner_id: String,
    pub name: String,
    pub frequency: String,
    pub created_at: String,
}

impl Entity for Division {
    const TABLE: &'static str = DIVISIONS;
}

/// One training day within a division
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Split {
    pub id: String,
    pub division_id: String,
    pub name: String,
    pub order_index: i64,
    pub created_at: String,
}

impl Entity for Split {
    const TABLE: &'static str = SPLITS;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exercise {
    pub id: String,
    pub split_id: String,
    pub name: String,
    pub muscle_group: String,
    #[serde(default)]
    pub rest_time_seconds: u32,
    #[serde(default)]
    pub target_sets: u32,
}

impl Entity for Exercise {
    const TABLE: &'static str = EXERCISES;
}

/// Whether a row has been confirmed by the remote store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    Pending,
    Synced,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Pending => "pending",
            SyncState::Synced => "synced",
        }
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<SyncState> for FieldValue {
    fn from(state: SyncState) -> Self {
        FieldValue::from(state.as_str())
    }
}

/// One recorded set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkoutLog {
    /// Device-local key assigned by the store; never sent to the remote store
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_id: Option<u64>,
    pub workout_id: String,
    pub split_id: String,
    pub exercise_id: String,
    pub weight: f64,
    pub reps: u32,
    pub timestamp: String,
    pub sync_state: SyncState,
    /// Client-generated dedup key for the remote insert
    pub client_ref: Uuid,
}

impl Entity for WorkoutLog {
    const TABLE: &'static str = WORKOUT_LOGS;
}

impl WorkoutLog {
    /// Build a pending log from a validated set
    pub fn pending(set: NewSet, timestamp: String) -> Result<Self> {
        set.validate()?;
        Ok(Self {
            local_id: None,
            workout_id: set.workout_id,
            split_id: set.split_id,
            exercise_id: set.exercise_id,
            weight: set.weight,
            reps: set.reps,
            timestamp,
            sync_state: SyncState::Pending,
            client_ref: Uuid::new_v4(),
        })
    }

    /// Weight times reps
    pub fn volume(&self) -> f64 {
        self.weight * self.reps as f64
    }

    pub fn is_pending(&self) -> bool {
        self.sync_state == SyncState::Pending
    }
}

/// User input for logging a set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSet {
    pub workout_id: String,
    pub split_id: String,
    pub exercise_id: String,
    pub weight: f64,
    pub reps: u32,
}

impl NewSet {
    pub fn validate(&self) -> Result<()> {
        if !self.weight.is_finite() || self.weight <= 0.0 {
            return Err(Error::InvalidArgument(
                "weight must be greater than zero".to_string(),
            ));
        }
        if self.reps == 0 {
            return Err(Error::InvalidArgument(
                "reps must be greater than zero".to_string(),
            ));
        }
        if self.workout_id.is_empty() || self.exercise_id.is_empty() {
            return Err(Error::InvalidArgument(
                "workout_id and exercise_id are required".to_string(),
            ));
        }
        Ok(())
    }
}

/// A division (and its splits) created while the remote store was
/// unreachable. Keyed by the temporary division id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingDivisionCreate {
    pub id: String,
    pub owner_id: String,
    pub division: Division,
    pub splits: Vec<Split>,
    pub created_at: String,
    /// Failed remote attempts so far
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl Entity for PendingDivisionCreate {
    const TABLE: &'static str = PENDING_DIVISION_CREATES;
}

impl PendingDivisionCreate {
    pub fn new(division: Division, splits: Vec<Split>) -> Self {
        Self {
            id: division.id.clone(),
            owner_id: division.owner_id.clone(),
            created_at: division.created_at.clone(),
            division,
            splits,
            attempts: 0,
            last_error: None,
        }
    }

    /// Temporary split ids held by this entry
    pub fn local_split_ids(&self) -> impl Iterator<Item = &str> {
        self.splits.iter().map(|s| s.id.as_str())
    }

    /// Aliases from this entry's temporary ids to the ids the remote store
    /// assigned. `splits` is in the same order as the entry's splits.
    pub fn aliases_to(&self, division_id: &str, splits: &[Split]) -> Vec<IdAlias> {
        let mut aliases = vec![IdAlias::new(&self.id, division_id, DIVISIONS)];
        aliases.extend(
            self.local_split_ids()
                .zip(splits)
                .map(|(local, remote)| IdAlias::new(local, &remote.id, SPLITS)),
        );
        aliases
    }
}

/// Maps a temporary id to the remote id that replaced it, so references
/// captured before the replacement can still be resolved
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdAlias {
    pub local_id: String,
    pub remote_id: String,
    /// Table the remote id lives in
    pub table: String,
}

impl Entity for IdAlias {
    const TABLE: &'static str = ID_ALIASES;
}

impl IdAlias {
    pub fn new(local_id: &str, remote_id: &str, table: &str) -> Self {
        Self {
            local_id: local_id.to_string(),
            remote_id: remote_id.to_string(),
            table: table.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(weight: f64, reps: u32) -> NewSet {
        NewSet {
            workout_id: "workout-1".into(),
            split_id: "split-1".into(),
            exercise_id: "ex-1".into(),
            weight,
            reps,
        }
    }

    #[test]
    fn test_set_validation() {
        assert!(set(80.0, 8).validate().is_ok());
        assert!(set(0.0, 8).validate().is_err());
        assert!(set(-5.0, 8).validate().is_err());
        assert!(set(f64::NAN, 8).validate().is_err());
        assert!(set(80.0, 0).validate().is_err());
    }

    #[test]
    fn test_pending_log() {
        let log = WorkoutLog::pending(set(80.0, 8), "2024-02-20T10:00:00Z".into()).unwrap();
        assert!(log.is_pending());
        assert_eq!(log.volume(), 640.0);
        assert!(log.local_id.is_none());
    }

    #[test]
    fn test_local_id_never_serialized_when_unset() {
        let log = WorkoutLog::pending(set(80.0, 8), "2024-02-20T10:00:00Z".into()).unwrap();
        let json = serde_json::to_value(&log).unwrap();
        assert!(json.get("local_id").is_none());
        assert_eq!(json["sync_state"], "pending");
    }

    #[test]
    fn test_local_ids() {
        let id = new_local_id();
        assert!(is_local_id(&id));
        assert!(!is_local_id("9b2f6c1e-0000-4000-8000-000000000000"));
    }

    fn split(id: &str, division_id: &str, order_index: i64) -> Split {
        Split {
            id: id.into(),
            division_id: division_id.into(),
            name: format!("Day {}", order_index + 1),
            order_index,
            created_at: "2024-02-20T10:00:00Z".into(),
        }
    }

    #[test]
    fn test_aliases_follow_split_order() {
        let division = Division {
            id: new_local_id(),
            owner_id: "user-1".into(),
            name: "PPL".into(),
            frequency: "6x".into(),
            created_at: "2024-02-20T10:00:00Z".into(),
        };
        let local_splits = vec![
            split(&new_local_id(), &division.id, 0),
            split(&new_local_id(), &division.id, 1),
        ];
        let entry = PendingDivisionCreate::new(division.clone(), local_splits.clone());
        let remote_splits = vec![split("s-10", "d-1", 0), split("s-11", "d-1", 1)];

        let aliases = entry.aliases_to("d-1", &remote_splits);
        assert_eq!(aliases.len(), 3);
        assert_eq!(aliases[0], IdAlias::new(&division.id, "d-1", DIVISIONS));
        assert_eq!(aliases[1], IdAlias::new(&local_splits[0].id, "s-10", SPLITS));
        assert_eq!(aliases[2], IdAlias::new(&local_splits[1].id, "s-11", SPLITS));
    }
}
