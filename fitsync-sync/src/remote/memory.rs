/// In-process remote store
///
/// Behaves like the hosted store for the operations the sync layer uses:
/// assigns ids, cascades division deletes, filters and orders reads. Tests
/// drive it offline, inject failures and add latency.

use async_trait::async_trait;
use fitsync_core::{Division, FieldValue, Split};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use uuid::Uuid;

use super::{
    NewDivision, NewSplit, RemoteQuery, RemoteStore, RemoteWorkoutLog, REMOTE_DIVISIONS,
    REMOTE_EXERCISES, REMOTE_SPLITS, REMOTE_WORKOUT_LOGS,
};
use crate::error::RemoteError;

#[derive(Default)]
struct Tables {
    rows: HashMap<String, Vec<Value>>,
    seen_refs: HashSet<Uuid>,
}

impl Tables {
    fn table_mut(&mut self, name: &str) -> &mut Vec<Value> {
        self.rows.entry(name.to_string()).or_default()
    }
}

pub struct MemoryRemote {
    tables: Mutex<Tables>,
    reachable: AtomicBool,
    failures_pending: AtomicUsize,
    targeted_failures: Mutex<HashMap<&'static str, usize>>,
    latency: Mutex<Duration>,
    calls: Mutex<HashMap<&'static str, usize>>,
    log_inserts_in_flight: AtomicUsize,
    max_log_inserts_in_flight: AtomicUsize,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            reachable: AtomicBool::new(true),
            failures_pending: AtomicUsize::new(0),
            targeted_failures: Mutex::new(HashMap::new()),
            latency: Mutex::new(Duration::ZERO),
            calls: Mutex::new(HashMap::new()),
            log_inserts_in_flight: AtomicUsize::new(0),
            max_log_inserts_in_flight: AtomicUsize::new(0),
        }
    }

    /// Make every call fail with `Unreachable` until set back
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Reject the next `count` calls with a server error
    pub fn fail_next(&self, count: usize) {
        self.failures_pending.store(count, Ordering::SeqCst);
    }

    /// Reject the next `count` calls to one operation only
    pub fn fail_next_on(&self, operation: &'static str, count: usize) {
        self.targeted_failures.lock().insert(operation, count);
    }

    /// Delay every call by `latency`
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// Number of calls made to `operation`, failed ones included
    pub fn calls(&self, operation: &str) -> usize {
        self.calls.lock().get(operation).copied().unwrap_or(0)
    }

    /// Highest number of log inserts that were ever running at once
    pub fn max_concurrent_log_inserts(&self) -> usize {
        self.max_log_inserts_in_flight.load(Ordering::SeqCst)
    }

    /// Snapshot of a remote table
    pub fn rows(&self, table: &str) -> Vec<Value> {
        self.tables.lock().rows.get(table).cloned().unwrap_or_default()
    }

    /// Seed a row directly, bypassing failure injection
    pub fn insert_row(&self, table: &str, row: Value) {
        self.tables.lock().table_mut(table).push(row);
    }

    async fn enter(&self, operation: &'static str) -> Result<(), RemoteError> {
        *self.calls.lock().entry(operation).or_insert(0) += 1;

        if !self.reachable.load(Ordering::SeqCst) {
            return Err(RemoteError::Unreachable(format!(
                "{}: network is down",
                operation
            )));
        }

        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let injected = self
            .failures_pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
            || match self.targeted_failures.lock().get_mut(operation) {
                Some(n) if *n > 0 => {
                    *n -= 1;
                    true
                }
                _ => false,
            };
        if injected {
            return Err(RemoteError::Rejected {
                status: 503,
                message: format!("{}: injected failure", operation),
            });
        }

        Ok(())
    }
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn insert_workout_logs(&self, rows: &[RemoteWorkoutLog]) -> Result<(), RemoteError> {
        let running = self.log_inserts_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _in_flight = InFlight(&self.log_inserts_in_flight);
        self.max_log_inserts_in_flight
            .fetch_max(running, Ordering::SeqCst);

        self.enter("insert_workout_logs").await?;

        let mut tables = self.tables.lock();
        for row in rows {
            if let Some(client_ref) = row.client_ref {
                if !tables.seen_refs.insert(client_ref) {
                    tracing::debug!(%client_ref, "dropping duplicate log insert");
                    continue;
                }
            }
            let mut value = serde_json::to_value(row)?;
            value["id"] = json!(Uuid::new_v4().to_string());
            tables.table_mut(REMOTE_WORKOUT_LOGS).push(value);
        }
        Ok(())
    }

    async fn insert_division(&self, division: &NewDivision) -> Result<Division, RemoteError> {
        self.enter("insert_division").await?;

        let mut row = serde_json::to_value(division)?;
        row["id"] = json!(Uuid::new_v4().to_string());
        row["created_at"] = json!(now());
        let created: Division = serde_json::from_value(row.clone())?;

        self.tables.lock().table_mut(REMOTE_DIVISIONS).push(row);
        Ok(created)
    }

    async fn insert_splits(&self, splits: &[NewSplit]) -> Result<Vec<Split>, RemoteError> {
        self.enter("insert_splits").await?;

        let mut rows = Vec::with_capacity(splits.len());
        let mut created = Vec::with_capacity(splits.len());
        for split in splits {
            let mut row = serde_json::to_value(split)?;
            row["id"] = json!(Uuid::new_v4().to_string());
            row["created_at"] = json!(now());
            created.push(serde_json::from_value(row.clone())?);
            rows.push(row);
        }

        self.tables.lock().table_mut(REMOTE_SPLITS).extend(rows);
        Ok(created)
    }

    async fn select(&self, query: &RemoteQuery) -> Result<Vec<Value>, RemoteError> {
        self.enter("select").await?;

        let tables = self.tables.lock();
        let mut rows: Vec<Value> = tables
            .rows
            .get(&query.table)
            .map(|rows| rows.iter().filter(|r| query.matches(r)).cloned().collect())
            .unwrap_or_default();

        if let Some(field) = &query.order_by {
            let sort_key = |row: &Value| {
                row.get(field)
                    .and_then(FieldValue::from_json)
                    .unwrap_or(FieldValue::Null)
            };
            rows.sort_by_key(sort_key);
        }
        Ok(rows)
    }

    async fn delete_division(&self, id: &str) -> Result<(), RemoteError> {
        self.enter("delete_division").await?;

        let mut tables = self.tables.lock();
        tables
            .table_mut(REMOTE_DIVISIONS)
            .retain(|row| row["id"] != id);

        let mut split_ids = HashSet::new();
        tables.table_mut(REMOTE_SPLITS).retain(|row| {
            if row["division_id"] == id {
                if let Some(split_id) = row["id"].as_str() {
                    split_ids.insert(split_id.to_string());
                }
                false
            } else {
                true
            }
        });

        tables.table_mut(REMOTE_EXERCISES).retain(|row| {
            row["split_id"]
                .as_str()
                .map(|s| !split_ids.contains(s))
                .unwrap_or(true)
        });
        Ok(())
    }
}
