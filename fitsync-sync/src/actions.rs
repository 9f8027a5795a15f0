/// User-facing write path
///
/// Every action commits locally first. Remote work either follows in the
/// background (logs) or falls back to the pending-write queue when the remote
/// store cannot be reached (divisions).

use chrono::Utc;
use fitsync_core::{
    is_local_id, new_local_id, Division, Exercise, IdAlias, Key, NewSet, PendingDivisionCreate,
    Split, Store, SyncState, Transaction, WorkoutLog, DIVISIONS, EXERCISES, ID_ALIASES,
    PENDING_DIVISION_CREATES, SPLITS, WORKOUT_LOGS,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::cache::{CacheQuery, Loaded, ReadThroughLoader};
use crate::engine::SyncEngine;
use crate::error::{Result, SyncError};
use crate::queue::PendingWriteQueue;
use crate::remote::{NewDivision, NewSplit};

/// Form input for a new division
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DivisionDraft {
    pub name: String,
    pub frequency: String,
    /// Split names in training order
    pub splits: Vec<String>,
}

/// Where a new division ended up
#[derive(Debug, Clone, PartialEq)]
pub enum DivisionCreated {
    /// Created remotely and mirrored locally
    Remote { division: Division, splits: Vec<Split> },
    /// Stored locally under temporary ids, waiting in the queue
    Queued { division: Division, splits: Vec<Split> },
}

impl DivisionCreated {
    pub fn division(&self) -> &Division {
        match self {
            DivisionCreated::Remote { division, .. } | DivisionCreated::Queued { division, .. } => {
                division
            }
        }
    }

    pub fn splits(&self) -> &[Split] {
        match self {
            DivisionCreated::Remote { splits, .. } | DivisionCreated::Queued { splits, .. } => splits,
        }
    }

    pub fn is_queued(&self) -> bool {
        matches!(self, DivisionCreated::Queued { .. })
    }
}

pub struct FitnessTracker {
    engine: SyncEngine,
    loader: ReadThroughLoader,
}

impl FitnessTracker {
    pub fn new(engine: SyncEngine) -> Self {
        let loader = ReadThroughLoader::new(engine.store().clone(), engine.remote().clone());
        Self { engine, loader }
    }

    pub fn engine(&self) -> &SyncEngine {
        &self.engine
    }

    pub fn loader(&self) -> &ReadThroughLoader {
        &self.loader
    }

    fn store(&self) -> &Arc<Store> {
        self.engine.store()
    }

    fn owner_id(&self) -> &str {
        &self.engine.config().owner_id
    }

    /// Record a set locally as pending and ask for a sync if online.
    ///
    /// A temporary split id whose division has already been created remotely
    /// is replaced by the remote split id. Only a local storage failure is
    /// reported; the remote side never blocks or fails this call.
    pub fn log_set(&self, mut set: NewSet) -> Result<WorkoutLog> {
        if let Some(remote_id) = self.engine.resolve_id(&set.split_id)? {
            set.split_id = remote_id;
        }
        let mut log = WorkoutLog::pending(set, Utc::now().to_rfc3339())?;
        let key = self.store().put(&log)?;
        log.local_id = key.as_int();

        tracing::debug!(local_id = ?log.local_id, workout_id = %log.workout_id, "set logged");
        self.engine.request_sync();
        Ok(log)
    }

    /// Create a division with its splits.
    ///
    /// Online, the remote store assigns the ids and the result is mirrored
    /// locally. Offline, or if the remote store fails, the division and its
    /// splits are stored under temporary ids together with a queue entry, in
    /// one local transaction.
    pub async fn create_division(&self, draft: DivisionDraft) -> Result<DivisionCreated> {
        if draft.name.trim().is_empty() {
            return Err(fitsync_core::Error::InvalidArgument(
                "division name must not be empty".to_string(),
            )
            .into());
        }

        if self.engine.is_online() {
            match self.create_remote(&draft).await {
                Ok(created) => return Ok(created),
                Err(SyncError::Remote(e)) => {
                    tracing::warn!(error = %e, "remote division insert failed, queueing it");
                }
                Err(e) => return Err(e),
            }
        }

        self.create_queued(draft)
    }

    async fn create_remote(&self, draft: &DivisionDraft) -> Result<DivisionCreated> {
        let remote = self.engine.remote();
        let division = remote
            .insert_division(&NewDivision {
                owner_id: self.owner_id().to_string(),
                name: draft.name.clone(),
                frequency: draft.frequency.clone(),
            })
            .await?;

        let payload: Vec<NewSplit> = draft
            .splits
            .iter()
            .enumerate()
            .map(|(i, name)| NewSplit {
                division_id: division.id.clone(),
                name: name.clone(),
                order_index: i as i64,
            })
            .collect();

        let splits = match remote.insert_splits(&payload).await {
            Ok(splits) => splits,
            Err(e) => {
                if let Err(cleanup) = remote.delete_division(&division.id).await {
                    tracing::warn!(remote_id = %division.id, error = %cleanup, "could not remove partially created division");
                }
                return Err(e.into());
            }
        };

        self.store().transaction(&[DIVISIONS, SPLITS], |tx| {
            tx.put(&division)?;
            for split in &splits {
                tx.put(split)?;
            }
            Ok(())
        })?;

        tracing::info!(id = %division.id, splits = splits.len(), "division created");
        Ok(DivisionCreated::Remote { division, splits })
    }

    fn create_queued(&self, draft: DivisionDraft) -> Result<DivisionCreated> {
        let now = Utc::now().to_rfc3339();
        let division = Division {
            id: new_local_id(),
            owner_id: self.owner_id().to_string(),
            name: draft.name,
            frequency: draft.frequency,
            created_at: now.clone(),
        };
        let splits: Vec<Split> = draft
            .splits
            .into_iter()
            .enumerate()
            .map(|(i, name)| Split {
                id: new_local_id(),
                division_id: division.id.clone(),
                name,
                order_index: i as i64,
                created_at: now.clone(),
            })
            .collect();

        let entry = PendingDivisionCreate::new(division.clone(), splits.clone());
        self.store()
            .transaction(&[DIVISIONS, SPLITS, PENDING_DIVISION_CREATES], |tx| {
                tx.put(&division)?;
                for split in &splits {
                    tx.put(split)?;
                }
                PendingWriteQueue::enqueue_in(tx, &entry)
            })?;

        tracing::info!(local_id = %division.id, splits = splits.len(), "division queued for creation");
        Ok(DivisionCreated::Queued { division, splits })
    }

    /// Delete a division and its splits.
    ///
    /// A queued division is removed locally together with its queue entry and
    /// any logs on its temporary splits. If a sync pass created it remotely
    /// in the meantime, the remote division is deleted instead. A remote
    /// division needs connectivity: it is deleted remotely first, then
    /// locally with its splits and their exercises.
    pub async fn delete_division(&self, id: &str) -> Result<()> {
        if !is_local_id(id) {
            return self.delete_remote(id).await;
        }

        let removed = self
            .engine
            .division_queue()
            .remove_with(&Key::from(id), &[DIVISIONS, SPLITS, WORKOUT_LOGS], |tx| {
                delete_local_division(tx, id, false)
            })
            .await?;
        if removed {
            tracing::info!(local_id = %id, "queued division discarded");
            return Ok(());
        }

        match self.engine.resolve_id(id)? {
            Some(remote_id) => {
                tracing::info!(local_id = %id, %remote_id, "queued division was already created remotely");
                self.delete_remote(&remote_id).await
            }
            None => {
                // Not queued and never created: only stray local rows can remain
                self.store()
                    .transaction(&[DIVISIONS, SPLITS, WORKOUT_LOGS], |tx| {
                        delete_local_division(tx, id, false)
                    })?;
                Ok(())
            }
        }
    }

    async fn delete_remote(&self, id: &str) -> Result<()> {
        if !self.engine.is_online() {
            return Err(SyncError::Offline);
        }

        self.engine.remote().delete_division(id).await?;
        self.store()
            .transaction(&[DIVISIONS, SPLITS, EXERCISES, ID_ALIASES], |tx| {
                delete_local_division(tx, id, true)
            })?;
        tracing::info!(id = %id, "division deleted");
        Ok(())
    }

    /// All sets of one workout session, oldest first
    pub fn session_logs(&self, workout_id: &str) -> Result<Vec<WorkoutLog>> {
        Ok(self
            .store()
            .query::<WorkoutLog>()
            .eq("workout_id", workout_id)
            .order_by("timestamp")
            .fetch()?)
    }

    /// Logs not yet confirmed by the remote store, oldest first
    pub fn pending_logs(&self) -> Result<Vec<WorkoutLog>> {
        self.engine.pending_logs()
    }

    /// Every local log, ordered by timestamp
    pub fn all_logs(&self) -> Result<Vec<WorkoutLog>> {
        Ok(self.store().query::<WorkoutLog>().order_by("timestamp").fetch()?)
    }

    pub fn synced_log_count(&self) -> Result<usize> {
        Ok(self
            .store()
            .query_by_index(WORKOUT_LOGS, "sync_state", SyncState::Synced)?
            .len())
    }

    /// The owner's divisions, local first, refreshed in the background
    pub async fn divisions(&self) -> Result<Loaded<Division>> {
        self.loader
            .load(CacheQuery::eq("owner_id", self.owner_id()).order_by("created_at"))
            .await
    }

    /// Splits of a division in training order, refreshed in the background.
    /// Queued divisions have no remote rows to refresh from.
    pub async fn splits(&self, division_id: &str) -> Result<Loaded<Split>> {
        let query = CacheQuery::eq("division_id", division_id).order_by("order_index");
        if is_local_id(division_id) {
            let rows = self.loader.local(&query)?;
            let count = rows.len();
            return Ok(Loaded {
                rows,
                refresh: tokio::spawn(async move { Ok(count) }),
            });
        }
        self.loader.load(query).await
    }

    pub async fn exercises(&self, split_id: &str) -> Result<Loaded<Exercise>> {
        self.loader.load(CacheQuery::eq("split_id", split_id)).await
    }
}

/// Remove a division row and its splits. Remote divisions also lose their
/// splits' exercises and any aliases naming them; queued ones lose the logs
/// recorded on their temporary splits, which could never be submitted.
fn delete_local_division(
    tx: &mut Transaction<'_>,
    division_id: &str,
    remote: bool,
) -> fitsync_core::Result<()> {
    if remote {
        drop_aliases(tx, division_id)?;
    }
    let splits: Vec<Split> = tx.query("division_id", division_id)?;
    for split in &splits {
        if remote {
            for exercise in tx.query::<Exercise>("split_id", &split.id)? {
                tx.delete(EXERCISES, &Key::from(&exercise.id))?;
            }
            drop_aliases(tx, &split.id)?;
        } else {
            for log in tx.query::<WorkoutLog>("split_id", &split.id)? {
                if let Some(local_id) = log.local_id {
                    tx.delete(WORKOUT_LOGS, &Key::Int(local_id))?;
                }
            }
        }
        tx.delete(SPLITS, &Key::from(&split.id))?;
    }
    tx.delete(DIVISIONS, &Key::from(division_id))
}

fn drop_aliases(tx: &mut Transaction<'_>, remote_id: &str) -> fitsync_core::Result<()> {
    for alias in tx.query::<IdAlias>("remote_id", remote_id)? {
        tx.delete(ID_ALIASES, &Key::from(&alias.local_id))?;
    }
    Ok(())
}
