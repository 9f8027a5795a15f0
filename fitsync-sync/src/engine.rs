/// Sync engine
///
/// Moves data from "locally pending" to "remote confirmed". One pass drains
/// the division queue, then submits every pending log as a single batch and
/// marks the batch synced in one local transaction. Passes are single-flight:
/// a trigger that arrives while a pass is running is coalesced into one
/// follow-up pass.

use fitsync_core::{
    is_local_id, IdAlias, Key, PendingDivisionCreate, Store, SyncState, WorkoutLog, DIVISIONS,
    ID_ALIASES, SPLITS, WORKOUT_LOGS,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::{
    config::SyncConfig,
    connectivity::{self, ConnectivityObserver},
    error::{Result, SyncError},
    queue::{Completion, PendingWriteQueue},
    remote::{NewDivision, NewSplit, RemoteStore, RemoteWorkoutLog},
    SyncStats,
};

const EVENT_CAPACITY: usize = 256;

/// Status shown to the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncStatus {
    /// Nothing is waiting for the remote store
    Synced,
    /// A pass is submitting data
    Syncing,
    /// Not connected, or the last pass could not reach the remote store
    Offline,
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncStatus::Synced => write!(f, "Synced"),
            SyncStatus::Syncing => write!(f, "Syncing"),
            SyncStatus::Offline => write!(f, "Offline"),
        }
    }
}

/// Sync events that can be observed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SyncEvent {
    StatusChanged {
        old: SyncStatus,
        new: SyncStatus,
    },
    PassStarted {
        pending_logs: usize,
        pending_divisions: usize,
    },
    /// A queued division now exists remotely
    DivisionCreated {
        local_id: String,
        remote_id: String,
    },
    LogsSynced {
        count: usize,
    },
    PassCompleted {
        report: PassReport,
    },
    /// A local commit failed; nothing from the pass after that point applied
    PassFailed {
        error: String,
    },
}

/// What one pass did
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PassReport {
    pub logs_synced: usize,
    /// Pending logs skipped because their split has no remote id yet
    pub logs_held_back: usize,
    pub divisions_created: usize,
    /// Queue entries that failed and stay queued
    pub divisions_pending: usize,
    /// Remote failures, each retried on a later pass
    pub errors: Vec<String>,
}

impl PassReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Result of a `sync_now` call
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    /// A pass ran, plus any follow-up passes coalesced into it
    Completed(PassReport),
    /// Another pass was in flight; this trigger will be served by a follow-up
    Coalesced,
    /// No connectivity, nothing attempted
    Offline,
}

struct Runner {
    shutdown_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

struct EngineInner {
    store: Arc<Store>,
    remote: Arc<dyn RemoteStore>,
    config: SyncConfig,
    divisions: PendingWriteQueue<PendingDivisionCreate>,
    status: watch::Sender<SyncStatus>,
    events: broadcast::Sender<SyncEvent>,
    stats: RwLock<SyncStats>,
    online: AtomicBool,
    in_flight: AtomicBool,
    rerun: AtomicBool,
    runner: Mutex<Option<Runner>>,
}

/// Clears the in-flight flag on every exit path, panics included
struct InFlight(Arc<EngineInner>);

impl InFlight {
    fn acquire(inner: &Arc<EngineInner>) -> Option<Self> {
        inner
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| InFlight(inner.clone()))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.in_flight.store(false, Ordering::Release);
    }
}

/// Handle to the sync engine; clones share one engine
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl SyncEngine {
    pub fn new(store: Arc<Store>, remote: Arc<dyn RemoteStore>, config: SyncConfig) -> Result<Self> {
        config.validate().map_err(SyncError::InvalidConfig)?;

        let (status, _) = watch::channel(SyncStatus::Synced);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Ok(Self {
            inner: Arc::new(EngineInner {
                divisions: PendingWriteQueue::new(store.clone()),
                store,
                remote,
                config,
                status,
                events,
                stats: RwLock::new(SyncStats::default()),
                online: AtomicBool::new(true),
                in_flight: AtomicBool::new(false),
                rerun: AtomicBool::new(false),
                runner: Mutex::new(None),
            }),
        })
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.inner.store
    }

    pub fn remote(&self) -> &Arc<dyn RemoteStore> {
        &self.inner.remote
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    /// Queue of divisions awaiting remote creation
    pub fn division_queue(&self) -> &PendingWriteQueue<PendingDivisionCreate> {
        &self.inner.divisions
    }

    pub fn status(&self) -> SyncStatus {
        *self.inner.status.borrow()
    }

    /// Follow status changes
    pub fn watch_status(&self) -> watch::Receiver<SyncStatus> {
        self.inner.status.subscribe()
    }

    /// Subscribe to sync events
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    pub fn stats(&self) -> SyncStats {
        self.inner.stats.read().clone()
    }

    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::Acquire)
    }

    /// Record connectivity. Going offline shows `Offline` immediately; coming
    /// back online does not start a pass by itself.
    pub fn set_online(&self, online: bool) {
        let was = self.inner.online.swap(online, Ordering::AcqRel);
        if was != online {
            tracing::info!(online, "connectivity changed");
        }
        if !online {
            self.inner.set_status(SyncStatus::Offline);
        }
    }

    /// Local logs still waiting for remote confirmation, oldest first
    pub fn pending_logs(&self) -> Result<Vec<WorkoutLog>> {
        self.inner.pending_logs()
    }

    /// Remote id that replaced a temporary id, once its division was created
    pub fn resolve_id(&self, id: &str) -> Result<Option<String>> {
        if !is_local_id(id) {
            return Ok(None);
        }
        let alias = self.inner.store.get::<IdAlias>(&Key::from(id))?;
        Ok(alias.map(|a| a.remote_id))
    }

    /// Run a sync pass now.
    ///
    /// The pass runs on its own task: if the caller stops waiting, a remote
    /// success is still recorded locally.
    pub async fn sync_now(&self) -> Result<SyncOutcome> {
        if !self.is_online() {
            self.inner.set_status(SyncStatus::Offline);
            return Ok(SyncOutcome::Offline);
        }

        let Some(flight) = InFlight::acquire(&self.inner) else {
            self.inner.rerun.store(true, Ordering::Release);
            self.inner.stats.write().coalesced_triggers += 1;
            tracing::debug!("sync pass in flight, coalescing trigger");
            return Ok(SyncOutcome::Coalesced);
        };

        let handle = tokio::spawn(run_passes(self.inner.clone(), flight));
        match handle.await {
            Ok(result) => result.map(SyncOutcome::Completed),
            Err(e) => Err(SyncError::TaskFailed(e.to_string())),
        }
    }

    /// Wait until no pass is running
    pub async fn wait_idle(&self) {
        let mut status = self.watch_status();
        while self.inner.in_flight.load(Ordering::Acquire) {
            // Passes end with a status update; the timeout covers a release
            // that lands after it
            let _ = tokio::time::timeout(Duration::from_millis(50), status.changed()).await;
        }
    }

    /// Start a pass in the background if online. Outside a Tokio runtime the
    /// request is left to the next trigger.
    pub fn request_sync(&self) {
        if !self.is_online() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::debug!("no async runtime, sync deferred to next trigger");
            return;
        };

        let engine = self.clone();
        runtime.spawn(async move {
            if let Err(e) = engine.sync_now().await {
                tracing::warn!(error = %e, "background sync failed");
            }
        });
    }

    /// Start syncing on connectivity changes and on the configured interval
    pub async fn start(&self, observer: &ConnectivityObserver) -> Result<()> {
        let mut runner = self.inner.runner.lock();
        if runner.is_some() {
            return Err(SyncError::InvalidConfig(
                "sync engine already started".to_string(),
            ));
        }

        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let handle = tokio::spawn(connectivity::observe(
            self.clone(),
            observer.subscribe(),
            self.inner.config.sync_interval,
            shutdown_rx,
        ));
        *runner = Some(Runner {
            shutdown_tx,
            handle,
        });

        tracing::info!(
            interval_secs = self.inner.config.sync_interval.as_secs(),
            "sync engine started"
        );
        Ok(())
    }

    /// Stop the background loop. A pass already running finishes on its own.
    pub async fn stop(&self) -> Result<()> {
        let runner = self.inner.runner.lock().take();
        if let Some(runner) = runner {
            let _ = runner.shutdown_tx.send(()).await;
            runner
                .handle
                .await
                .map_err(|e| SyncError::TaskFailed(e.to_string()))?;
            tracing::info!("sync engine stopped");
        }
        Ok(())
    }
}

/// Run passes until no trigger was coalesced during the last one
async fn run_passes(inner: Arc<EngineInner>, mut flight: InFlight) -> Result<PassReport> {
    loop {
        let result = loop {
            inner.rerun.store(false, Ordering::Release);
            let result = inner.run_pass().await;
            if !inner.rerun.load(Ordering::Acquire) || !inner.is_online() {
                break result;
            }
            tracing::debug!("running coalesced follow-up pass");
        };
        drop(flight);

        // A trigger may have been coalesced between the last check and the release
        if inner.rerun.load(Ordering::Acquire) && inner.is_online() {
            if let Some(next) = InFlight::acquire(&inner) {
                flight = next;
                continue;
            }
        }
        return result;
    }
}

impl EngineInner {
    fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    fn set_status(&self, new: SyncStatus) {
        let old = self.status.send_replace(new);
        if old != new {
            tracing::debug!(%old, %new, "sync status changed");
            self.emit(SyncEvent::StatusChanged { old, new });
        }
    }

    fn emit(&self, event: SyncEvent) {
        let _ = self.events.send(event);
    }

    fn pending_logs(&self) -> Result<Vec<WorkoutLog>> {
        Ok(self
            .store
            .query::<WorkoutLog>()
            .eq("sync_state", SyncState::Pending)
            .fetch()?)
    }

    async fn run_pass(&self) -> Result<PassReport> {
        let result = self.pass().await;

        {
            let mut stats = self.stats.write();
            stats.total_passes += 1;
            match &result {
                Ok(report) => {
                    stats.logs_synced += report.logs_synced as u64;
                    stats.divisions_created += report.divisions_created as u64;
                    if report.is_clean() {
                        stats.successful_passes += 1;
                        stats.last_sync_time = Some(chrono::Utc::now().timestamp_millis());
                    } else {
                        stats.failed_passes += 1;
                        stats.last_error = report.errors.last().cloned();
                    }
                }
                Err(e) => {
                    stats.failed_passes += 1;
                    stats.last_error = Some(e.to_string());
                }
            }
        }

        match &result {
            Ok(report) => {
                tracing::info!(
                    logs_synced = report.logs_synced,
                    logs_held_back = report.logs_held_back,
                    divisions_created = report.divisions_created,
                    failures = report.errors.len(),
                    "sync pass finished"
                );
                self.emit(SyncEvent::PassCompleted {
                    report: report.clone(),
                });
            }
            Err(e) => {
                tracing::error!(error = %e, "sync pass aborted");
                self.set_status(SyncStatus::Offline);
                self.emit(SyncEvent::PassFailed {
                    error: e.to_string(),
                });
            }
        }

        result
    }

    async fn pass(&self) -> Result<PassReport> {
        let pending_logs = self.pending_logs()?.len();
        let pending_divisions = self.divisions.len()?;

        if pending_logs == 0 && pending_divisions == 0 {
            self.set_status(SyncStatus::Synced);
            return Ok(PassReport::default());
        }

        self.set_status(SyncStatus::Syncing);
        self.emit(SyncEvent::PassStarted {
            pending_logs,
            pending_divisions,
        });

        let mut report = PassReport::default();

        // Divisions first, so logs on their splits can go out in this pass
        if pending_divisions > 0 {
            let drained = self
                .divisions
                .drain(|entry| self.create_division(entry))
                .await?;
            report.divisions_created = drained.succeeded;
            report.divisions_pending = drained.failed;
            report.errors.extend(drained.errors);
        }

        self.sync_logs(&mut report).await?;

        // Held-back logs are still waiting for the remote store
        self.set_status(if report.is_clean() && report.logs_held_back == 0 {
            SyncStatus::Synced
        } else {
            SyncStatus::Offline
        });
        Ok(report)
    }

    /// Create one queued division remotely. The returned completion swaps the
    /// temporary rows for the remote ones, records an alias for each temporary
    /// id and re-points logs on the temporary splits.
    async fn create_division(&self, entry: PendingDivisionCreate) -> Result<Completion> {
        let division = self
            .remote
            .insert_division(&NewDivision::from(&entry.division))
            .await?;

        let payload: Vec<NewSplit> = entry
            .splits
            .iter()
            .map(|split| NewSplit::for_division(split, &division.id))
            .collect();

        let splits = match self.remote.insert_splits(&payload).await {
            Ok(splits) => splits,
            Err(e) => {
                // Retry recreates the whole division; drop the half-created one
                if let Err(cleanup) = self.remote.delete_division(&division.id).await {
                    tracing::warn!(
                        remote_id = %division.id,
                        error = %cleanup,
                        "could not remove partially created division"
                    );
                }
                return Err(e.into());
            }
        };

        let aliases = entry.aliases_to(&division.id, &splits);

        tracing::debug!(
            local_id = %entry.id,
            remote_id = %division.id,
            splits = splits.len(),
            "division created remotely"
        );
        self.emit(SyncEvent::DivisionCreated {
            local_id: entry.id.clone(),
            remote_id: division.id.clone(),
        });

        let local_division = Key::from(&entry.division.id);
        Ok(Completion::new(
            &[DIVISIONS, SPLITS, WORKOUT_LOGS, ID_ALIASES],
            move |tx| {
                tx.delete(DIVISIONS, &local_division)?;
                for alias in aliases.iter().filter(|a| a.table == SPLITS) {
                    tx.delete(SPLITS, &Key::from(&alias.local_id))?;
                }

                tx.put(&division)?;
                for split in &splits {
                    tx.put(split)?;
                }

                for alias in &aliases {
                    tx.put(alias)?;
                    if alias.table != SPLITS {
                        continue;
                    }
                    for mut log in tx.query::<WorkoutLog>("split_id", alias.local_id.as_str())? {
                        log.split_id = alias.remote_id.clone();
                        tx.put(&log)?;
                    }
                }
                Ok(())
            },
        ))
    }

    /// Re-point pending logs that still name a temporary split whose division
    /// has since been created remotely. Such logs are written after the
    /// division's completion ran, by callers holding the temporary id.
    fn resolve_aliased_splits(&self) -> Result<usize> {
        let resolved = self
            .store
            .transaction(&[WORKOUT_LOGS, ID_ALIASES], |tx| {
                let mut resolved = 0;
                for mut log in tx.query::<WorkoutLog>("sync_state", SyncState::Pending)? {
                    if !is_local_id(&log.split_id) {
                        continue;
                    }
                    if let Some(alias) = tx.get::<IdAlias>(&Key::from(&log.split_id))? {
                        log.split_id = alias.remote_id;
                        tx.put(&log)?;
                        resolved += 1;
                    }
                }
                Ok(resolved)
            })?;
        if resolved > 0 {
            tracing::debug!(count = resolved, "re-pointed logs on replaced splits");
        }
        Ok(resolved)
    }

    async fn sync_logs(&self, report: &mut PassReport) -> Result<()> {
        self.resolve_aliased_splits()?;

        let (held, batch): (Vec<WorkoutLog>, Vec<WorkoutLog>) = self
            .pending_logs()?
            .into_iter()
            .partition(|log| is_local_id(&log.split_id));

        report.logs_held_back = held.len();
        if !held.is_empty() {
            tracing::debug!(
                count = held.len(),
                "holding back logs on splits without a remote id"
            );
        }
        if batch.is_empty() {
            return Ok(());
        }

        let rows: Vec<RemoteWorkoutLog> = batch
            .iter()
            .map(|log| RemoteWorkoutLog::from_log(log, self.config.send_client_ref))
            .collect();

        if let Err(e) = self.remote.insert_workout_logs(&rows).await {
            tracing::warn!(batch = rows.len(), error = %e, "log batch rejected, will retry");
            report.errors.push(e.to_string());
            return Ok(());
        }

        let local_ids: Vec<u64> = batch.iter().filter_map(|log| log.local_id).collect();
        let marked = self
            .store
            .transaction(&[WORKOUT_LOGS], |tx| {
                let mut marked = 0;
                for id in &local_ids {
                    if let Some(mut log) = tx.get::<WorkoutLog>(&Key::Int(*id))? {
                        if log.is_pending() {
                            log.sync_state = SyncState::Synced;
                            tx.put(&log)?;
                            marked += 1;
                        }
                    }
                }
                Ok(marked)
            })
            .map_err(|e| {
                tracing::error!(
                    batch = local_ids.len(),
                    error = %e,
                    "log batch accepted remotely but could not be marked synced"
                );
                SyncError::Store(e)
            })?;

        report.logs_synced = marked;
        self.emit(SyncEvent::LogsSynced { count: marked });
        Ok(())
    }
}
