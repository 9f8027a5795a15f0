/// Offline-first sync for fitsync
///
/// Every user action commits to the local store first. The sync engine later
/// moves pending logs and queued division creations to the remote store,
/// driven by the connectivity observer. Reads render from the local store and
/// are refreshed from the remote store in the background.

pub mod actions;
pub mod cache;
pub mod config;
pub mod connectivity;
pub mod engine;
pub mod error;
pub mod queue;
pub mod remote;

pub use actions::{DivisionCreated, DivisionDraft, FitnessTracker};
pub use cache::{CacheQuery, Cached, Loaded, ReadThroughLoader};
pub use config::SyncConfig;
pub use connectivity::{ConnectivityObserver, Trigger};
pub use engine::{PassReport, SyncEngine, SyncEvent, SyncOutcome, SyncStatus};
pub use error::{RemoteError, Result, SyncError};
pub use queue::{Completion, DrainReport, PendingWriteQueue, Queued};
pub use remote::{MemoryRemote, RemoteQuery, RemoteStore, RemoteWorkoutLog};

#[cfg(feature = "http")]
pub use remote::HttpRemote;

use fitsync_core::Store;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Sync statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncStats {
    pub total_passes: u64,
    pub successful_passes: u64,
    pub failed_passes: u64,
    /// Triggers folded into a running pass
    pub coalesced_triggers: u64,
    pub logs_synced: u64,
    pub divisions_created: u64,
    /// Unix millis of the last clean pass
    pub last_sync_time: Option<i64>,
    pub last_error: Option<String>,
}

/// Builder for a sync engine
pub struct SyncEngineBuilder {
    store: Option<Arc<Store>>,
    remote: Option<Arc<dyn RemoteStore>>,
    owner_id: Option<String>,
    sync_interval: Duration,
    send_client_ref: bool,
}

impl SyncEngineBuilder {
    pub fn new() -> Self {
        Self {
            store: None,
            remote: None,
            owner_id: None,
            sync_interval: Duration::from_secs(30),
            send_client_ref: false,
        }
    }

    pub fn with_store(mut self, store: Arc<Store>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_remote(mut self, remote: Arc<dyn RemoteStore>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn with_owner(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = Some(owner_id.into());
        self
    }

    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    /// Send each log's client reference so the remote store can drop
    /// duplicate submissions
    pub fn with_client_ref(mut self, enabled: bool) -> Self {
        self.send_client_ref = enabled;
        self
    }

    pub fn build(self) -> Result<SyncEngine> {
        let store = self
            .store
            .ok_or_else(|| SyncError::InvalidConfig("local store is required".to_string()))?;
        let remote = self
            .remote
            .ok_or_else(|| SyncError::InvalidConfig("remote store is required".to_string()))?;
        let owner_id = self
            .owner_id
            .ok_or_else(|| SyncError::InvalidConfig("owner id is required".to_string()))?;

        let config = SyncConfig::new(owner_id)
            .with_sync_interval(self.sync_interval)
            .with_client_ref(self.send_client_ref);

        SyncEngine::new(store, remote, config)
    }
}

impl Default for SyncEngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}
