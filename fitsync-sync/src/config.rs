use std::time::Duration;

/// Sync configuration
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Identity used for remote inserts and owner-filtered reads
    pub owner_id: String,

    /// Period of the background sync timer while online
    pub sync_interval: Duration,

    /// Attach each log's `client_ref` to remote inserts
    pub send_client_ref: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            owner_id: String::new(),
            sync_interval: Duration::from_secs(30),
            send_client_ref: false,
        }
    }
}

impl SyncConfig {
    pub fn new(owner_id: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            ..Self::default()
        }
    }

    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    pub fn with_client_ref(mut self, enabled: bool) -> Self {
        self.send_client_ref = enabled;
        self
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), String> {
        if self.owner_id.trim().is_empty() {
            return Err("owner_id must not be empty".to_string());
        }

        if self.sync_interval.is_zero() {
            return Err("sync_interval must be greater than 0".to_string());
        }

        Ok(())
    }
}
