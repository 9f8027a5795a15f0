/// Store configuration for durability and checkpoint behavior
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// fsync the journal after every committed transaction
    pub sync_on_commit: bool,

    /// Number of journal frames after which the store writes a snapshot
    /// and resets the journal
    pub checkpoint_after_frames: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            sync_on_commit: true,
            checkpoint_after_frames: 1000,
        }
    }
}

impl StoreConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable fsync on commit
    pub fn with_sync_on_commit(mut self, enabled: bool) -> Self {
        self.sync_on_commit = enabled;
        self
    }

    /// Set the number of journal frames between automatic checkpoints
    pub fn with_checkpoint_after_frames(mut self, frames: usize) -> Self {
        self.checkpoint_after_frames = frames;
        self
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), String> {
        if self.checkpoint_after_frames == 0 {
            return Err("checkpoint_after_frames must be greater than 0".to_string());
        }

        Ok(())
    }
}
