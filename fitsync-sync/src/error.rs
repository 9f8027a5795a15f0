use thiserror::Error;

/// Failure talking to the remote store. The sync engine treats every variant
/// as "retry later".
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RemoteError {
    #[error("remote store unreachable: {0}")]
    Unreachable(String),

    #[error("remote store rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("could not decode remote response: {0}")]
    Decode(String),

    #[error("remote row not found: {0}")]
    NotFound(String),
}

impl RemoteError {
    pub fn code(&self) -> &'static str {
        match self {
            RemoteError::Unreachable(_) => "REMOTE_UNREACHABLE",
            RemoteError::Rejected { .. } => "REMOTE_REJECTED",
            RemoteError::Decode(_) => "REMOTE_DECODE",
            RemoteError::NotFound(_) => "REMOTE_NOT_FOUND",
        }
    }
}

impl From<serde_json::Error> for RemoteError {
    fn from(e: serde_json::Error) -> Self {
        RemoteError::Decode(e.to_string())
    }
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("local store: {0}")]
    Store(#[from] fitsync_core::Error),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("operation requires connectivity")]
    Offline,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("sync task failed: {0}")]
    TaskFailed(String),
}

impl SyncError {
    pub fn code(&self) -> &'static str {
        match self {
            SyncError::Store(e) => e.code(),
            SyncError::Remote(e) => e.code(),
            SyncError::Offline => "OFFLINE",
            SyncError::InvalidConfig(_) => "INVALID_CONFIG",
            SyncError::TaskFailed(_) => "TASK_FAILED",
        }
    }

    /// True when a later attempt may succeed without any change on our side
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Store(e) => e.is_retryable(),
            SyncError::Remote(_) | SyncError::Offline => true,
            SyncError::InvalidConfig(_) | SyncError::TaskFailed(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
