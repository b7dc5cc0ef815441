//! Sync error types.

use thiserror::Error;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Sync failures.
///
/// Per-record push failures are NOT errors here - they are recorded on the
/// row (`failed` + attempt count) and retried. This type covers the
/// failures that stop a whole operation: bad configuration and store
/// access.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Invalid sync configuration (URL, API key header, intervals).
    #[error("Invalid sync configuration: {0}")]
    InvalidConfig(String),

    /// Local store access failed.
    #[error("Database error: {0}")]
    Database(String),

    /// The background loop is already running / already stopped.
    #[error("Sync service {0}")]
    InvalidState(&'static str),
}

impl From<kegflow_db::DbError> for SyncError {
    fn from(err: kegflow_db::DbError) -> Self {
        SyncError::Database(err.to_string())
    }
}
