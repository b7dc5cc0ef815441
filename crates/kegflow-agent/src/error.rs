//! # Agent Error Types
//!
//! One error type at the orchestration seam, wrapping each crate's errors.
//!
//! ## Taxonomy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Agent Error Categories                            │
//! │                                                                         │
//! │  Token(TokenError)   authorization rejections; surfaced to the caller, │
//! │                      never mutate actuator state                       │
//! │  Busy                dispense requested while one is running; no state │
//! │                      change                                            │
//! │  Hal(HalError)       binding construction/initialization failures      │
//! │  Database(DbError)   store failures on the request path (NOT the       │
//! │                      post-pour persist - that is fail-open, flagged    │
//! │                      on the outcome instead)                           │
//! │  Sync(SyncError)     sync service construction failures                │
//! │  Config(String)      invalid configuration at startup                  │
//! │                                                                         │
//! │  Safety interruptions (timeout, empty keg, cancel) are NOT errors -    │
//! │  they are expected operational outcomes and come back as               │
//! │  DispenseOutcome { status: Interrupted, .. }.                          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

use kegflow_core::TokenError;
use kegflow_db::DbError;
use kegflow_hal::HalError;
use kegflow_sync::SyncError;

/// Errors surfaced by the agent layer.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Token rejected; the reason says why.
    #[error("Authorization rejected: {0}")]
    Token(#[from] TokenError),

    /// A dispense is already in progress.
    #[error("Dispenser is busy")]
    Busy,

    /// Hardware layer failure.
    #[error("Hardware error: {0}")]
    Hal(#[from] HalError),

    /// Durable store failure on the request path.
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    /// Sync service failure.
    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl AgentError {
    /// True for rejections of the request itself (token/busy), as opposed
    /// to faults in the machine.
    pub fn is_rejection(&self) -> bool {
        matches!(self, AgentError::Token(_) | AgentError::Busy)
    }
}

/// Result type for agent operations.
pub type AgentResult<T> = Result<T, AgentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_classification() {
        assert!(AgentError::Busy.is_rejection());
        assert!(AgentError::Token(TokenError::BadSignature).is_rejection());
        assert!(!AgentError::Config("bad".into()).is_rejection());
    }

    #[test]
    fn test_token_error_wraps() {
        let err: AgentError = TokenError::BadSignature.into();
        assert!(err.to_string().contains("Authorization rejected"));
    }
}
