//! Hardware abstraction error types.

use thiserror::Error;

/// Errors from the flow/actuator layer.
#[derive(Debug, Error)]
pub enum HalError {
    /// Binding initialization failed (pin claim, interrupt arming).
    #[error("Hardware initialization failed: {0}")]
    InitFailed(String),

    /// Operation needs `initialize()` first.
    #[error("Hardware not initialized")]
    NotInitialized,

    /// The requested binding is not compiled into this build.
    #[error("Unsupported binding: {0}")]
    Unsupported(String),

    /// Underlying GPIO driver error.
    #[error("GPIO error: {0}")]
    Gpio(String),
}

/// Result type for hardware operations.
pub type HalResult<T> = Result<T, HalError>;
