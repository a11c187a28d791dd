//! Shared error and result types for Gantry
//!
//! Every RPC boundary converts transport-level failures into one of the
//! typed kinds below before they reach a caller. Raw I/O or JSON errors
//! never leak past a component boundary.

use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, GantryError>;

/// Error kinds surfaced to callers
#[derive(Debug, Error)]
pub enum GantryError {
    /// Model could not be loaded into a worker
    #[error("Model load failed: {0}")]
    ModelLoad(String),

    /// Generation request failed
    #[error("Generation failed: {0}")]
    Generation(String),

    /// Operation exceeded its deadline
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Worker runtime reported an error or died
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// Circuit breaker rejected the call
    #[error("Circuit open: retry after {retry_after_ms}ms")]
    CircuitOpen {
        /// Hint for when the caller may retry
        retry_after_ms: u64,
    },

    /// Invalid input (template, config, request shape)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Requested entity does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Operation was cancelled by the caller
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Pool has no capacity and the waiter timed out
    #[error("Pool exhausted: {0}")]
    PoolExhausted(String),

    /// Component is shutting down; pending waiters are failed with this
    #[error("Shutting down: {0}")]
    Shutdown(String),

    /// Message bus failure
    #[error("Bus error: {0}")]
    Bus(String),

    /// Internal invariant violation or unclassified failure
    #[error("Internal error: {0}")]
    Internal(String),

    /// Filesystem failure (artifact cache, prompt cache persistence)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization failure
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl GantryError {
    /// True for error kinds a caller may reasonably retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GantryError::Timeout(_)
                | GantryError::CircuitOpen { .. }
                | GantryError::PoolExhausted(_)
        )
    }
}
