//! Lifecycle error types.

use thiserror::Error;

use helmplane_state::{LifecycleState, StateError};

/// Result type alias for lifecycle operations.
pub type LifecycleResult<T> = Result<T, LifecycleError>;

/// Errors surfaced by lifecycle operations.
///
/// Transient provider failures are retried internally and only appear
/// here once the retry budget is exhausted.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("validation: {0}")]
    Validation(String),

    #[error("invalid transition from {from} to {to}")]
    InvalidTransition {
        from: LifecycleState,
        to: LifecycleState,
    },

    #[error("instance not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("provider failed after retries: {0}")]
    ProviderTransient(String),

    #[error("provider terminal failure: {0}")]
    ProviderTerminal(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("state store error: {0}")]
    State(StateError),
}

impl From<StateError> for LifecycleError {
    fn from(err: StateError) -> Self {
        match err {
            StateError::Conflict(msg) => LifecycleError::Conflict(msg),
            StateError::NotFound(msg) => LifecycleError::NotFound(msg),
            other => LifecycleError::State(other),
        }
    }
}
