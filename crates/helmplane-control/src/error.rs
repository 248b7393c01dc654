//! Control plane error types.

use thiserror::Error;

use helmplane_deploy::DeployError;
use helmplane_lifecycle::LifecycleError;
use helmplane_state::StateError;

/// Result type alias for facade operations.
pub type ControlResult<T> = Result<T, ControlError>;

/// Errors surfaced to control plane callers.
///
/// Every rejected intent maps to a specific kind; callers never see a
/// generic failure.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("validation: {0}")]
    Validation(String),

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("tenant suspended: {0}")]
    TenantSuspended(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error(transparent)]
    Deploy(#[from] DeployError),

    #[error("state store error: {0}")]
    State(StateError),
}

impl From<StateError> for ControlError {
    fn from(err: StateError) -> Self {
        match err {
            StateError::Conflict(msg) => ControlError::Conflict(msg),
            StateError::NotFound(msg) => ControlError::NotFound(msg),
            other => ControlError::State(other),
        }
    }
}
