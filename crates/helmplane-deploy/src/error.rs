//! Deployment error types.

use thiserror::Error;

use helmplane_lifecycle::LifecycleError;
use helmplane_state::StateError;

/// Result type alias for deployment operations.
pub type DeployResult<T> = Result<T, DeployError>;

/// Errors surfaced by deployment orchestration.
#[derive(Debug, Error)]
pub enum DeployError {
    #[error("validation: {0}")]
    Validation(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("deployment not found: {0}")]
    NotFound(String),

    #[error("health gate failed: {0}")]
    GateFailed(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("traffic routing failed: {0}")]
    Routing(String),

    #[error("lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),

    #[error("state store error: {0}")]
    State(StateError),
}

impl From<StateError> for DeployError {
    fn from(err: StateError) -> Self {
        match err {
            StateError::Conflict(msg) => DeployError::Conflict(msg),
            StateError::NotFound(msg) => DeployError::NotFound(msg),
            other => DeployError::State(other),
        }
    }
}

impl DeployError {
    /// Whether this error should leave the deployment resumable
    /// instead of triggering rollback. Cancellation preserves the
    /// last durably-recorded cursor.
    pub fn preserves_progress(&self) -> bool {
        matches!(self, DeployError::Cancelled(_))
    }
}
