//! Provider error types.

use thiserror::Error;

/// Result type alias for provider operations.
pub type ProviderResult<T> = Result<T, ProviderError>;

/// Errors reported by infrastructure providers.
///
/// The transient/terminal split drives the lifecycle manager's retry
/// policy: transient failures are retried with backoff, terminal ones
/// move the instance to `Failed` immediately.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    /// Temporary infrastructure failure; safe to retry.
    #[error("transient provider error: {0}")]
    Transient(String),

    /// Permanent failure (invalid spec, unsupported operation); never retried.
    #[error("terminal provider error: {0}")]
    Terminal(String),

    /// The provider has no resource for the given ref.
    #[error("provider ref not found: {0}")]
    NotFound(String),

    /// The named provider is not registered.
    #[error("provider not registered: {0}")]
    UnknownProvider(String),
}

impl ProviderError {
    /// Whether the lifecycle manager should retry this failure.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProviderError::Transient(_))
    }
}
