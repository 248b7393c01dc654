//! helmplane-provider — infrastructure backends behind one trait.
//!
//! Each target platform (container runtime, cluster scheduler, cloud
//! API) implements [`Provider`]. The control plane only ever talks to
//! the trait; concrete backends are selected by name through a
//! [`ProviderRegistry`] built once at startup.
//!
//! Failures are split into retryable ([`ProviderError::Transient`])
//! and non-retryable ([`ProviderError::Terminal`]) so the lifecycle
//! manager can decide between backoff and escalation.

pub mod error;
pub mod mock;
pub mod provider;
pub mod registry;
pub mod types;

pub use error::{ProviderError, ProviderResult};
pub use mock::MockProvider;
pub use provider::Provider;
pub use registry::ProviderRegistry;
pub use types::{CreateRequest, ProviderRef, ProviderStatus};
