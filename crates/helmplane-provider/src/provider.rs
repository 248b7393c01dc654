//! The `Provider` trait — the fixed capability set every backend implements.

use async_trait::async_trait;

use crate::error::ProviderResult;
use crate::types::{CreateRequest, ProviderRef, ProviderStatus};

/// Unified interface for infrastructure operations.
///
/// Implementations must report failures through
/// [`ProviderError`](crate::ProviderError), distinguishing transient
/// infrastructure errors from terminal ones (e.g. an invalid spec).
#[async_trait]
pub trait Provider: Send + Sync {
    /// Stable name used to select this provider in instance specs.
    fn name(&self) -> &str;

    /// Create backend resources for an instance.
    async fn create(&self, req: CreateRequest) -> ProviderResult<ProviderRef>;

    /// Start a created or stopped resource.
    async fn start(&self, provider_ref: &ProviderRef) -> ProviderResult<()>;

    /// Gracefully stop a running resource.
    async fn stop(&self, provider_ref: &ProviderRef) -> ProviderResult<()>;

    /// Adjust the compute units behind the resource.
    async fn scale(&self, provider_ref: &ProviderRef, replicas: u32) -> ProviderResult<()>;

    /// Tear down all resources for the ref.
    async fn destroy(&self, provider_ref: &ProviderRef) -> ProviderResult<()>;

    /// Report current runtime status.
    async fn describe(&self, provider_ref: &ProviderRef) -> ProviderResult<ProviderStatus>;
}
