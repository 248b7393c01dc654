//! Request and status types exchanged with providers.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use helmplane_state::ResourceSpec;

/// Opaque handle to a backend resource, returned by create and passed
/// to every subsequent operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProviderRef(pub String);

impl ProviderRef {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ProviderRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// What to create for an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateRequest {
    pub instance_id: String,
    pub tenant_id: String,
    pub service: String,
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub resources: ResourceSpec,
    pub replicas: u32,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

/// Current runtime status of a backend resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderStatus {
    /// Whether the workload is up and accepting work.
    pub ready: bool,
    /// Restart count since creation.
    pub restarts: u32,
    /// Backend-specific detail, surfaced to operators on failure.
    pub message: Option<String>,
}
