//! Domain types persisted by the helmplane state store.
//!
//! These are the records the rest of the workspace operates on:
//! tenants with quotas, instances with their lifecycle state and
//! generation counter, deployments with strategy and batch cursor,
//! per-instance health records, and audit entries.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Unique identifier for a tenant.
pub type TenantId = String;

/// Unique identifier for an instance.
pub type InstanceId = String;

/// Unique identifier for a deployment.
pub type DeploymentId = String;

// ── Tenant ─────────────────────────────────────────────────────────

/// Lifecycle status of a tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TenantStatus {
    Active,
    Suspended,
    Deleted,
}

/// Resource limits per tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quota {
    pub max_instances: u32,
    pub max_concurrent_deploys: u32,
    pub max_memory_mb: u64,
    pub max_cpu_millis: u64,
}

impl Default for Quota {
    fn default() -> Self {
        Self {
            max_instances: 20,
            max_concurrent_deploys: 2,
            max_memory_mb: 16 * 1024,
            max_cpu_millis: 16_000,
        }
    }
}

/// A tenant — the isolation boundary scoping every other record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: TenantId,
    pub name: String,
    pub slug: String,
    pub status: TenantStatus,
    pub plan: String,
    pub quota: Quota,
    pub created_at: u64,
    pub updated_at: u64,
}

// ── Instance ───────────────────────────────────────────────────────

/// Lifecycle state of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Pending,
    Provisioning,
    Starting,
    Running,
    Degraded,
    Stopping,
    Stopped,
    Scaling,
    Destroying,
    Destroyed,
    Failed,
}

impl LifecycleState {
    /// Whether the state machine can never leave this state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleState::Destroyed)
    }

    /// Whether an instance in this state counts against the tenant's
    /// instance quota.
    pub fn counts_against_quota(&self) -> bool {
        !matches!(self, LifecycleState::Destroyed | LifecycleState::Failed)
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LifecycleState::Pending => "pending",
            LifecycleState::Provisioning => "provisioning",
            LifecycleState::Starting => "starting",
            LifecycleState::Running => "running",
            LifecycleState::Degraded => "degraded",
            LifecycleState::Stopping => "stopping",
            LifecycleState::Stopped => "stopped",
            LifecycleState::Scaling => "scaling",
            LifecycleState::Destroying => "destroying",
            LifecycleState::Destroyed => "destroyed",
            LifecycleState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Health status as determined by health probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Unknown,
    Healthy,
    Unhealthy,
    Recovering,
}

/// Per-instance resource allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub cpu_millis: u64,
    pub memory_mb: u64,
}

impl Default for ResourceSpec {
    fn default() -> Self {
        Self {
            cpu_millis: 500,
            memory_mb: 256,
        }
    }
}

/// Desired specification of an instance's workload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSpec {
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub resources: ResourceSpec,
    /// Compute units behind this instance's provider ref.
    #[serde(default = "default_replicas")]
    pub replicas: u32,
}

fn default_replicas() -> u32 {
    1
}

/// A deployed unit of tenant workload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: InstanceId,
    pub tenant_id: TenantId,
    /// Logical service this instance belongs to.
    pub service: String,
    pub provider_name: String,
    /// Backend handle, set once provisioning succeeds.
    pub provider_ref: Option<String>,
    pub spec: InstanceSpec,
    pub state: LifecycleState,
    pub health: HealthStatus,
    /// Strictly increasing; bumped on every spec change.
    pub generation: u64,
    /// Fingerprint of the last applied intent, for idempotent replays.
    pub last_intent: Option<String>,
    /// Generation the last intent was applied against.
    pub last_intent_generation: u64,
    /// Failure detail when the instance enters `Failed`.
    pub status_message: Option<String>,
    /// When the instance entered `Degraded`, if it is degraded.
    pub degraded_since: Option<u64>,
    /// When the instance reached `Destroyed`, for retention GC.
    pub destroyed_at: Option<u64>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Instance {
    /// Build the composite key for the instances table.
    pub fn table_key(&self) -> String {
        format!("{}/{}", self.tenant_id, self.id)
    }
}

// ── Deployment ─────────────────────────────────────────────────────

/// Lifecycle state of a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentState {
    Pending,
    InProgress,
    Succeeded,
    Failed,
    RolledBack,
}

impl DeploymentState {
    /// Whether this deployment still occupies the per-service slot.
    pub fn is_active(&self) -> bool {
        matches!(self, DeploymentState::Pending | DeploymentState::InProgress)
    }
}

/// Strategy selection with per-strategy parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StrategyConfig {
    /// Replace instances in batches, gated on health between batches.
    Rolling {
        batch_size: u32,
    },
    /// Provision a full parallel set, switch traffic, destroy the old set.
    BlueGreen,
    /// Provision a fraction, observe, then promote or roll back.
    Canary {
        /// Percentage of target instances provisioned as canaries (1-100).
        percent: u32,
        /// Router-reported error rate above which the canary is rejected.
        error_rate_threshold: f64,
    },
    /// Destroy everything, then create the new generation. No
    /// availability guarantee during the gap.
    Recreate,
}

/// A tracked transition of a service from one generation to the next.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    pub id: DeploymentId,
    pub tenant_id: TenantId,
    pub service: String,
    /// Provider new-generation instances are created on.
    pub provider_name: String,
    pub strategy: StrategyConfig,
    pub state: DeploymentState,
    pub from_generation: u64,
    pub to_generation: u64,
    /// The spec instances are moved to.
    pub target_spec: InstanceSpec,
    /// Desired instance count at the new generation.
    pub target_count: u32,
    /// Batches fully completed; resume restarts after this cursor.
    pub completed_batches: u32,
    /// New-generation instances created so far, in creation order.
    pub new_instance_ids: Vec<InstanceId>,
    /// Failure or rollback reason, when there is one.
    pub reason: Option<String>,
    pub started_at: Option<u64>,
    pub finished_at: Option<u64>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Deployment {
    /// Build the composite key for the deployments table.
    pub fn table_key(&self) -> String {
        format!("{}/{}", self.tenant_id, self.id)
    }
}

// ── Health record ──────────────────────────────────────────────────

/// Last-known health of an instance, superseded on each probe.
///
/// `recent_flips` is a bounded ring of flip timestamps used for flap
/// detection; it is the only history retained.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthRecord {
    pub instance_id: InstanceId,
    pub tenant_id: TenantId,
    pub status: HealthStatus,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    /// Latency of the last probe in milliseconds.
    pub latency_ms: Option<u64>,
    /// Probe detail (status code, exit code, error text).
    pub detail: Option<String>,
    pub checked_at: u64,
    /// Timestamps of recent status flips, newest last.
    pub recent_flips: Vec<u64>,
}

impl HealthRecord {
    /// Build the composite key for the health table.
    pub fn table_key(&self) -> String {
        format!("{}/{}", self.tenant_id, self.instance_id)
    }

    /// Record a status flip, keeping at most `ring_size` entries.
    pub fn push_flip(&mut self, at: u64, ring_size: usize) {
        self.recent_flips.push(at);
        if self.recent_flips.len() > ring_size {
            let excess = self.recent_flips.len() - ring_size;
            self.recent_flips.drain(..excess);
        }
    }

    /// Number of flips observed within the trailing window.
    pub fn flips_within(&self, window_secs: u64, now: u64) -> usize {
        let cutoff = now.saturating_sub(window_secs);
        self.recent_flips.iter().filter(|t| **t >= cutoff).count()
    }
}

// ── Audit ──────────────────────────────────────────────────────────

/// A recorded control-plane action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: String,
    pub tenant_id: TenantId,
    pub actor: String,
    /// Resource kind: "instance", "deployment", "tenant".
    pub resource: String,
    pub resource_id: String,
    pub action: String,
    #[serde(default)]
    pub details: HashMap<String, String>,
    pub created_at: u64,
}

impl AuditEntry {
    /// Build the composite key for the audit table.
    pub fn table_key(&self) -> String {
        format!("{}/{}", self.tenant_id, self.id)
    }
}
