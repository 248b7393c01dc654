//! The event envelope and subscription filters.

use serde::{Deserialize, Serialize};

use helmplane_core::{epoch_secs, new_id, IdPrefix};

/// Well-known event type names. Types are dotted strings so filters
/// can match on a prefix (`"instance."` matches every instance event).
pub mod types {
    pub const INSTANCE_CREATED: &str = "instance.created";
    pub const INSTANCE_STARTED: &str = "instance.started";
    pub const INSTANCE_STOPPED: &str = "instance.stopped";
    pub const INSTANCE_SCALED: &str = "instance.scaled";
    pub const INSTANCE_DEGRADED: &str = "instance.degraded";
    pub const INSTANCE_RECOVERED: &str = "instance.recovered";
    pub const INSTANCE_FAILED: &str = "instance.failed";
    pub const INSTANCE_DESTROYED: &str = "instance.destroyed";
    pub const INSTANCE_TRANSITION: &str = "instance.transition";

    pub const DEPLOY_STARTED: &str = "deploy.started";
    pub const DEPLOY_BATCH_COMPLETED: &str = "deploy.batch_completed";
    pub const DEPLOY_SUCCEEDED: &str = "deploy.succeeded";
    pub const DEPLOY_FAILED: &str = "deploy.failed";
    pub const DEPLOY_ROLLED_BACK: &str = "deploy.rolled_back";

    pub const HEALTH_CHANGED: &str = "health.changed";

    pub const TENANT_CREATED: &str = "tenant.created";
    pub const TENANT_SUSPENDED: &str = "tenant.suspended";
    pub const QUOTA_EXCEEDED: &str = "quota.exceeded";
}

/// Kind of entity an event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Instance,
    Deployment,
    Tenant,
}

/// An immutable fact describing a state transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    /// Dotted type name, e.g. `instance.started`.
    pub event_type: String,
    pub tenant_id: String,
    pub entity_kind: EntityKind,
    pub entity_id: String,
    pub prior_state: Option<String>,
    pub new_state: Option<String>,
    /// Causal reason for the transition (intent, probe flip, rollback).
    pub reason: Option<String>,
    /// Bus-assigned monotonic sequence number, 0 until published.
    pub sequence: u64,
    pub timestamp: u64,
}

impl Event {
    /// Build an event with a fresh id and timestamp. The sequence
    /// number is assigned by the bus at publish time.
    pub fn new(
        event_type: &str,
        tenant_id: &str,
        entity_kind: EntityKind,
        entity_id: &str,
    ) -> Self {
        Self {
            id: new_id(IdPrefix::Event),
            event_type: event_type.to_string(),
            tenant_id: tenant_id.to_string(),
            entity_kind,
            entity_id: entity_id.to_string(),
            prior_state: None,
            new_state: None,
            reason: None,
            sequence: 0,
            timestamp: epoch_secs(),
        }
    }

    pub fn with_transition(mut self, prior: &str, new: &str) -> Self {
        self.prior_state = Some(prior.to_string());
        self.new_state = Some(new.to_string());
        self
    }

    pub fn with_reason(mut self, reason: &str) -> Self {
        self.reason = Some(reason.to_string());
        self
    }
}

/// Subscription filter. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventFilter {
    /// Only events for this tenant.
    pub tenant_id: Option<String>,
    /// Only events whose type starts with this prefix.
    pub type_prefix: Option<String>,
    /// Only events for this entity.
    pub entity_id: Option<String>,
}

impl EventFilter {
    /// Match all events.
    pub fn all() -> Self {
        Self::default()
    }

    /// Match all events for one tenant.
    pub fn tenant(tenant_id: &str) -> Self {
        Self {
            tenant_id: Some(tenant_id.to_string()),
            ..Self::default()
        }
    }

    pub fn with_type_prefix(mut self, prefix: &str) -> Self {
        self.type_prefix = Some(prefix.to_string());
        self
    }

    pub fn with_entity(mut self, entity_id: &str) -> Self {
        self.entity_id = Some(entity_id.to_string());
        self
    }

    /// Whether an event passes this filter.
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(tenant) = &self.tenant_id {
            if &event.tenant_id != tenant {
                return false;
            }
        }
        if let Some(prefix) = &self.type_prefix {
            if !event.event_type.starts_with(prefix.as_str()) {
                return false;
            }
        }
        if let Some(entity) = &self.entity_id {
            if &event.entity_id != entity {
                return false;
            }
        }
        true
    }
}
