//! Audit recording.
//!
//! Accepted intents are written synchronously by the facade; resulting
//! state transitions arrive asynchronously through a bus subscription
//! and are appended by a background writer task. The writer
//! deduplicates by event id, since bus delivery is at-least-once.

use std::collections::HashMap;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use helmplane_core::{epoch_secs, new_id, IdPrefix};
use helmplane_event::{DedupWindow, Event, EventFilter};
use helmplane_state::{AuditEntry, StateStore};

/// Build an audit entry for an accepted operator intent.
pub fn intent_entry(
    tenant_id: &str,
    actor: &str,
    resource: &str,
    resource_id: &str,
    action: &str,
) -> AuditEntry {
    AuditEntry {
        id: new_id(IdPrefix::Audit),
        tenant_id: tenant_id.to_string(),
        actor: actor.to_string(),
        resource: resource.to_string(),
        resource_id: resource_id.to_string(),
        action: action.to_string(),
        details: HashMap::new(),
        created_at: epoch_secs(),
    }
}

fn transition_entry(event: &Event) -> AuditEntry {
    let mut details = HashMap::new();
    if let Some(prior) = &event.prior_state {
        details.insert("prior_state".to_string(), prior.clone());
    }
    if let Some(new) = &event.new_state {
        details.insert("new_state".to_string(), new.clone());
    }
    if let Some(reason) = &event.reason {
        details.insert("reason".to_string(), reason.clone());
    }
    details.insert("event_id".to_string(), event.id.clone());
    AuditEntry {
        id: new_id(IdPrefix::Audit),
        tenant_id: event.tenant_id.clone(),
        actor: "system".to_string(),
        resource: format!("{:?}", event.entity_kind).to_lowercase(),
        resource_id: event.entity_id.clone(),
        action: event.event_type.clone(),
        details,
        created_at: epoch_secs(),
    }
}

/// Background task appending an audit entry per observed transition.
pub struct AuditWriter {
    handle: JoinHandle<()>,
}

impl AuditWriter {
    /// Spawn the writer over an already-open subscription.
    pub fn spawn(
        state: StateStore,
        mut subscription: helmplane_event::Subscription,
    ) -> Self {
        let handle = tokio::spawn(async move {
            let mut seen = DedupWindow::new(1024);
            while let Some(event) = subscription.recv().await {
                if !seen.first_seen(&event.id) {
                    debug!(event = %event.id, "duplicate event skipped by audit writer");
                    continue;
                }
                let entry = transition_entry(&event);
                if let Err(e) = state.append_audit(&entry) {
                    warn!(error = %e, "failed to append audit entry");
                }
            }
        });
        Self { handle }
    }

    /// The filter the writer subscribes with: every transition-bearing
    /// event in the system.
    pub fn filter() -> EventFilter {
        EventFilter::all()
    }

    /// Stop the writer.
    pub fn stop(self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use helmplane_core::EventDefaults;
    use helmplane_event::{event::types, EntityKind, EventBus, InMemoryBus};

    #[tokio::test]
    async fn writer_appends_entry_per_event() {
        let state = StateStore::open_in_memory().unwrap();
        let bus = InMemoryBus::new(&EventDefaults::default());
        let sub = bus.subscribe(AuditWriter::filter()).await.unwrap();
        let writer = AuditWriter::spawn(state.clone(), sub);

        let event = Event::new(types::INSTANCE_STARTED, "tn_1", EntityKind::Instance, "in_a")
            .with_transition("starting", "running");
        bus.publish(event).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        writer.stop();

        let entries = state.list_audit("tn_1", 10).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, types::INSTANCE_STARTED);
        assert_eq!(entries[0].resource, "instance");
        assert_eq!(entries[0].details.get("new_state").map(String::as_str), Some("running"));
    }

    #[tokio::test]
    async fn intent_entries_carry_actor_and_action() {
        let entry = intent_entry("tn_1", "operator", "instance", "in_a", "create");
        assert_eq!(entry.tenant_id, "tn_1");
        assert_eq!(entry.actor, "operator");
        assert_eq!(entry.action, "create");
        assert!(entry.id.starts_with("au_"));
    }
}
