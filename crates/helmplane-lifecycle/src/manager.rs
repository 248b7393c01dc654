//! The lifecycle manager — single writer for every instance.
//!
//! All mutations of an instance flow through [`LifecycleManager::apply`]
//! (operator intents) or [`LifecycleManager::apply_health`] (probe
//! flips). A per-instance async mutex serializes writers for one id
//! while distinct instances proceed concurrently; the store's
//! compare-and-set on `(state, generation)` catches anything that
//! slips past the lock, e.g. writers in another process.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use helmplane_core::{epoch_secs, new_id, CancelToken, EngineConfig, IdPrefix, LifecycleDefaults, RetryConfig};
use helmplane_event::{event::types, EntityKind, Event, EventBus};
use helmplane_provider::{CreateRequest, Provider, ProviderRef, ProviderRegistry, ProviderResult};
use helmplane_state::{
    HealthStatus, Instance, InstanceSpec, LifecycleState, StateStore,
};

use crate::error::{LifecycleError, LifecycleResult};
use crate::intent::Intent;
use crate::transitions::validate_transition;

/// Poll interval while waiting for a provider to report ready.
const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Owns the instance state machine.
pub struct LifecycleManager {
    state: StateStore,
    registry: Arc<ProviderRegistry>,
    bus: Arc<dyn EventBus>,
    retry: RetryConfig,
    defaults: LifecycleDefaults,
    /// Per-instance write locks (single-writer-per-entity discipline).
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl LifecycleManager {
    pub fn new(
        state: StateStore,
        registry: Arc<ProviderRegistry>,
        bus: Arc<dyn EventBus>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            state,
            registry,
            bus,
            retry: config.retry.clone(),
            defaults: config.lifecycle.clone(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Create a new instance record in `Pending`.
    ///
    /// The record exists but owns no backend resources until a
    /// `Create` intent is applied. `generation` is the spec generation
    /// the instance is born at (deployments create new-generation
    /// instances directly).
    pub async fn create_record(
        &self,
        tenant_id: &str,
        service: &str,
        provider_name: &str,
        spec: InstanceSpec,
        generation: u64,
    ) -> LifecycleResult<Instance> {
        if generation == 0 {
            return Err(LifecycleError::Validation(
                "generation must be at least 1".to_string(),
            ));
        }
        // Reject unknown providers before anything is persisted.
        self.registry
            .get(provider_name)
            .map_err(|e| LifecycleError::Validation(e.to_string()))?;

        let now = epoch_secs();
        let instance = Instance {
            id: new_id(IdPrefix::Instance),
            tenant_id: tenant_id.to_string(),
            service: service.to_string(),
            provider_name: provider_name.to_string(),
            provider_ref: None,
            spec,
            state: LifecycleState::Pending,
            health: HealthStatus::Unknown,
            generation,
            last_intent: None,
            last_intent_generation: 0,
            status_message: None,
            degraded_since: None,
            destroyed_at: None,
            created_at: now,
            updated_at: now,
        };
        self.state.put_instance(&instance)?;

        self.publish(
            Event::new(types::INSTANCE_CREATED, tenant_id, EntityKind::Instance, &instance.id)
                .with_reason("record created"),
        )
        .await;
        info!(instance = %instance.id, %service, generation, "instance record created");
        Ok(instance)
    }

    /// Apply an operator intent to an instance.
    ///
    /// Idempotent per `(intent, generation)`: replaying the same
    /// intent against an unchanged generation returns the current
    /// state without touching the provider.
    pub async fn apply(
        &self,
        tenant_id: &str,
        instance_id: &str,
        intent: Intent,
        cancel: &CancelToken,
    ) -> LifecycleResult<LifecycleState> {
        if cancel.is_cancelled() {
            return Err(LifecycleError::Cancelled(format!(
                "{} on {instance_id}",
                intent.name()
            )));
        }

        let lock = self.instance_lock(instance_id).await;
        let _guard = lock.lock().await;

        let mut instance = self.load(tenant_id, instance_id)?;

        if instance.last_intent.as_deref() == Some(intent.fingerprint().as_str())
            && instance.last_intent_generation == instance.generation
        {
            debug!(
                instance = %instance_id,
                intent = intent.name(),
                generation = instance.generation,
                "intent replay, no-op"
            );
            return Ok(instance.state);
        }

        let fingerprint = intent.fingerprint();
        let result = match &intent {
            Intent::Create => self.create_flow(&mut instance, &fingerprint, cancel).await,
            Intent::Start => self.start_flow(&mut instance, Some(&fingerprint), cancel).await,
            Intent::Stop => self.stop_flow(&mut instance, Some(&fingerprint), cancel).await,
            Intent::Restart => self.restart_flow(&mut instance, &fingerprint, cancel).await,
            Intent::Scale { replicas } => {
                self.scale_flow(&mut instance, *replicas, &fingerprint, cancel).await
            }
            Intent::Destroy => self.destroy_flow(&mut instance, &fingerprint, cancel).await,
        };

        match result {
            Ok(()) => {
                if instance.state == LifecycleState::Destroyed {
                    self.locks.lock().await.remove(instance_id);
                }
                Ok(instance.state)
            }
            Err(err) => {
                if matches!(
                    err,
                    LifecycleError::ProviderTransient(_)
                        | LifecycleError::ProviderTerminal(_)
                        | LifecycleError::Timeout(_)
                ) {
                    self.fail_instance(tenant_id, instance_id, &err.to_string()).await;
                }
                Err(err)
            }
        }
    }

    /// React to a health status flip reported by the monitor.
    ///
    /// `Running → Degraded` on unhealthy, `Degraded → Running` on
    /// recovery, and `Degraded → Failed` once the instance has been
    /// continuously unhealthy past the configured threshold.
    pub async fn apply_health(
        &self,
        tenant_id: &str,
        instance_id: &str,
        status: HealthStatus,
    ) -> LifecycleResult<LifecycleState> {
        let lock = self.instance_lock(instance_id).await;
        let _guard = lock.lock().await;

        let mut instance = self.load(tenant_id, instance_id)?;

        self.publish(
            Event::new(types::HEALTH_CHANGED, tenant_id, EntityKind::Instance, instance_id)
                .with_transition(&health_str(instance.health), &health_str(status))
                .with_reason("probe threshold crossed"),
        )
        .await;

        let now = epoch_secs();
        match (instance.state, status) {
            (LifecycleState::Running, HealthStatus::Unhealthy) => {
                instance.health = HealthStatus::Unhealthy;
                instance.degraded_since = Some(now);
                self.commit(&mut instance, LifecycleState::Degraded, types::INSTANCE_DEGRADED, "health flip to unhealthy")
                    .await?;
            }
            (LifecycleState::Degraded, HealthStatus::Healthy) => {
                instance.health = HealthStatus::Healthy;
                instance.degraded_since = None;
                self.commit(&mut instance, LifecycleState::Running, types::INSTANCE_RECOVERED, "health flip to healthy")
                    .await?;
            }
            (LifecycleState::Degraded, HealthStatus::Unhealthy) => {
                let threshold = self.defaults.degraded_timeout().as_secs();
                let exceeded = instance
                    .degraded_since
                    .is_some_and(|since| now.saturating_sub(since) >= threshold);
                if exceeded {
                    instance.health = HealthStatus::Unhealthy;
                    instance.status_message =
                        Some("unhealthy past degraded threshold with no recovery".to_string());
                    self.commit(&mut instance, LifecycleState::Failed, types::INSTANCE_FAILED, "degraded timeout exceeded")
                        .await?;
                }
            }
            _ => {
                // No transition; keep the recorded health current.
                if instance.health != status {
                    let prior = instance.state;
                    let generation = instance.generation;
                    instance.health = status;
                    instance.updated_at = now;
                    self.state.cas_instance(&instance, prior, generation)?;
                }
            }
        }
        Ok(instance.state)
    }

    /// Snapshot accessor used by orchestration and the facade.
    pub fn get_instance(
        &self,
        tenant_id: &str,
        instance_id: &str,
    ) -> LifecycleResult<Instance> {
        self.load(tenant_id, instance_id)
    }

    /// Escalate degraded instances that have been continuously
    /// unhealthy past the configured threshold.
    ///
    /// The monitor reports a flip once, so the passage of time while
    /// degraded is observed by this sweep (driven periodically by the
    /// facade). Returns the ids of instances moved to `Failed`.
    pub async fn escalate_degraded(&self, tenant_id: &str) -> LifecycleResult<Vec<String>> {
        let threshold = self.defaults.degraded_timeout().as_secs();
        let now = epoch_secs();
        let overdue: Vec<String> = self
            .state
            .list_instances(tenant_id)?
            .into_iter()
            .filter(|i| {
                i.state == LifecycleState::Degraded
                    && i.degraded_since
                        .is_some_and(|since| now.saturating_sub(since) >= threshold)
            })
            .map(|i| i.id)
            .collect();

        let mut failed = Vec::new();
        for instance_id in overdue {
            let lock = self.instance_lock(&instance_id).await;
            let _guard = lock.lock().await;

            // Re-check under the lock; the instance may have recovered
            // or been stopped in the meantime.
            let mut instance = match self.load(tenant_id, &instance_id) {
                Ok(instance) => instance,
                Err(_) => continue,
            };
            let still_overdue = instance.state == LifecycleState::Degraded
                && instance
                    .degraded_since
                    .is_some_and(|since| now.saturating_sub(since) >= threshold);
            if !still_overdue {
                continue;
            }
            instance.health = HealthStatus::Unhealthy;
            instance.status_message =
                Some("unhealthy past degraded threshold with no recovery".to_string());
            self.commit(&mut instance, LifecycleState::Failed, types::INSTANCE_FAILED, "degraded timeout exceeded")
                .await?;
            failed.push(instance_id);
        }
        Ok(failed)
    }

    // ── Intent flows ───────────────────────────────────────────────

    async fn create_flow(
        &self,
        instance: &mut Instance,
        fingerprint: &str,
        cancel: &CancelToken,
    ) -> LifecycleResult<()> {
        let provider = self.provider_for(instance)?;
        self.commit(instance, LifecycleState::Provisioning, types::INSTANCE_TRANSITION, "create intent accepted")
            .await?;

        let req = CreateRequest {
            instance_id: instance.id.clone(),
            tenant_id: instance.tenant_id.clone(),
            service: instance.service.clone(),
            image: instance.spec.image.clone(),
            command: instance.spec.command.clone(),
            env: instance.spec.env.clone(),
            resources: instance.spec.resources.clone(),
            replicas: instance.spec.replicas,
            labels: HashMap::from([
                ("helmplane/tenant".to_string(), instance.tenant_id.clone()),
                ("helmplane/service".to_string(), instance.service.clone()),
            ]),
        };
        let provider_ref = self
            .retry_provider("create", cancel, || {
                let p = Arc::clone(&provider);
                let req = req.clone();
                async move { p.create(req).await }
            })
            .await?;
        instance.provider_ref = Some(provider_ref.0.clone());

        self.commit(instance, LifecycleState::Starting, types::INSTANCE_TRANSITION, "provisioned")
            .await?;

        self.retry_provider("start", cancel, || {
            let p = Arc::clone(&provider);
            let r = provider_ref.clone();
            async move { p.start(&r).await }
        })
        .await?;
        self.wait_until_ready(&provider, &provider_ref, cancel).await?;

        mark(instance, fingerprint);
        self.commit(instance, LifecycleState::Running, types::INSTANCE_STARTED, "provider confirmed ready")
            .await
    }

    async fn start_flow(
        &self,
        instance: &mut Instance,
        marker: Option<&str>,
        cancel: &CancelToken,
    ) -> LifecycleResult<()> {
        let provider = self.provider_for(instance)?;
        let provider_ref = self.require_ref(instance)?;

        self.commit(instance, LifecycleState::Starting, types::INSTANCE_TRANSITION, "start intent accepted")
            .await?;

        self.retry_provider("start", cancel, || {
            let p = Arc::clone(&provider);
            let r = provider_ref.clone();
            async move { p.start(&r).await }
        })
        .await?;
        self.wait_until_ready(&provider, &provider_ref, cancel).await?;

        if let Some(fingerprint) = marker {
            mark(instance, fingerprint);
        }
        self.commit(instance, LifecycleState::Running, types::INSTANCE_STARTED, "provider confirmed ready")
            .await
    }

    async fn stop_flow(
        &self,
        instance: &mut Instance,
        marker: Option<&str>,
        cancel: &CancelToken,
    ) -> LifecycleResult<()> {
        let provider = self.provider_for(instance)?;
        let provider_ref = self.require_ref(instance)?;

        self.commit(instance, LifecycleState::Stopping, types::INSTANCE_TRANSITION, "stop intent accepted")
            .await?;

        self.retry_provider("stop", cancel, || {
            let p = Arc::clone(&provider);
            let r = provider_ref.clone();
            async move { p.stop(&r).await }
        })
        .await?;

        instance.degraded_since = None;
        if let Some(fingerprint) = marker {
            mark(instance, fingerprint);
        }
        self.commit(instance, LifecycleState::Stopped, types::INSTANCE_STOPPED, "provider confirmed stop")
            .await
    }

    async fn restart_flow(
        &self,
        instance: &mut Instance,
        fingerprint: &str,
        cancel: &CancelToken,
    ) -> LifecycleResult<()> {
        if matches!(
            instance.state,
            LifecycleState::Running | LifecycleState::Degraded
        ) {
            self.stop_flow(instance, None, cancel).await?;
        }
        self.start_flow(instance, Some(fingerprint), cancel).await
    }

    async fn scale_flow(
        &self,
        instance: &mut Instance,
        replicas: u32,
        fingerprint: &str,
        cancel: &CancelToken,
    ) -> LifecycleResult<()> {
        if replicas == 0 {
            return Err(LifecycleError::Validation(
                "scale target must be at least 1".to_string(),
            ));
        }
        let provider = self.provider_for(instance)?;
        let provider_ref = self.require_ref(instance)?;

        self.commit(instance, LifecycleState::Scaling, types::INSTANCE_TRANSITION, "scale intent accepted")
            .await?;

        self.retry_provider("scale", cancel, || {
            let p = Arc::clone(&provider);
            let r = provider_ref.clone();
            async move { p.scale(&r, replicas).await }
        })
        .await?;

        // The spec changed: bump the generation under the same
        // conditional write that completes the transition.
        let expected_generation = instance.generation;
        instance.spec.replicas = replicas;
        instance.generation += 1;
        mark(instance, fingerprint);
        self.commit_with(
            instance,
            expected_generation,
            LifecycleState::Running,
            types::INSTANCE_SCALED,
            "provider confirmed scale",
        )
        .await
    }

    async fn destroy_flow(
        &self,
        instance: &mut Instance,
        fingerprint: &str,
        cancel: &CancelToken,
    ) -> LifecycleResult<()> {
        self.commit(instance, LifecycleState::Destroying, types::INSTANCE_TRANSITION, "destroy intent accepted")
            .await?;

        // A pending instance owns no backend resources yet.
        if let Some(ref_str) = instance.provider_ref.clone() {
            let provider = self.provider_for(instance)?;
            let provider_ref = ProviderRef(ref_str);
            self.retry_provider("destroy", cancel, || {
                let p = Arc::clone(&provider);
                let r = provider_ref.clone();
                async move { p.destroy(&r).await }
            })
            .await?;
        }

        instance.destroyed_at = Some(epoch_secs());
        mark(instance, fingerprint);
        self.commit(instance, LifecycleState::Destroyed, types::INSTANCE_DESTROYED, "provider confirmed destroy")
            .await
    }

    // ── Internals ──────────────────────────────────────────────────

    async fn instance_lock(&self, instance_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(instance_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn load(&self, tenant_id: &str, instance_id: &str) -> LifecycleResult<Instance> {
        self.state
            .get_instance(tenant_id, instance_id)?
            .ok_or_else(|| LifecycleError::NotFound(format!("{tenant_id}/{instance_id}")))
    }

    fn provider_for(&self, instance: &Instance) -> LifecycleResult<Arc<dyn Provider>> {
        self.registry
            .get(&instance.provider_name)
            .map_err(|e| LifecycleError::Validation(e.to_string()))
    }

    fn require_ref(&self, instance: &Instance) -> LifecycleResult<ProviderRef> {
        instance
            .provider_ref
            .clone()
            .map(ProviderRef)
            .ok_or_else(|| {
                LifecycleError::Validation(format!(
                    "instance {} has no provider ref",
                    instance.id
                ))
            })
    }

    /// Commit a transition where the generation is unchanged.
    async fn commit(
        &self,
        instance: &mut Instance,
        to: LifecycleState,
        event_type: &str,
        reason: &str,
    ) -> LifecycleResult<()> {
        let expected_generation = instance.generation;
        self.commit_with(instance, expected_generation, to, event_type, reason)
            .await
    }

    /// Commit a transition with an explicit expected generation (used
    /// when the same write also bumps the generation).
    async fn commit_with(
        &self,
        instance: &mut Instance,
        expected_generation: u64,
        to: LifecycleState,
        event_type: &str,
        reason: &str,
    ) -> LifecycleResult<()> {
        let prior = instance.state;
        validate_transition(prior, to)?;
        instance.state = to;
        instance.updated_at = epoch_secs();
        self.state.cas_instance(instance, prior, expected_generation)?;

        self.publish(
            Event::new(event_type, &instance.tenant_id, EntityKind::Instance, &instance.id)
                .with_transition(&prior.to_string(), &to.to_string())
                .with_reason(reason),
        )
        .await;
        info!(instance = %instance.id, from = %prior, to = %to, reason, "instance transition");
        Ok(())
    }

    /// Move an instance to `Failed` after a provider escalation.
    ///
    /// Re-reads the record so the write reflects whatever transition
    /// last committed; never masks the original failure.
    async fn fail_instance(&self, tenant_id: &str, instance_id: &str, message: &str) {
        let mut instance = match self.state.get_instance(tenant_id, instance_id) {
            Ok(Some(instance)) => instance,
            Ok(None) => return,
            Err(e) => {
                warn!(instance = %instance_id, error = %e, "failed to load instance for failure escalation");
                return;
            }
        };
        if validate_transition(instance.state, LifecycleState::Failed).is_err() {
            warn!(
                instance = %instance_id,
                state = %instance.state,
                "cannot escalate to failed from current state"
            );
            return;
        }
        instance.status_message = Some(message.to_string());
        if let Err(e) = self
            .commit(&mut instance, LifecycleState::Failed, types::INSTANCE_FAILED, message)
            .await
        {
            warn!(instance = %instance_id, error = %e, "failure escalation write lost");
        }
    }

    /// Run a provider call with bounded exponential backoff on
    /// transient failures. Terminal failures and cancellation abort
    /// immediately.
    async fn retry_provider<T, F, Fut>(
        &self,
        op: &str,
        cancel: &CancelToken,
        mut call: F,
    ) -> LifecycleResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ProviderResult<T>>,
    {
        let mut backoff = self.retry.base_backoff();
        let mut cancel = cancel.clone();
        for attempt in 1..=self.retry.max_attempts {
            if cancel.is_cancelled() {
                return Err(LifecycleError::Cancelled(op.to_string()));
            }
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() => {
                    warn!(op, attempt, error = %e, "transient provider failure");
                    if attempt == self.retry.max_attempts {
                        return Err(LifecycleError::ProviderTransient(e.to_string()));
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = cancel.cancelled() => {
                            return Err(LifecycleError::Cancelled(op.to_string()));
                        }
                    }
                    backoff = (backoff * 2).min(self.retry.max_backoff());
                }
                Err(e) => return Err(LifecycleError::ProviderTerminal(e.to_string())),
            }
        }
        Err(LifecycleError::ProviderTransient(format!(
            "{op}: retry budget exhausted"
        )))
    }

    /// Poll describe until the provider reports ready, bounded by the
    /// configured deadline and the caller's cancellation signal.
    async fn wait_until_ready(
        &self,
        provider: &Arc<dyn Provider>,
        provider_ref: &ProviderRef,
        cancel: &CancelToken,
    ) -> LifecycleResult<()> {
        let deadline = tokio::time::Instant::now() + self.defaults.ready_timeout();
        let mut cancel = cancel.clone();
        loop {
            match provider.describe(provider_ref).await {
                Ok(status) if status.ready => return Ok(()),
                Ok(_) => {}
                Err(e) if e.is_retryable() => {
                    debug!(error = %e, "describe failed while waiting for ready");
                }
                Err(e) => return Err(LifecycleError::ProviderTerminal(e.to_string())),
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(LifecycleError::Timeout(format!(
                    "{provider_ref} not ready within {:?}",
                    self.defaults.ready_timeout()
                )));
            }
            tokio::select! {
                _ = tokio::time::sleep(READY_POLL_INTERVAL) => {}
                _ = cancel.cancelled() => {
                    return Err(LifecycleError::Cancelled("wait for ready".to_string()));
                }
            }
        }
    }

    async fn publish(&self, event: Event) {
        if let Err(e) = self.bus.publish(event).await {
            warn!(error = %e, "failed to publish lifecycle event");
        }
    }
}

/// Record the idempotency marker for the intent that is completing.
fn mark(instance: &mut Instance, fingerprint: &str) {
    instance.last_intent = Some(fingerprint.to_string());
    instance.last_intent_generation = instance.generation;
}

fn health_str(status: HealthStatus) -> String {
    match status {
        HealthStatus::Unknown => "unknown",
        HealthStatus::Healthy => "healthy",
        HealthStatus::Unhealthy => "unhealthy",
        HealthStatus::Recovering => "recovering",
    }
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use helmplane_core::EventDefaults;
    use helmplane_event::{EventFilter, InMemoryBus};
    use helmplane_provider::{MockProvider, ProviderError};
    use helmplane_state::ResourceSpec;

    struct Harness {
        manager: LifecycleManager,
        provider: Arc<MockProvider>,
        bus: Arc<InMemoryBus>,
        state: StateStore,
    }

    fn fast_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.retry.base_backoff = "5ms".to_string();
        config.retry.max_backoff = "20ms".to_string();
        config.lifecycle.ready_timeout = "2s".to_string();
        config
    }

    fn harness() -> Harness {
        harness_with(fast_config())
    }

    fn harness_with(config: EngineConfig) -> Harness {
        let state = StateStore::open_in_memory().unwrap();
        let provider = Arc::new(MockProvider::new("mock"));
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::clone(&provider) as Arc<dyn Provider>);
        let bus = Arc::new(InMemoryBus::new(&EventDefaults::default()));
        let manager = LifecycleManager::new(
            state.clone(),
            Arc::new(registry),
            Arc::clone(&bus) as Arc<dyn EventBus>,
            &config,
        );
        Harness {
            manager,
            provider,
            bus,
            state,
        }
    }

    fn spec() -> InstanceSpec {
        InstanceSpec {
            image: "registry.example.com/api:v1".to_string(),
            command: vec![],
            env: HashMap::new(),
            resources: ResourceSpec::default(),
            replicas: 1,
        }
    }

    async fn created_running(h: &Harness) -> Instance {
        let instance = h
            .manager
            .create_record("tn_1", "api", "mock", spec(), 1)
            .await
            .unwrap();
        let state = h
            .manager
            .apply("tn_1", &instance.id, Intent::Create, &CancelToken::never())
            .await
            .unwrap();
        assert_eq!(state, LifecycleState::Running);
        h.state.get_instance("tn_1", &instance.id).unwrap().unwrap()
    }

    // ── Create flow ────────────────────────────────────────────────

    #[tokio::test]
    async fn create_walks_pending_provisioning_starting_running() {
        let h = harness();
        let mut sub = h
            .bus
            .subscribe(EventFilter::tenant("tn_1").with_type_prefix("instance."))
            .await
            .unwrap();

        let instance = created_running(&h).await;
        assert_eq!(instance.state, LifecycleState::Running);
        assert!(instance.provider_ref.is_some());

        // Event stream shows the full state sequence in order.
        let mut transitions = Vec::new();
        while let Some(event) = sub.try_recv() {
            if let (Some(prior), Some(new)) = (event.prior_state, event.new_state) {
                transitions.push(format!("{prior}->{new}"));
            }
        }
        assert_eq!(
            transitions,
            vec![
                "pending->provisioning",
                "provisioning->starting",
                "starting->running",
            ]
        );
    }

    #[tokio::test]
    async fn create_is_idempotent_per_generation() {
        let h = harness();
        let instance = created_running(&h).await;

        // Replay: same intent, unchanged generation.
        let state = h
            .manager
            .apply("tn_1", &instance.id, Intent::Create, &CancelToken::never())
            .await
            .unwrap();
        assert_eq!(state, LifecycleState::Running);
        // Exactly one provider create across both applies.
        assert_eq!(h.provider.call_count("create:"), 1);
    }

    #[tokio::test]
    async fn create_requires_pending() {
        let h = harness();
        let instance = created_running(&h).await;

        // Force a fresh fingerprint so the replay guard doesn't absorb it.
        let mut stored = h.state.get_instance("tn_1", &instance.id).unwrap().unwrap();
        stored.last_intent = None;
        h.state.put_instance(&stored).unwrap();

        let err = h
            .manager
            .apply("tn_1", &instance.id, Intent::Create, &CancelToken::never())
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::InvalidTransition { .. }));
    }

    // ── Retry and failure escalation ───────────────────────────────

    #[tokio::test]
    async fn transient_failures_retry_then_succeed() {
        let h = harness();
        h.provider
            .inject_failure("create", ProviderError::Transient("io".into()));
        h.provider
            .inject_failure("create", ProviderError::Transient("io".into()));

        let instance = created_running(&h).await;
        assert_eq!(instance.state, LifecycleState::Running);
        // 2 failures + 1 success, all within the budget of 3.
        assert_eq!(h.provider.call_count("create:"), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_fail_the_instance() {
        let h = harness();
        for _ in 0..3 {
            h.provider
                .inject_failure("create", ProviderError::Transient("io".into()));
        }

        let instance = h
            .manager
            .create_record("tn_1", "api", "mock", spec(), 1)
            .await
            .unwrap();
        let err = h
            .manager
            .apply("tn_1", &instance.id, Intent::Create, &CancelToken::never())
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::ProviderTransient(_)));

        let stored = h.state.get_instance("tn_1", &instance.id).unwrap().unwrap();
        assert_eq!(stored.state, LifecycleState::Failed);
        assert!(stored.status_message.is_some());
    }

    #[tokio::test]
    async fn terminal_failure_fails_without_retry() {
        let h = harness();
        h.provider
            .inject_failure("create", ProviderError::Terminal("bad image".into()));

        let instance = h
            .manager
            .create_record("tn_1", "api", "mock", spec(), 1)
            .await
            .unwrap();
        let err = h
            .manager
            .apply("tn_1", &instance.id, Intent::Create, &CancelToken::never())
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::ProviderTerminal(_)));
        assert_eq!(h.provider.call_count("create:"), 1);

        let stored = h.state.get_instance("tn_1", &instance.id).unwrap().unwrap();
        assert_eq!(stored.state, LifecycleState::Failed);
    }

    #[tokio::test]
    async fn failure_emits_event() {
        let h = harness();
        h.provider
            .inject_failure("create", ProviderError::Terminal("bad image".into()));
        let mut sub = h
            .bus
            .subscribe(EventFilter::all().with_type_prefix(types::INSTANCE_FAILED))
            .await
            .unwrap();

        let instance = h
            .manager
            .create_record("tn_1", "api", "mock", spec(), 1)
            .await
            .unwrap();
        let _ = h
            .manager
            .apply("tn_1", &instance.id, Intent::Create, &CancelToken::never())
            .await;

        let event = sub.recv().await.unwrap();
        assert_eq!(event.entity_id, instance.id);
        assert_eq!(event.new_state.as_deref(), Some("failed"));
    }

    // ── Scale ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn scale_bumps_generation_and_returns_to_running() {
        let h = harness();
        let instance = created_running(&h).await;
        assert_eq!(instance.generation, 1);

        let state = h
            .manager
            .apply("tn_1", &instance.id, Intent::Scale { replicas: 4 }, &CancelToken::never())
            .await
            .unwrap();
        assert_eq!(state, LifecycleState::Running);

        let stored = h.state.get_instance("tn_1", &instance.id).unwrap().unwrap();
        assert_eq!(stored.generation, 2);
        assert_eq!(stored.spec.replicas, 4);
    }

    #[tokio::test]
    async fn scale_replay_is_noop_but_new_target_applies() {
        let h = harness();
        let instance = created_running(&h).await;

        h.manager
            .apply("tn_1", &instance.id, Intent::Scale { replicas: 4 }, &CancelToken::never())
            .await
            .unwrap();
        // Replay of the same target against the new generation is a
        // fresh intent (generation changed), but same target + same
        // generation is a no-op:
        h.manager
            .apply("tn_1", &instance.id, Intent::Scale { replicas: 4 }, &CancelToken::never())
            .await
            .unwrap();
        let stored = h.state.get_instance("tn_1", &instance.id).unwrap().unwrap();
        assert_eq!(stored.generation, 2);
        assert_eq!(h.provider.call_count("scale:"), 1);

        // A different target is a new intent.
        h.manager
            .apply("tn_1", &instance.id, Intent::Scale { replicas: 2 }, &CancelToken::never())
            .await
            .unwrap();
        let stored = h.state.get_instance("tn_1", &instance.id).unwrap().unwrap();
        assert_eq!(stored.generation, 3);
        assert_eq!(h.provider.call_count("scale:"), 2);
    }

    #[tokio::test]
    async fn scale_to_zero_is_rejected() {
        let h = harness();
        let instance = created_running(&h).await;
        let err = h
            .manager
            .apply("tn_1", &instance.id, Intent::Scale { replicas: 0 }, &CancelToken::never())
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::Validation(_)));
        // No state change on validation errors.
        let stored = h.state.get_instance("tn_1", &instance.id).unwrap().unwrap();
        assert_eq!(stored.state, LifecycleState::Running);
    }

    // ── Stop / restart / destroy ───────────────────────────────────

    #[tokio::test]
    async fn stop_then_destroy() {
        let h = harness();
        let instance = created_running(&h).await;

        let state = h
            .manager
            .apply("tn_1", &instance.id, Intent::Stop, &CancelToken::never())
            .await
            .unwrap();
        assert_eq!(state, LifecycleState::Stopped);

        let state = h
            .manager
            .apply("tn_1", &instance.id, Intent::Destroy, &CancelToken::never())
            .await
            .unwrap();
        assert_eq!(state, LifecycleState::Destroyed);

        let stored = h.state.get_instance("tn_1", &instance.id).unwrap().unwrap();
        assert!(stored.destroyed_at.is_some());
        assert!(!h
            .provider
            .has_unit(&ProviderRef(instance.provider_ref.unwrap())));
    }

    #[tokio::test]
    async fn destroy_pending_instance_skips_provider() {
        let h = harness();
        let instance = h
            .manager
            .create_record("tn_1", "api", "mock", spec(), 1)
            .await
            .unwrap();

        let state = h
            .manager
            .apply("tn_1", &instance.id, Intent::Destroy, &CancelToken::never())
            .await
            .unwrap();
        assert_eq!(state, LifecycleState::Destroyed);
        assert_eq!(h.provider.call_count("destroy:"), 0);
    }

    #[tokio::test]
    async fn restart_cycles_running_instance() {
        let h = harness();
        let instance = created_running(&h).await;

        let state = h
            .manager
            .apply("tn_1", &instance.id, Intent::Restart, &CancelToken::never())
            .await
            .unwrap();
        assert_eq!(state, LifecycleState::Running);
        assert_eq!(h.provider.call_count("stop:"), 1);
        assert_eq!(h.provider.call_count("start:"), 2); // create + restart
    }

    #[tokio::test]
    async fn stop_on_pending_is_invalid() {
        let h = harness();
        let instance = h
            .manager
            .create_record("tn_1", "api", "mock", spec(), 1)
            .await
            .unwrap();
        let err = h
            .manager
            .apply("tn_1", &instance.id, Intent::Stop, &CancelToken::never())
            .await
            .unwrap_err();
        // Pending instances have no provider ref yet.
        assert!(matches!(
            err,
            LifecycleError::Validation(_) | LifecycleError::InvalidTransition { .. }
        ));
    }

    // ── Health-driven transitions ──────────────────────────────────

    #[tokio::test]
    async fn unhealthy_degrades_then_recovers() {
        let h = harness();
        let instance = created_running(&h).await;

        let state = h
            .manager
            .apply_health("tn_1", &instance.id, HealthStatus::Unhealthy)
            .await
            .unwrap();
        assert_eq!(state, LifecycleState::Degraded);
        let stored = h.state.get_instance("tn_1", &instance.id).unwrap().unwrap();
        assert!(stored.degraded_since.is_some());

        let state = h
            .manager
            .apply_health("tn_1", &instance.id, HealthStatus::Healthy)
            .await
            .unwrap();
        assert_eq!(state, LifecycleState::Running);
        let stored = h.state.get_instance("tn_1", &instance.id).unwrap().unwrap();
        assert!(stored.degraded_since.is_none());
    }

    #[tokio::test]
    async fn degraded_past_threshold_fails() {
        let mut config = fast_config();
        config.lifecycle.degraded_timeout = "1s".to_string();
        let h = harness_with(config);
        let instance = created_running(&h).await;

        h.manager
            .apply_health("tn_1", &instance.id, HealthStatus::Unhealthy)
            .await
            .unwrap();

        // Backdate the degraded timestamp past the threshold.
        let mut stored = h.state.get_instance("tn_1", &instance.id).unwrap().unwrap();
        stored.degraded_since = Some(epoch_secs() - 10);
        h.state.put_instance(&stored).unwrap();

        let state = h
            .manager
            .apply_health("tn_1", &instance.id, HealthStatus::Unhealthy)
            .await
            .unwrap();
        assert_eq!(state, LifecycleState::Failed);
    }

    #[tokio::test]
    async fn escalation_sweep_fails_overdue_degraded_instances() {
        let mut config = fast_config();
        config.lifecycle.degraded_timeout = "1s".to_string();
        let h = harness_with(config);

        let overdue = created_running(&h).await;
        h.manager
            .apply_health("tn_1", &overdue.id, HealthStatus::Unhealthy)
            .await
            .unwrap();
        let mut stored = h.state.get_instance("tn_1", &overdue.id).unwrap().unwrap();
        stored.degraded_since = Some(epoch_secs() - 10);
        h.state.put_instance(&stored).unwrap();

        // Freshly degraded instance stays untouched.
        let fresh = created_running(&h).await;
        h.manager
            .apply_health("tn_1", &fresh.id, HealthStatus::Unhealthy)
            .await
            .unwrap();

        let failed = h.manager.escalate_degraded("tn_1").await.unwrap();
        assert_eq!(failed, vec![overdue.id.clone()]);

        let stored = h.state.get_instance("tn_1", &overdue.id).unwrap().unwrap();
        assert_eq!(stored.state, LifecycleState::Failed);
        let stored = h.state.get_instance("tn_1", &fresh.id).unwrap().unwrap();
        assert_eq!(stored.state, LifecycleState::Degraded);
    }

    #[tokio::test]
    async fn degraded_within_threshold_stays_degraded() {
        let h = harness(); // 5m default threshold
        let instance = created_running(&h).await;

        h.manager
            .apply_health("tn_1", &instance.id, HealthStatus::Unhealthy)
            .await
            .unwrap();
        let state = h
            .manager
            .apply_health("tn_1", &instance.id, HealthStatus::Unhealthy)
            .await
            .unwrap();
        assert_eq!(state, LifecycleState::Degraded);
    }

    #[tokio::test]
    async fn health_flip_emits_health_changed_event() {
        let h = harness();
        let instance = created_running(&h).await;
        let mut sub = h
            .bus
            .subscribe(EventFilter::all().with_type_prefix("health."))
            .await
            .unwrap();

        h.manager
            .apply_health("tn_1", &instance.id, HealthStatus::Unhealthy)
            .await
            .unwrap();

        let event = sub.recv().await.unwrap();
        assert_eq!(event.event_type, types::HEALTH_CHANGED);
        assert_eq!(event.new_state.as_deref(), Some("unhealthy"));
    }

    // ── Cancellation and scoping ───────────────────────────────────

    #[tokio::test]
    async fn cancelled_token_aborts_before_any_work() {
        let h = harness();
        let instance = h
            .manager
            .create_record("tn_1", "api", "mock", spec(), 1)
            .await
            .unwrap();

        let (source, token) = helmplane_core::CancelSource::new();
        source.cancel();
        let err = h
            .manager
            .apply("tn_1", &instance.id, Intent::Create, &token)
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::Cancelled(_)));

        // Last durably-recorded state is untouched.
        let stored = h.state.get_instance("tn_1", &instance.id).unwrap().unwrap();
        assert_eq!(stored.state, LifecycleState::Pending);
        assert_eq!(h.provider.call_count("create:"), 0);
    }

    #[tokio::test]
    async fn wrong_tenant_cannot_address_instance() {
        let h = harness();
        let instance = created_running(&h).await;

        let err = h
            .manager
            .apply("tn_2", &instance.id, Intent::Stop, &CancelToken::never())
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::NotFound(_)));
    }

    #[tokio::test]
    async fn unknown_provider_rejected_at_record_creation() {
        let h = harness();
        let err = h
            .manager
            .create_record("tn_1", "api", "fly", spec(), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::Validation(_)));
    }
}
