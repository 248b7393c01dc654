//! The deployment orchestrator.
//!
//! Drives a service from generation G to G+1 by sequencing lifecycle
//! operations and gating on health between steps. One orchestration
//! runs per deployment; at most one deployment is active per
//! `(tenant, service)` pair (enforced at admission, surfaced as a
//! conflict rather than queued).
//!
//! The orchestrator never reaches into instances directly: calls go
//! down through the lifecycle manager, and progress signals come back
//! up through the event bus and the store.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use helmplane_core::{epoch_secs, new_id, CancelToken, DeployDefaults, EngineConfig, IdPrefix};
use helmplane_event::{event::types, EntityKind, Event, EventBus, EventFilter};
use helmplane_lifecycle::{Intent, LifecycleError, LifecycleManager};
use helmplane_state::{
    Deployment, DeploymentState, HealthStatus, Instance, InstanceSpec, LifecycleState,
    StateStore, StrategyConfig,
};

use crate::error::{DeployError, DeployResult};
use crate::router::TrafficRouter;
use crate::strategy;

/// Fallback poll interval while waiting on health gates; the event
/// subscription usually wakes the wait earlier.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Sequences lifecycle operations for deployments.
pub struct Orchestrator {
    state: StateStore,
    lifecycle: Arc<LifecycleManager>,
    bus: Arc<dyn EventBus>,
    router: Arc<dyn TrafficRouter>,
    defaults: DeployDefaults,
}

impl Orchestrator {
    pub fn new(
        state: StateStore,
        lifecycle: Arc<LifecycleManager>,
        bus: Arc<dyn EventBus>,
        router: Arc<dyn TrafficRouter>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            state,
            lifecycle,
            bus,
            router,
            defaults: config.deploy.clone(),
        }
    }

    /// Admit a new deployment for a service.
    ///
    /// Rejects with a conflict if one is already pending or in
    /// progress for the same `(tenant, service)` pair. The returned
    /// record is `Pending`; [`run`](Orchestrator::run) executes it.
    pub async fn start_deployment(
        &self,
        tenant_id: &str,
        service: &str,
        provider_name: &str,
        target_spec: InstanceSpec,
        target_count: u32,
        strategy: StrategyConfig,
    ) -> DeployResult<Deployment> {
        if service.is_empty() {
            return Err(DeployError::Validation("service must not be empty".to_string()));
        }
        if target_count == 0 {
            return Err(DeployError::Validation(
                "target_count must be at least 1".to_string(),
            ));
        }
        strategy::validate(&strategy)?;

        if let Some(active) = self.state.active_deployment_for_service(tenant_id, service)? {
            return Err(DeployError::Conflict(format!(
                "deployment {} already active for service {service}",
                active.id
            )));
        }

        let from_generation = self
            .state
            .list_instances_for_service(tenant_id, service)?
            .iter()
            .filter(|i| i.state != LifecycleState::Destroyed)
            .map(|i| i.generation)
            .max()
            .unwrap_or(0);
        let to_generation = from_generation + 1;

        let now = epoch_secs();
        let deployment = Deployment {
            id: new_id(IdPrefix::Deployment),
            tenant_id: tenant_id.to_string(),
            service: service.to_string(),
            provider_name: provider_name.to_string(),
            strategy,
            state: DeploymentState::Pending,
            from_generation,
            to_generation,
            target_spec,
            target_count,
            completed_batches: 0,
            new_instance_ids: Vec::new(),
            reason: None,
            started_at: None,
            finished_at: None,
            created_at: now,
            updated_at: now,
        };
        self.state.put_deployment(&deployment)?;
        info!(
            deployment = %deployment.id,
            %service,
            from = from_generation,
            to = to_generation,
            "deployment admitted"
        );
        Ok(deployment)
    }

    /// Execute (or resume) a deployment to completion.
    ///
    /// Returns the final deployment state. Failures roll back
    /// compensatingly and yield `RolledBack`; cancellation leaves the
    /// deployment in progress with its cursor intact, so a later call
    /// resumes from the last completed batch.
    pub async fn run(
        &self,
        tenant_id: &str,
        deployment_id: &str,
        cancel: &CancelToken,
    ) -> DeployResult<DeploymentState> {
        let mut deployment = self
            .state
            .get_deployment(tenant_id, deployment_id)?
            .ok_or_else(|| DeployError::NotFound(format!("{tenant_id}/{deployment_id}")))?;

        if !deployment.state.is_active() {
            return Ok(deployment.state);
        }
        if cancel.is_cancelled() {
            return Err(DeployError::Cancelled(format!("deployment {deployment_id}")));
        }

        if deployment.state == DeploymentState::Pending {
            deployment.state = DeploymentState::InProgress;
            deployment.started_at = Some(epoch_secs());
            deployment.updated_at = epoch_secs();
            self.state.put_deployment(&deployment)?;
            self.publish_deploy_event(&deployment, types::DEPLOY_STARTED, "deployment started")
                .await;
        }

        self.resume_cleanup(&mut deployment).await?;

        let result = match deployment.strategy.clone() {
            StrategyConfig::Rolling { batch_size } => {
                self.run_rolling(&mut deployment, batch_size.max(1), cancel).await
            }
            StrategyConfig::BlueGreen => self.run_blue_green(&mut deployment, cancel).await,
            StrategyConfig::Canary {
                percent,
                error_rate_threshold,
            } => {
                self.run_canary(&mut deployment, percent, error_rate_threshold, cancel)
                    .await
            }
            StrategyConfig::Recreate => self.run_recreate(&mut deployment, cancel).await,
        };

        match result {
            Ok(()) => {
                self.finish(
                    &mut deployment,
                    DeploymentState::Succeeded,
                    None,
                    types::DEPLOY_SUCCEEDED,
                )
                .await?;
                Ok(DeploymentState::Succeeded)
            }
            Err(err) if err.preserves_progress() => Err(err),
            Err(err) => {
                let reason = err.to_string();
                warn!(deployment = %deployment.id, %reason, "deployment aborted, rolling back");
                if matches!(deployment.strategy, StrategyConfig::Recreate) {
                    // The old generation is already gone; compensation
                    // can only remove the failed new instances.
                    self.destroy_new_generation(&mut deployment, 0).await;
                    self.finish(
                        &mut deployment,
                        DeploymentState::Failed,
                        Some(reason),
                        types::DEPLOY_FAILED,
                    )
                    .await?;
                    Ok(DeploymentState::Failed)
                } else {
                    self.rollback(&mut deployment, reason).await?;
                    Ok(DeploymentState::RolledBack)
                }
            }
        }
    }

    // ── Strategies ─────────────────────────────────────────────────

    async fn run_rolling(
        &self,
        deployment: &mut Deployment,
        batch_size: u32,
        cancel: &CancelToken,
    ) -> DeployResult<()> {
        let total_batches = strategy::batch_count(deployment.target_count, batch_size);

        for batch_index in deployment.completed_batches..total_batches {
            let start = batch_index * batch_size;
            let count = batch_size.min(deployment.target_count - start);

            let ids = self.create_batch(deployment, count, cancel).await?;
            self.wait_for_healthy(
                &deployment.tenant_id,
                &ids,
                self.defaults.health_wait_timeout(),
                cancel,
            )
            .await?;
            self.bake(self.defaults.bake_interval(), cancel).await?;
            self.verify_healthy(&deployment.tenant_id, &ids)?;

            // The new batch is serving; retire an equal slice of the
            // old generation.
            let old = self.old_instances(deployment)?;
            let retire_now: Vec<Instance> =
                old.into_iter().take(count as usize).collect();
            self.retire_many(&deployment.tenant_id, &retire_now, cancel).await?;

            deployment.completed_batches = batch_index + 1;
            deployment.updated_at = epoch_secs();
            self.state.put_deployment(deployment)?;
            self.publish_deploy_event(
                deployment,
                types::DEPLOY_BATCH_COMPLETED,
                &format!("batch {}/{total_batches}", batch_index + 1),
            )
            .await;
        }

        // Old instances beyond the pairing (shrinking rollouts).
        let leftover = self.old_instances(deployment)?;
        self.retire_many(&deployment.tenant_id, &leftover, cancel).await
    }

    async fn run_blue_green(
        &self,
        deployment: &mut Deployment,
        cancel: &CancelToken,
    ) -> DeployResult<()> {
        let ids = self
            .create_batch(deployment, deployment.target_count, cancel)
            .await?;
        self.wait_for_healthy(
            &deployment.tenant_id,
            &ids,
            self.defaults.health_wait_timeout(),
            cancel,
        )
        .await?;
        self.bake(self.defaults.bake_interval(), cancel).await?;
        self.verify_healthy(&deployment.tenant_id, &ids)?;

        self.router
            .switch(&deployment.tenant_id, &deployment.service, deployment.to_generation)
            .await
            .map_err(|e| DeployError::Routing(e.to_string()))?;
        info!(deployment = %deployment.id, "traffic switched to green set");

        let blue = self.old_instances(deployment)?;
        self.retire_many(&deployment.tenant_id, &blue, cancel).await
    }

    async fn run_canary(
        &self,
        deployment: &mut Deployment,
        percent: u32,
        error_rate_threshold: f64,
        cancel: &CancelToken,
    ) -> DeployResult<()> {
        let canaries = strategy::canary_count(deployment.target_count, percent);
        let ids = self.create_batch(deployment, canaries, cancel).await?;
        self.wait_for_healthy(
            &deployment.tenant_id,
            &ids,
            self.defaults.health_wait_timeout(),
            cancel,
        )
        .await?;

        self.router
            .split(
                &deployment.tenant_id,
                &deployment.service,
                deployment.to_generation,
                percent,
            )
            .await
            .map_err(|e| DeployError::Routing(e.to_string()))?;
        info!(deployment = %deployment.id, percent, "canary receiving traffic, soaking");

        self.bake(self.defaults.soak_interval(), cancel).await?;
        self.verify_healthy(&deployment.tenant_id, &ids)?;

        if let Some(rate) = self
            .router
            .error_rate(&deployment.tenant_id, &deployment.service, deployment.to_generation)
            .await
        {
            if rate > error_rate_threshold {
                return Err(DeployError::GateFailed(format!(
                    "canary error rate {rate:.1}% above threshold {error_rate_threshold:.1}%"
                )));
            }
        }

        // Promotion: roll the remainder out in canary-sized chunks.
        let mut remaining = deployment.target_count - canaries;
        while remaining > 0 {
            let count = canaries.min(remaining);
            let ids = self.create_batch(deployment, count, cancel).await?;
            self.wait_for_healthy(
                &deployment.tenant_id,
                &ids,
                self.defaults.health_wait_timeout(),
                cancel,
            )
            .await?;
            remaining -= count;
        }

        self.router
            .switch(&deployment.tenant_id, &deployment.service, deployment.to_generation)
            .await
            .map_err(|e| DeployError::Routing(e.to_string()))?;

        let old = self.old_instances(deployment)?;
        self.retire_many(&deployment.tenant_id, &old, cancel).await
    }

    async fn run_recreate(
        &self,
        deployment: &mut Deployment,
        cancel: &CancelToken,
    ) -> DeployResult<()> {
        let old = self.old_instances(deployment)?;
        self.retire_many(&deployment.tenant_id, &old, cancel).await?;

        let ids = self
            .create_batch(deployment, deployment.target_count, cancel)
            .await?;
        self.wait_for_healthy(
            &deployment.tenant_id,
            &ids,
            self.defaults.health_wait_timeout(),
            cancel,
        )
        .await
    }

    // ── Building blocks ────────────────────────────────────────────

    /// Create `count` new-generation instances. Records (and the
    /// deployment cursor) are persisted before any provider call, so
    /// an interrupted batch is identifiable on resume. Creation within
    /// the batch runs concurrently.
    async fn create_batch(
        &self,
        deployment: &mut Deployment,
        count: u32,
        cancel: &CancelToken,
    ) -> DeployResult<Vec<String>> {
        let mut ids = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let instance = self
                .lifecycle
                .create_record(
                    &deployment.tenant_id,
                    &deployment.service,
                    &deployment.provider_name,
                    deployment.target_spec.clone(),
                    deployment.to_generation,
                )
                .await?;
            ids.push(instance.id);
        }
        deployment.new_instance_ids.extend(ids.iter().cloned());
        deployment.updated_at = epoch_secs();
        self.state.put_deployment(deployment)?;

        let results = futures::future::join_all(ids.iter().map(|id| {
            self.lifecycle
                .apply(&deployment.tenant_id, id, Intent::Create, cancel)
        }))
        .await;
        for result in results {
            if let Err(e) = result {
                return Err(map_lifecycle(e));
            }
        }
        Ok(ids)
    }

    /// Wait until every listed instance is `Running` and `Healthy`.
    ///
    /// Wakes on tenant events with a polling fallback; fails fast if
    /// any instance reaches `Failed`.
    async fn wait_for_healthy(
        &self,
        tenant_id: &str,
        ids: &[String],
        timeout: Duration,
        cancel: &CancelToken,
    ) -> DeployResult<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut sub = self
            .bus
            .subscribe(EventFilter::tenant(tenant_id))
            .await
            .ok();
        let mut cancel = cancel.clone();

        loop {
            let mut pending = 0usize;
            for id in ids {
                let instance = self
                    .state
                    .get_instance(tenant_id, id)?
                    .ok_or_else(|| DeployError::NotFound(format!("{tenant_id}/{id}")))?;
                match instance.state {
                    LifecycleState::Failed => {
                        return Err(DeployError::GateFailed(format!(
                            "instance {id} failed: {}",
                            instance.status_message.unwrap_or_default()
                        )));
                    }
                    LifecycleState::Running if instance.health == HealthStatus::Healthy => {}
                    _ => pending += 1,
                }
            }
            if pending == 0 {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(DeployError::Timeout(format!(
                    "{pending} instance(s) not healthy within {timeout:?}"
                )));
            }

            match sub.as_mut() {
                Some(sub) => {
                    tokio::select! {
                        _ = sub.recv() => {}
                        _ = tokio::time::sleep(WAIT_POLL_INTERVAL) => {}
                        _ = cancel.cancelled() => {
                            return Err(DeployError::Cancelled("health wait".to_string()));
                        }
                    }
                }
                None => {
                    tokio::select! {
                        _ = tokio::time::sleep(WAIT_POLL_INTERVAL) => {}
                        _ = cancel.cancelled() => {
                            return Err(DeployError::Cancelled("health wait".to_string()));
                        }
                    }
                }
            }
        }
    }

    /// Cancellable observation window.
    async fn bake(&self, duration: Duration, cancel: &CancelToken) -> DeployResult<()> {
        let mut cancel = cancel.clone();
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = cancel.cancelled() => Err(DeployError::Cancelled("bake interval".to_string())),
        }
    }

    /// One-shot re-verification after a bake/soak window.
    fn verify_healthy(&self, tenant_id: &str, ids: &[String]) -> DeployResult<()> {
        for id in ids {
            let instance = self
                .state
                .get_instance(tenant_id, id)?
                .ok_or_else(|| DeployError::NotFound(format!("{tenant_id}/{id}")))?;
            let healthy = instance.state == LifecycleState::Running
                && instance.health == HealthStatus::Healthy;
            if !healthy {
                return Err(DeployError::GateFailed(format!(
                    "instance {id} regressed during observation window"
                )));
            }
        }
        Ok(())
    }

    /// Old-generation instances still standing, oldest first.
    fn old_instances(&self, deployment: &Deployment) -> DeployResult<Vec<Instance>> {
        let mut instances = self
            .state
            .list_instances_for_service(&deployment.tenant_id, &deployment.service)?;
        instances.retain(|i| {
            i.generation < deployment.to_generation
                && !matches!(
                    i.state,
                    LifecycleState::Destroyed | LifecycleState::Destroying
                )
        });
        instances.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(instances)
    }

    /// Stop-then-destroy one instance through the lifecycle manager.
    async fn retire(
        &self,
        tenant_id: &str,
        instance: &Instance,
        cancel: &CancelToken,
    ) -> DeployResult<()> {
        if matches!(
            instance.state,
            LifecycleState::Running | LifecycleState::Degraded
        ) {
            self.lifecycle
                .apply(tenant_id, &instance.id, Intent::Stop, cancel)
                .await
                .map_err(map_lifecycle)?;
        }
        self.lifecycle
            .apply(tenant_id, &instance.id, Intent::Destroy, cancel)
            .await
            .map_err(map_lifecycle)?;
        Ok(())
    }

    async fn retire_many(
        &self,
        tenant_id: &str,
        instances: &[Instance],
        cancel: &CancelToken,
    ) -> DeployResult<()> {
        let results = futures::future::join_all(
            instances
                .iter()
                .map(|instance| self.retire(tenant_id, instance, cancel)),
        )
        .await;
        for result in results {
            result?;
        }
        Ok(())
    }

    /// Index into `new_instance_ids` below which instances belong to
    /// completed batches and survive rollback.
    fn rollback_boundary(&self, deployment: &Deployment) -> usize {
        match &deployment.strategy {
            StrategyConfig::Rolling { batch_size } => {
                let done = deployment
                    .completed_batches
                    .saturating_mul((*batch_size).max(1))
                    .min(deployment.target_count) as usize;
                done.min(deployment.new_instance_ids.len())
            }
            // Other strategies complete in one cut-over; any created
            // instance is compensatable until then.
            _ => 0,
        }
    }

    /// On resume, remove instances from an interrupted batch so the
    /// batch restarts cleanly from the cursor.
    async fn resume_cleanup(&self, deployment: &mut Deployment) -> DeployResult<()> {
        let boundary = self.rollback_boundary(deployment);
        if deployment.new_instance_ids.len() <= boundary {
            return Ok(());
        }
        let orphans = deployment.new_instance_ids.split_off(boundary);
        warn!(
            deployment = %deployment.id,
            count = orphans.len(),
            "cleaning up instances from an interrupted batch"
        );
        for id in &orphans {
            self.retire_by_id_best_effort(&deployment.tenant_id, id).await;
        }
        deployment.updated_at = epoch_secs();
        self.state.put_deployment(deployment)?;
        Ok(())
    }

    /// Compensating destroy of new-generation instances past the
    /// cursor boundary. Failures are reported, not propagated, so the
    /// original abort reason is never masked.
    async fn destroy_new_generation(&self, deployment: &mut Deployment, boundary: usize) {
        let doomed: Vec<String> = deployment.new_instance_ids[boundary..].to_vec();
        for id in &doomed {
            self.retire_by_id_best_effort(&deployment.tenant_id, id).await;
        }
        deployment.new_instance_ids.truncate(boundary);
    }

    async fn retire_by_id_best_effort(&self, tenant_id: &str, instance_id: &str) {
        let instance = match self.state.get_instance(tenant_id, instance_id) {
            Ok(Some(instance)) => instance,
            Ok(None) => return,
            Err(e) => {
                warn!(instance = %instance_id, error = %e, "rollback: failed to load instance");
                return;
            }
        };
        if matches!(
            instance.state,
            LifecycleState::Destroyed | LifecycleState::Destroying
        ) {
            return;
        }
        if let Err(e) = self.retire(tenant_id, &instance, &CancelToken::never()).await {
            warn!(instance = %instance_id, error = %e, "rollback: compensating destroy failed");
        }
    }

    /// Roll the deployment back: destroy new-generation instances
    /// past the last completed batch, reset any canary traffic split,
    /// and record the failure reason.
    async fn rollback(&self, deployment: &mut Deployment, reason: String) -> DeployResult<()> {
        let boundary = self.rollback_boundary(deployment);
        self.destroy_new_generation(deployment, boundary).await;

        if matches!(deployment.strategy, StrategyConfig::Canary { .. }) {
            if let Err(e) = self
                .router
                .split(
                    &deployment.tenant_id,
                    &deployment.service,
                    deployment.to_generation,
                    0,
                )
                .await
            {
                warn!(deployment = %deployment.id, error = %e, "rollback: traffic split reset failed");
            }
        }

        self.finish(
            deployment,
            DeploymentState::RolledBack,
            Some(reason),
            types::DEPLOY_ROLLED_BACK,
        )
        .await
    }

    async fn finish(
        &self,
        deployment: &mut Deployment,
        state: DeploymentState,
        reason: Option<String>,
        event_type: &str,
    ) -> DeployResult<()> {
        deployment.state = state;
        deployment.reason = reason;
        deployment.finished_at = Some(epoch_secs());
        deployment.updated_at = epoch_secs();
        self.state.put_deployment(deployment)?;
        let detail = deployment.reason.clone().unwrap_or_else(|| "completed".to_string());
        self.publish_deploy_event(deployment, event_type, &detail).await;
        info!(deployment = %deployment.id, state = ?state, "deployment finished");
        Ok(())
    }

    async fn publish_deploy_event(
        &self,
        deployment: &Deployment,
        event_type: &str,
        reason: &str,
    ) {
        let event = Event::new(
            event_type,
            &deployment.tenant_id,
            EntityKind::Deployment,
            &deployment.id,
        )
        .with_reason(reason);
        if let Err(e) = self.bus.publish(event).await {
            warn!(error = %e, "failed to publish deployment event");
        }
    }
}

fn map_lifecycle(err: LifecycleError) -> DeployError {
    match err {
        LifecycleError::Cancelled(msg) => DeployError::Cancelled(msg),
        other => DeployError::Lifecycle(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};

    use helmplane_core::{CancelSource, EventDefaults};
    use helmplane_event::InMemoryBus;
    use helmplane_provider::{MockProvider, Provider, ProviderRegistry};
    use helmplane_state::ResourceSpec;

    use crate::router::NoopRouter;

    struct Harness {
        state: StateStore,
        lifecycle: Arc<LifecycleManager>,
        bus: Arc<InMemoryBus>,
        router: Arc<NoopRouter>,
        orchestrator: Orchestrator,
        markers: Vec<tokio::task::JoinHandle<()>>,
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            for handle in &self.markers {
                handle.abort();
            }
        }
    }

    fn fast_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.retry.base_backoff = "5ms".to_string();
        config.retry.max_backoff = "20ms".to_string();
        config.lifecycle.ready_timeout = "2s".to_string();
        config.deploy.bake_interval = "20ms".to_string();
        config.deploy.health_wait_timeout = "300ms".to_string();
        config.deploy.soak_interval = "40ms".to_string();
        config
    }

    fn harness() -> Harness {
        let config = fast_config();
        let state = StateStore::open_in_memory().unwrap();
        let provider = Arc::new(MockProvider::new("mock"));
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::clone(&provider) as Arc<dyn Provider>);
        let bus = Arc::new(InMemoryBus::new(&EventDefaults::default()));
        let lifecycle = Arc::new(LifecycleManager::new(
            state.clone(),
            Arc::new(registry),
            Arc::clone(&bus) as Arc<dyn EventBus>,
            &config,
        ));
        let router = Arc::new(NoopRouter::new());
        let orchestrator = Orchestrator::new(
            state.clone(),
            Arc::clone(&lifecycle),
            Arc::clone(&bus) as Arc<dyn EventBus>,
            Arc::clone(&router) as Arc<dyn TrafficRouter>,
            &config,
        );
        Harness {
            state,
            lifecycle,
            bus,
            router,
            orchestrator,
            markers: Vec::new(),
        }
    }

    fn spec(tag: &str) -> InstanceSpec {
        InstanceSpec {
            image: format!("registry.example.com/api:{tag}"),
            command: vec![],
            env: HashMap::new(),
            resources: ResourceSpec::default(),
            replicas: 1,
        }
    }

    /// Seed `count` healthy old-generation (gen 1) instances.
    async fn seed_old(h: &Harness, tenant: &str, service: &str, count: u32) -> Vec<String> {
        let mut ids = Vec::new();
        for _ in 0..count {
            let instance = h
                .lifecycle
                .create_record(tenant, service, "mock", spec("v1"), 1)
                .await
                .unwrap();
            h.lifecycle
                .apply(tenant, &instance.id, Intent::Create, &CancelToken::never())
                .await
                .unwrap();
            h.lifecycle
                .apply_health(tenant, &instance.id, HealthStatus::Healthy)
                .await
                .unwrap();
            ids.push(instance.id);
        }
        ids
    }

    /// Background task standing in for the health monitor: marks
    /// running instances of the given generation healthy, up to an
    /// optional limit.
    fn mark_healthy(
        h: &mut Harness,
        tenant: &str,
        generation: u64,
        limit: Option<usize>,
    ) {
        let state = h.state.clone();
        let lifecycle = Arc::clone(&h.lifecycle);
        let tenant = tenant.to_string();
        let handle = tokio::spawn(async move {
            let mut marked: HashSet<String> = HashSet::new();
            loop {
                if let Ok(instances) = state.list_instances(&tenant) {
                    for instance in instances {
                        if instance.generation != generation
                            || instance.state != LifecycleState::Running
                            || instance.health == HealthStatus::Healthy
                            || marked.contains(&instance.id)
                            || limit.is_some_and(|l| marked.len() >= l)
                        {
                            continue;
                        }
                        let _ = lifecycle
                            .apply_health(&tenant, &instance.id, HealthStatus::Healthy)
                            .await;
                        marked.insert(instance.id);
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        });
        h.markers.push(handle);
    }

    fn count_by(state: &StateStore, tenant: &str, generation: u64, s: LifecycleState) -> usize {
        state
            .list_instances(tenant)
            .unwrap()
            .iter()
            .filter(|i| i.generation == generation && i.state == s)
            .count()
    }

    // ── Rolling ────────────────────────────────────────────────────

    #[tokio::test]
    async fn rolling_ten_instances_in_batches_of_two() {
        let mut h = harness();
        seed_old(&h, "tn_1", "api", 10).await;
        mark_healthy(&mut h, "tn_1", 2, None);

        let deployment = h
            .orchestrator
            .start_deployment(
                "tn_1",
                "api",
                "mock",
                spec("v2"),
                10,
                StrategyConfig::Rolling { batch_size: 2 },
            )
            .await
            .unwrap();
        let state = h
            .orchestrator
            .run("tn_1", &deployment.id, &CancelToken::never())
            .await
            .unwrap();
        assert_eq!(state, DeploymentState::Succeeded);

        let stored = h.state.get_deployment("tn_1", &deployment.id).unwrap().unwrap();
        assert_eq!(stored.completed_batches, 5);
        assert_eq!(stored.new_instance_ids.len(), 10);

        assert_eq!(count_by(&h.state, "tn_1", 2, LifecycleState::Running), 10);
        assert_eq!(count_by(&h.state, "tn_1", 1, LifecycleState::Running), 0);
        assert_eq!(count_by(&h.state, "tn_1", 1, LifecycleState::Destroyed), 10);
    }

    #[tokio::test]
    async fn rolling_emits_batch_events() {
        let mut h = harness();
        seed_old(&h, "tn_1", "api", 4).await;
        mark_healthy(&mut h, "tn_1", 2, None);
        let mut sub = h
            .bus
            .subscribe(EventFilter::tenant("tn_1").with_type_prefix("deploy."))
            .await
            .unwrap();

        let deployment = h
            .orchestrator
            .start_deployment(
                "tn_1",
                "api",
                "mock",
                spec("v2"),
                4,
                StrategyConfig::Rolling { batch_size: 2 },
            )
            .await
            .unwrap();
        h.orchestrator
            .run("tn_1", &deployment.id, &CancelToken::never())
            .await
            .unwrap();

        let mut seen = Vec::new();
        while let Some(event) = sub.try_recv() {
            seen.push(event.event_type);
        }
        assert_eq!(
            seen,
            vec![
                types::DEPLOY_STARTED.to_string(),
                types::DEPLOY_BATCH_COMPLETED.to_string(),
                types::DEPLOY_BATCH_COMPLETED.to_string(),
                types::DEPLOY_SUCCEEDED.to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn rolling_failed_batch_rolls_back_only_that_batch() {
        let mut h = harness();
        let old_ids = seed_old(&h, "tn_1", "api", 4).await;
        // Only the first two new instances ever become healthy, so
        // batch 2 fails its gate.
        mark_healthy(&mut h, "tn_1", 2, Some(2));

        let deployment = h
            .orchestrator
            .start_deployment(
                "tn_1",
                "api",
                "mock",
                spec("v2"),
                4,
                StrategyConfig::Rolling { batch_size: 2 },
            )
            .await
            .unwrap();
        let state = h
            .orchestrator
            .run("tn_1", &deployment.id, &CancelToken::never())
            .await
            .unwrap();
        assert_eq!(state, DeploymentState::RolledBack);

        let stored = h.state.get_deployment("tn_1", &deployment.id).unwrap().unwrap();
        assert_eq!(stored.completed_batches, 1);
        assert!(stored.reason.is_some());
        // Completed batch survives; the failed batch was compensated.
        assert_eq!(stored.new_instance_ids.len(), 2);
        assert_eq!(count_by(&h.state, "tn_1", 2, LifecycleState::Running), 2);
        assert_eq!(count_by(&h.state, "tn_1", 2, LifecycleState::Destroyed), 2);

        // Old generation: batch 1's pair was retired before the
        // failure, the rest is untouched.
        let old_alive: Vec<_> = h
            .state
            .list_instances("tn_1")
            .unwrap()
            .into_iter()
            .filter(|i| i.generation == 1 && i.state == LifecycleState::Running)
            .collect();
        assert_eq!(old_alive.len(), 2);
        assert!(old_alive.iter().all(|i| old_ids.contains(&i.id)));
    }

    // ── Blue-green ─────────────────────────────────────────────────

    #[tokio::test]
    async fn blue_green_switches_then_retires_blue() {
        let mut h = harness();
        seed_old(&h, "tn_1", "api", 3).await;
        mark_healthy(&mut h, "tn_1", 2, None);

        let deployment = h
            .orchestrator
            .start_deployment("tn_1", "api", "mock", spec("v2"), 3, StrategyConfig::BlueGreen)
            .await
            .unwrap();
        let state = h
            .orchestrator
            .run("tn_1", &deployment.id, &CancelToken::never())
            .await
            .unwrap();
        assert_eq!(state, DeploymentState::Succeeded);

        assert_eq!(h.router.calls(), vec!["switch:api:2"]);
        assert_eq!(count_by(&h.state, "tn_1", 2, LifecycleState::Running), 3);
        assert_eq!(count_by(&h.state, "tn_1", 1, LifecycleState::Destroyed), 3);
    }

    // ── Canary ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn canary_promotes_when_healthy() {
        let mut h = harness();
        seed_old(&h, "tn_1", "api", 4).await;
        mark_healthy(&mut h, "tn_1", 2, None);

        let deployment = h
            .orchestrator
            .start_deployment(
                "tn_1",
                "api",
                "mock",
                spec("v2"),
                4,
                StrategyConfig::Canary {
                    percent: 25,
                    error_rate_threshold: 5.0,
                },
            )
            .await
            .unwrap();
        let state = h
            .orchestrator
            .run("tn_1", &deployment.id, &CancelToken::never())
            .await
            .unwrap();
        assert_eq!(state, DeploymentState::Succeeded);

        assert_eq!(h.router.calls(), vec!["split:api:2:25", "switch:api:2"]);
        assert_eq!(count_by(&h.state, "tn_1", 2, LifecycleState::Running), 4);
        assert_eq!(count_by(&h.state, "tn_1", 1, LifecycleState::Destroyed), 4);
    }

    #[tokio::test]
    async fn canary_never_healthy_rolls_back_and_leaves_old_untouched() {
        let h = harness();
        seed_old(&h, "tn_1", "api", 4).await;
        // No health marker: the canary never passes its gate.

        let deployment = h
            .orchestrator
            .start_deployment(
                "tn_1",
                "api",
                "mock",
                spec("v2"),
                4,
                StrategyConfig::Canary {
                    percent: 25,
                    error_rate_threshold: 5.0,
                },
            )
            .await
            .unwrap();
        let state = h
            .orchestrator
            .run("tn_1", &deployment.id, &CancelToken::never())
            .await
            .unwrap();
        assert_eq!(state, DeploymentState::RolledBack);

        // Canary destroyed, original instances untouched, traffic
        // never shifted.
        assert_eq!(count_by(&h.state, "tn_1", 2, LifecycleState::Destroyed), 1);
        assert_eq!(count_by(&h.state, "tn_1", 1, LifecycleState::Running), 4);
        assert!(h.router.calls().is_empty());
    }

    #[tokio::test]
    async fn canary_error_rate_above_threshold_rolls_back() {
        let mut h = harness();
        seed_old(&h, "tn_1", "api", 4).await;
        mark_healthy(&mut h, "tn_1", 2, None);
        h.router.set_error_rate(Some(12.0));

        let deployment = h
            .orchestrator
            .start_deployment(
                "tn_1",
                "api",
                "mock",
                spec("v2"),
                4,
                StrategyConfig::Canary {
                    percent: 25,
                    error_rate_threshold: 5.0,
                },
            )
            .await
            .unwrap();
        let state = h
            .orchestrator
            .run("tn_1", &deployment.id, &CancelToken::never())
            .await
            .unwrap();
        assert_eq!(state, DeploymentState::RolledBack);

        let stored = h.state.get_deployment("tn_1", &deployment.id).unwrap().unwrap();
        assert!(stored.reason.unwrap().contains("error rate"));
        // Traffic split was applied, then reset during rollback.
        assert_eq!(h.router.calls(), vec!["split:api:2:25", "split:api:2:0"]);
        assert_eq!(count_by(&h.state, "tn_1", 1, LifecycleState::Running), 4);
    }

    // ── Recreate ───────────────────────────────────────────────────

    #[tokio::test]
    async fn recreate_tears_down_then_builds() {
        let mut h = harness();
        seed_old(&h, "tn_1", "api", 2).await;
        mark_healthy(&mut h, "tn_1", 2, None);

        let deployment = h
            .orchestrator
            .start_deployment("tn_1", "api", "mock", spec("v2"), 2, StrategyConfig::Recreate)
            .await
            .unwrap();
        let state = h
            .orchestrator
            .run("tn_1", &deployment.id, &CancelToken::never())
            .await
            .unwrap();
        assert_eq!(state, DeploymentState::Succeeded);
        assert_eq!(count_by(&h.state, "tn_1", 2, LifecycleState::Running), 2);
        assert_eq!(count_by(&h.state, "tn_1", 1, LifecycleState::Destroyed), 2);
    }

    // ── Concurrency, resume, cancellation ──────────────────────────

    #[tokio::test]
    async fn second_deployment_for_same_service_conflicts() {
        let h = harness();
        seed_old(&h, "tn_1", "api", 2).await;

        h.orchestrator
            .start_deployment(
                "tn_1",
                "api",
                "mock",
                spec("v2"),
                2,
                StrategyConfig::Rolling { batch_size: 1 },
            )
            .await
            .unwrap();
        let err = h
            .orchestrator
            .start_deployment(
                "tn_1",
                "api",
                "mock",
                spec("v3"),
                2,
                StrategyConfig::Rolling { batch_size: 1 },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DeployError::Conflict(_)));

        // A different service (and a different tenant) are unaffected.
        h.orchestrator
            .start_deployment(
                "tn_1",
                "worker",
                "mock",
                spec("v2"),
                1,
                StrategyConfig::Rolling { batch_size: 1 },
            )
            .await
            .unwrap();
        h.orchestrator
            .start_deployment(
                "tn_2",
                "api",
                "mock",
                spec("v2"),
                1,
                StrategyConfig::Rolling { batch_size: 1 },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn resume_continues_from_batch_cursor() {
        let mut h = harness();
        seed_old(&h, "tn_1", "api", 4).await;
        mark_healthy(&mut h, "tn_1", 2, None);

        let mut deployment = h
            .orchestrator
            .start_deployment(
                "tn_1",
                "api",
                "mock",
                spec("v2"),
                4,
                StrategyConfig::Rolling { batch_size: 2 },
            )
            .await
            .unwrap();

        // Simulate a crash after batch 1 completed: two healthy
        // new-generation instances exist and the cursor points past
        // them.
        let mut batch1 = Vec::new();
        for _ in 0..2 {
            let instance = h
                .lifecycle
                .create_record("tn_1", "api", "mock", spec("v2"), 2)
                .await
                .unwrap();
            h.lifecycle
                .apply("tn_1", &instance.id, Intent::Create, &CancelToken::never())
                .await
                .unwrap();
            batch1.push(instance.id);
        }
        deployment.state = DeploymentState::InProgress;
        deployment.started_at = Some(epoch_secs());
        deployment.completed_batches = 1;
        deployment.new_instance_ids = batch1.clone();
        h.state.put_deployment(&deployment).unwrap();

        let state = h
            .orchestrator
            .run("tn_1", &deployment.id, &CancelToken::never())
            .await
            .unwrap();
        assert_eq!(state, DeploymentState::Succeeded);

        let stored = h.state.get_deployment("tn_1", &deployment.id).unwrap().unwrap();
        assert_eq!(stored.completed_batches, 2);
        assert_eq!(stored.new_instance_ids.len(), 4);
        // Batch 1's instances were reused, not recreated.
        assert!(batch1.iter().all(|id| stored.new_instance_ids.contains(id)));
        assert_eq!(count_by(&h.state, "tn_1", 2, LifecycleState::Running), 4);
        assert_eq!(count_by(&h.state, "tn_1", 1, LifecycleState::Destroyed), 4);
    }

    #[tokio::test]
    async fn cancellation_preserves_progress() {
        let h = harness();
        seed_old(&h, "tn_1", "api", 2).await;

        let deployment = h
            .orchestrator
            .start_deployment(
                "tn_1",
                "api",
                "mock",
                spec("v2"),
                2,
                StrategyConfig::Rolling { batch_size: 1 },
            )
            .await
            .unwrap();

        let (source, token) = CancelSource::new();
        source.cancel();
        let err = h
            .orchestrator
            .run("tn_1", &deployment.id, &token)
            .await
            .unwrap_err();
        assert!(matches!(err, DeployError::Cancelled(_)));

        // Still admitted and resumable, not rolled back.
        let stored = h.state.get_deployment("tn_1", &deployment.id).unwrap().unwrap();
        assert!(stored.state.is_active());
    }

    #[tokio::test]
    async fn run_on_finished_deployment_is_a_noop() {
        let mut h = harness();
        seed_old(&h, "tn_1", "api", 1).await;
        mark_healthy(&mut h, "tn_1", 2, None);

        let deployment = h
            .orchestrator
            .start_deployment(
                "tn_1",
                "api",
                "mock",
                spec("v2"),
                1,
                StrategyConfig::Rolling { batch_size: 1 },
            )
            .await
            .unwrap();
        h.orchestrator
            .run("tn_1", &deployment.id, &CancelToken::never())
            .await
            .unwrap();

        let before = h.state.list_instances("tn_1").unwrap().len();
        let state = h
            .orchestrator
            .run("tn_1", &deployment.id, &CancelToken::never())
            .await
            .unwrap();
        assert_eq!(state, DeploymentState::Succeeded);
        assert_eq!(h.state.list_instances("tn_1").unwrap().len(), before);
    }
}
