//! The control plane facade.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use helmplane_core::{epoch_secs, new_id, CancelSource, CancelToken, EngineConfig, IdPrefix};
use helmplane_deploy::Orchestrator;
use helmplane_event::{event::types, EntityKind, Event, EventBus};
use helmplane_health::{HealthMonitor, Probe};
use helmplane_lifecycle::{Intent, LifecycleManager};
use helmplane_state::{
    AuditEntry, Deployment, HealthRecord, Instance, InstanceSpec, LifecycleState, Quota,
    StateStore, StrategyConfig, Tenant, TenantStatus,
};

use crate::audit::{intent_entry, AuditWriter};
use crate::error::{ControlError, ControlResult};
use crate::quota::{self, QuotaUsage};

struct DeployTask {
    cancel: CancelSource,
    handle: JoinHandle<()>,
}

/// Tenant-scoped entry point for every control plane operation.
pub struct ControlPlane {
    state: StateStore,
    bus: Arc<dyn EventBus>,
    lifecycle: Arc<LifecycleManager>,
    orchestrator: Arc<Orchestrator>,
    monitor: Arc<HealthMonitor>,
    config: EngineConfig,
    audit: Mutex<Option<AuditWriter>>,
    deploy_tasks: Arc<Mutex<HashMap<String, DeployTask>>>,
    background: Mutex<Vec<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl std::fmt::Debug for ControlPlane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlPlane").finish_non_exhaustive()
    }
}

impl ControlPlane {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn assemble(
        state: StateStore,
        bus: Arc<dyn EventBus>,
        lifecycle: Arc<LifecycleManager>,
        orchestrator: Arc<Orchestrator>,
        monitor: Arc<HealthMonitor>,
        config: EngineConfig,
        audit: AuditWriter,
        background: Vec<JoinHandle<()>>,
        shutdown_tx: watch::Sender<bool>,
    ) -> Self {
        Self {
            state,
            bus,
            lifecycle,
            orchestrator,
            monitor,
            config,
            audit: Mutex::new(Some(audit)),
            deploy_tasks: Arc::new(Mutex::new(HashMap::new())),
            background: Mutex::new(background),
            shutdown_tx,
        }
    }

    /// Engine configuration this plane was built with.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ── Tenant administration ──────────────────────────────────────

    /// Create a tenant with the given quota.
    pub async fn create_tenant(&self, name: &str, quota: Quota) -> ControlResult<Tenant> {
        if name.trim().is_empty() {
            return Err(ControlError::Validation("tenant name must not be empty".to_string()));
        }
        let now = epoch_secs();
        let tenant = Tenant {
            id: new_id(IdPrefix::Tenant),
            name: name.to_string(),
            slug: slugify(name),
            status: TenantStatus::Active,
            plan: "standard".to_string(),
            quota,
            created_at: now,
            updated_at: now,
        };
        self.state.put_tenant(&tenant)?;
        self.state
            .append_audit(&intent_entry(&tenant.id, "operator", "tenant", &tenant.id, "create"))?;
        self.publish(Event::new(
            types::TENANT_CREATED,
            &tenant.id,
            EntityKind::Tenant,
            &tenant.id,
        ))
        .await;
        info!(tenant = %tenant.id, %name, "tenant created");
        Ok(tenant)
    }

    /// Suspend a tenant: existing workloads keep running, but no new
    /// intent is admitted.
    pub async fn suspend_tenant(&self, tenant_id: &str) -> ControlResult<Tenant> {
        let mut tenant = self
            .state
            .get_tenant(tenant_id)?
            .ok_or_else(|| ControlError::NotFound(format!("tenant {tenant_id}")))?;
        tenant.status = TenantStatus::Suspended;
        tenant.updated_at = epoch_secs();
        self.state.put_tenant(&tenant)?;
        self.state
            .append_audit(&intent_entry(tenant_id, "operator", "tenant", tenant_id, "suspend"))?;
        self.publish(Event::new(
            types::TENANT_SUSPENDED,
            tenant_id,
            EntityKind::Tenant,
            tenant_id,
        ))
        .await;
        Ok(tenant)
    }

    /// Get a tenant by id.
    pub fn get_tenant(&self, tenant_id: &str) -> ControlResult<Option<Tenant>> {
        Ok(self.state.get_tenant(tenant_id)?)
    }

    /// Current usage against the tenant's quota.
    pub fn quota_usage(&self, tenant_id: &str) -> ControlResult<(Quota, QuotaUsage)> {
        let tenant = self
            .state
            .get_tenant(tenant_id)?
            .ok_or_else(|| ControlError::NotFound(format!("tenant {tenant_id}")))?;
        let usage = quota::usage(&self.state, tenant_id)?;
        Ok((tenant.quota, usage))
    }

    // ── Instance operations ────────────────────────────────────────

    /// Admit and execute a create intent for a new instance.
    pub async fn create_instance(
        &self,
        tenant_id: &str,
        service: &str,
        provider_name: &str,
        spec: InstanceSpec,
        cancel: &CancelToken,
    ) -> ControlResult<Instance> {
        let tenant = self.ensure_active(tenant_id)?;
        if service.trim().is_empty() {
            return Err(ControlError::Validation("service must not be empty".to_string()));
        }
        if spec.image.trim().is_empty() {
            return Err(ControlError::Validation("image must not be empty".to_string()));
        }
        if spec.replicas == 0 {
            return Err(ControlError::Validation("replicas must be at least 1".to_string()));
        }

        let usage = quota::usage(&self.state, tenant_id)?;
        if let Err(err) = quota::check_instances(&tenant.quota, &usage, 1) {
            self.emit_quota_exceeded(tenant_id, "instances").await;
            return Err(err);
        }

        self.state.append_audit(&intent_entry(
            tenant_id, "operator", "instance", "(new)", "create",
        ))?;

        let instance = self
            .lifecycle
            .create_record(tenant_id, service, provider_name, spec, 1)
            .await?;
        self.lifecycle
            .apply(tenant_id, &instance.id, Intent::Create, cancel)
            .await?;
        Ok(self
            .state
            .get_instance(tenant_id, &instance.id)?
            .unwrap_or(instance))
    }

    /// Start a stopped instance.
    pub async fn start_instance(
        &self,
        tenant_id: &str,
        instance_id: &str,
        cancel: &CancelToken,
    ) -> ControlResult<LifecycleState> {
        self.apply_intent(tenant_id, instance_id, Intent::Start, cancel).await
    }

    /// Stop a running or degraded instance.
    pub async fn stop_instance(
        &self,
        tenant_id: &str,
        instance_id: &str,
        cancel: &CancelToken,
    ) -> ControlResult<LifecycleState> {
        self.apply_intent(tenant_id, instance_id, Intent::Stop, cancel).await
    }

    /// Stop-then-start an instance.
    pub async fn restart_instance(
        &self,
        tenant_id: &str,
        instance_id: &str,
        cancel: &CancelToken,
    ) -> ControlResult<LifecycleState> {
        self.apply_intent(tenant_id, instance_id, Intent::Restart, cancel).await
    }

    /// Adjust the compute units behind an instance.
    pub async fn scale_instance(
        &self,
        tenant_id: &str,
        instance_id: &str,
        replicas: u32,
        cancel: &CancelToken,
    ) -> ControlResult<LifecycleState> {
        self.apply_intent(tenant_id, instance_id, Intent::Scale { replicas }, cancel)
            .await
    }

    /// Tear an instance down.
    pub async fn destroy_instance(
        &self,
        tenant_id: &str,
        instance_id: &str,
        cancel: &CancelToken,
    ) -> ControlResult<LifecycleState> {
        let state = self
            .apply_intent(tenant_id, instance_id, Intent::Destroy, cancel)
            .await?;
        self.monitor.stop_monitor(instance_id).await;
        Ok(state)
    }

    async fn apply_intent(
        &self,
        tenant_id: &str,
        instance_id: &str,
        intent: Intent,
        cancel: &CancelToken,
    ) -> ControlResult<LifecycleState> {
        self.ensure_active(tenant_id)?;
        self.state.append_audit(&intent_entry(
            tenant_id,
            "operator",
            "instance",
            instance_id,
            intent.name(),
        ))?;
        Ok(self
            .lifecycle
            .apply(tenant_id, instance_id, intent, cancel)
            .await?)
    }

    /// Get an instance (tenant-scoped).
    pub fn get_instance(
        &self,
        tenant_id: &str,
        instance_id: &str,
    ) -> ControlResult<Instance> {
        self.state
            .get_instance(tenant_id, instance_id)?
            .ok_or_else(|| ControlError::NotFound(format!("{tenant_id}/{instance_id}")))
    }

    /// List a tenant's instances.
    pub fn list_instances(&self, tenant_id: &str) -> ControlResult<Vec<Instance>> {
        Ok(self.state.list_instances(tenant_id)?)
    }

    /// List a tenant's instances for one service.
    pub fn list_service_instances(
        &self,
        tenant_id: &str,
        service: &str,
    ) -> ControlResult<Vec<Instance>> {
        Ok(self.state.list_instances_for_service(tenant_id, service)?)
    }

    /// Last-known health record for an instance.
    pub fn instance_health(
        &self,
        tenant_id: &str,
        instance_id: &str,
    ) -> ControlResult<Option<HealthRecord>> {
        Ok(self.state.get_health(tenant_id, instance_id)?)
    }

    /// Attach a health monitor to an instance with an explicit probe.
    pub async fn watch_instance(
        &self,
        tenant_id: &str,
        instance_id: &str,
        probe: Arc<dyn Probe>,
    ) -> ControlResult<()> {
        // Scoped load proves the instance belongs to the tenant.
        self.get_instance(tenant_id, instance_id)?;
        self.monitor.start_monitor(tenant_id, instance_id, probe).await;
        Ok(())
    }

    /// Recent audit entries for a tenant.
    pub fn list_audit(&self, tenant_id: &str, limit: usize) -> ControlResult<Vec<AuditEntry>> {
        Ok(self.state.list_audit(tenant_id, limit)?)
    }

    /// Instance ids with an active health monitor.
    pub async fn monitored_instances(&self) -> Vec<String> {
        self.monitor.active_monitors().await
    }

    // ── Deployments ────────────────────────────────────────────────

    /// Admit a deployment and start its orchestration worker.
    pub async fn deploy(
        &self,
        tenant_id: &str,
        service: &str,
        provider_name: &str,
        target_spec: InstanceSpec,
        target_count: u32,
        strategy: StrategyConfig,
    ) -> ControlResult<Deployment> {
        let tenant = self.ensure_active(tenant_id)?;

        let usage = quota::usage(&self.state, tenant_id)?;
        if let Err(err) = quota::check_deployments(&tenant.quota, &usage) {
            self.emit_quota_exceeded(tenant_id, "deployments").await;
            return Err(err);
        }
        // Worst case both generations exist side by side.
        if let Err(err) = quota::check_instances(&tenant.quota, &usage, target_count) {
            self.emit_quota_exceeded(tenant_id, "instances").await;
            return Err(err);
        }

        self.state.append_audit(&intent_entry(
            tenant_id, "operator", "deployment", service, "deploy",
        ))?;

        let deployment = self
            .orchestrator
            .start_deployment(
                tenant_id,
                service,
                provider_name,
                target_spec,
                target_count,
                strategy,
            )
            .await?;
        self.spawn_deployment_worker(&deployment).await;
        Ok(deployment)
    }

    /// Current state of a deployment.
    pub fn deployment_status(
        &self,
        tenant_id: &str,
        deployment_id: &str,
    ) -> ControlResult<Deployment> {
        self.state
            .get_deployment(tenant_id, deployment_id)?
            .ok_or_else(|| ControlError::NotFound(format!("{tenant_id}/{deployment_id}")))
    }

    /// Resume an interrupted deployment (e.g. after a restart).
    pub async fn resume_deployment(
        &self,
        tenant_id: &str,
        deployment_id: &str,
    ) -> ControlResult<Deployment> {
        let deployment = self.deployment_status(tenant_id, deployment_id)?;
        if !deployment.state.is_active() {
            return Err(ControlError::Conflict(format!(
                "deployment {deployment_id} already finished"
            )));
        }
        self.state.append_audit(&intent_entry(
            tenant_id, "operator", "deployment", deployment_id, "resume",
        ))?;
        self.spawn_deployment_worker(&deployment).await;
        Ok(deployment)
    }

    /// Cancel a running deployment. In-flight waits abort; the batch
    /// cursor is preserved for a later resume.
    pub async fn cancel_deployment(
        &self,
        tenant_id: &str,
        deployment_id: &str,
    ) -> ControlResult<()> {
        self.deployment_status(tenant_id, deployment_id)?;
        self.state.append_audit(&intent_entry(
            tenant_id, "operator", "deployment", deployment_id, "cancel",
        ))?;
        let tasks = self.deploy_tasks.lock().await;
        if let Some(task) = tasks.get(deployment_id) {
            task.cancel.cancel();
        }
        Ok(())
    }

    async fn spawn_deployment_worker(&self, deployment: &Deployment) {
        let (cancel_source, cancel_token) = CancelSource::new();
        let orchestrator = Arc::clone(&self.orchestrator);
        let tasks = Arc::clone(&self.deploy_tasks);
        let tenant_id = deployment.tenant_id.clone();
        let deployment_id = deployment.id.clone();

        let worker_id = deployment_id.clone();
        let handle = tokio::spawn(async move {
            match orchestrator.run(&tenant_id, &worker_id, &cancel_token).await {
                Ok(state) => {
                    info!(deployment = %worker_id, final_state = ?state, "deployment worker finished");
                }
                Err(e) => {
                    warn!(deployment = %worker_id, error = %e, "deployment worker stopped");
                }
            }
            tasks.lock().await.remove(&worker_id);
        });

        self.deploy_tasks.lock().await.insert(
            deployment_id,
            DeployTask {
                cancel: cancel_source,
                handle,
            },
        );
    }

    // ── Shutdown ───────────────────────────────────────────────────

    /// Stop background workers and close the bus. Instance and
    /// deployment state remain durable in the store.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);

        let mut tasks = self.deploy_tasks.lock().await;
        for (id, task) in tasks.drain() {
            task.cancel.cancel();
            task.handle.abort();
            info!(deployment = %id, "deployment worker cancelled for shutdown");
        }
        drop(tasks);

        self.monitor.stop_all().await;
        for handle in self.background.lock().await.drain(..) {
            handle.abort();
        }
        if let Some(audit) = self.audit.lock().await.take() {
            audit.stop();
        }
        self.bus.close().await;
        info!("control plane shut down");
    }

    // ── Internals ──────────────────────────────────────────────────

    fn ensure_active(&self, tenant_id: &str) -> ControlResult<Tenant> {
        let tenant = self
            .state
            .get_tenant(tenant_id)?
            .ok_or_else(|| ControlError::NotFound(format!("tenant {tenant_id}")))?;
        match tenant.status {
            TenantStatus::Active => Ok(tenant),
            TenantStatus::Suspended => Err(ControlError::TenantSuspended(tenant_id.to_string())),
            TenantStatus::Deleted => Err(ControlError::NotFound(format!("tenant {tenant_id}"))),
        }
    }

    async fn emit_quota_exceeded(&self, tenant_id: &str, resource: &str) {
        self.publish(
            Event::new(types::QUOTA_EXCEEDED, tenant_id, EntityKind::Tenant, tenant_id)
                .with_reason(resource),
        )
        .await;
    }

    async fn publish(&self, event: Event) {
        if let Err(e) = self.bus.publish(event).await {
            warn!(error = %e, "failed to publish control event");
        }
    }
}

fn slugify(name: &str) -> String {
    name.trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use helmplane_event::{EventFilter, InMemoryBus};
    use helmplane_health::{CustomProbe, ProbeOutcome, ProbeStatus};
    use helmplane_provider::MockProvider;
    use helmplane_state::{DeploymentState, ResourceSpec};

    use crate::builder::ControlPlaneBuilder;

    fn fast_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.retry.base_backoff = "5ms".to_string();
        config.retry.max_backoff = "20ms".to_string();
        config.lifecycle.ready_timeout = "2s".to_string();
        config.health.interval = "10ms".to_string();
        config.health.healthy_threshold = 2;
        config.health.unhealthy_threshold = 2;
        config.deploy.bake_interval = "20ms".to_string();
        config.deploy.health_wait_timeout = "2s".to_string();
        config.deploy.soak_interval = "40ms".to_string();
        config
    }

    fn probe_with(status: ProbeStatus) -> Arc<dyn Probe> {
        Arc::new(CustomProbe::new(move || async move {
            ProbeOutcome {
                status,
                latency: Duration::from_millis(1),
                detail: None,
            }
        }))
    }

    struct TestPlane {
        plane: ControlPlane,
        provider: Arc<MockProvider>,
        bus: Arc<InMemoryBus>,
    }

    async fn plane_with_probe(status: ProbeStatus) -> TestPlane {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("warn")
            .try_init();
        let provider = Arc::new(MockProvider::new("mock"));
        let bus = Arc::new(InMemoryBus::new(&fast_config().event));
        let plane = ControlPlaneBuilder::new(fast_config())
            .with_state(StateStore::open_in_memory().unwrap())
            .with_provider(Arc::clone(&provider) as Arc<dyn helmplane_provider::Provider>)
            .with_bus(Arc::clone(&bus) as Arc<dyn EventBus>)
            .with_probe_factory(Arc::new(move |_instance| probe_with(status)))
            .build()
            .await
            .unwrap();
        TestPlane {
            plane,
            provider,
            bus,
        }
    }

    async fn plane() -> TestPlane {
        plane_with_probe(ProbeStatus::Healthy).await
    }

    fn spec(tag: &str) -> InstanceSpec {
        InstanceSpec {
            image: format!("registry.example.com/api:{tag}"),
            command: vec![],
            env: std::collections::HashMap::new(),
            resources: ResourceSpec::default(),
            replicas: 1,
        }
    }

    async fn wait_terminal(
        plane: &ControlPlane,
        tenant_id: &str,
        deployment_id: &str,
    ) -> DeploymentState {
        for _ in 0..200 {
            let deployment = plane.deployment_status(tenant_id, deployment_id).unwrap();
            if !deployment.state.is_active() {
                return deployment.state;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("deployment never reached a terminal state");
    }

    // ── Assembly ───────────────────────────────────────────────────

    #[tokio::test]
    async fn builder_requires_state_and_provider() {
        let err = ControlPlaneBuilder::new(fast_config()).build().await.unwrap_err();
        assert!(matches!(err, ControlError::Validation(_)));

        let err = ControlPlaneBuilder::new(fast_config())
            .with_state(StateStore::open_in_memory().unwrap())
            .build()
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::Validation(_)));
    }

    // ── Tenant administration ──────────────────────────────────────

    #[tokio::test]
    async fn suspended_tenant_is_rejected() {
        let t = plane().await;
        let tenant = t.plane.create_tenant("Acme Corp", Quota::default()).await.unwrap();
        assert_eq!(tenant.slug, "acme-corp");

        t.plane.suspend_tenant(&tenant.id).await.unwrap();
        let err = t
            .plane
            .create_instance(&tenant.id, "api", "mock", spec("v1"), &CancelToken::never())
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::TenantSuspended(_)));
        t.plane.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_tenant_is_not_found() {
        let t = plane().await;
        let err = t
            .plane
            .create_instance("tn_missing", "api", "mock", spec("v1"), &CancelToken::never())
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::NotFound(_)));
        t.plane.shutdown().await;
    }

    // ── Instance operations ────────────────────────────────────────

    #[tokio::test]
    async fn create_instance_reaches_running_and_audits() {
        let t = plane().await;
        let tenant = t.plane.create_tenant("Acme", Quota::default()).await.unwrap();

        let instance = t
            .plane
            .create_instance(&tenant.id, "api", "mock", spec("v1"), &CancelToken::never())
            .await
            .unwrap();
        assert_eq!(instance.state, LifecycleState::Running);
        assert_eq!(t.provider.call_count("create:"), 1);

        // The audit writer records the intent synchronously and the
        // transitions asynchronously.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let entries = t.plane.list_audit(&tenant.id, 50).unwrap();
        assert!(entries.iter().any(|e| e.action == "create"));
        assert!(entries.iter().any(|e| e.action == "instance.started"));
        t.plane.shutdown().await;
    }

    #[tokio::test]
    async fn instance_quota_is_enforced() {
        let t = plane().await;
        let quota = Quota {
            max_instances: 1,
            ..Quota::default()
        };
        let tenant = t.plane.create_tenant("Small", quota).await.unwrap();
        let mut sub = t
            .bus
            .subscribe(EventFilter::tenant(&tenant.id).with_type_prefix("quota."))
            .await
            .unwrap();

        t.plane
            .create_instance(&tenant.id, "api", "mock", spec("v1"), &CancelToken::never())
            .await
            .unwrap();
        let err = t
            .plane
            .create_instance(&tenant.id, "api", "mock", spec("v1"), &CancelToken::never())
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::QuotaExceeded(_)));

        let event = sub.recv().await.unwrap();
        assert_eq!(event.event_type, types::QUOTA_EXCEEDED);
        t.plane.shutdown().await;
    }

    #[tokio::test]
    async fn tenants_cannot_reach_each_others_instances() {
        let t = plane().await;
        let tenant_a = t.plane.create_tenant("A", Quota::default()).await.unwrap();
        let tenant_b = t.plane.create_tenant("B", Quota::default()).await.unwrap();

        let instance = t
            .plane
            .create_instance(&tenant_a.id, "api", "mock", spec("v1"), &CancelToken::never())
            .await
            .unwrap();

        assert!(t.plane.get_instance(&tenant_b.id, &instance.id).is_err());
        assert!(t.plane.list_instances(&tenant_b.id).unwrap().is_empty());
        let err = t
            .plane
            .stop_instance(&tenant_b.id, &instance.id, &CancelToken::never())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ControlError::NotFound(_) | ControlError::Lifecycle(_)
        ));
        t.plane.shutdown().await;
    }

    #[tokio::test]
    async fn monitor_attaches_on_create_and_detaches_on_destroy() {
        let t = plane().await;
        let tenant = t.plane.create_tenant("Acme", Quota::default()).await.unwrap();

        let instance = t
            .plane
            .create_instance(&tenant.id, "api", "mock", spec("v1"), &CancelToken::never())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(t.plane.monitored_instances().await.contains(&instance.id));

        // Monitor-driven probes produce a health record.
        let record = t.plane.instance_health(&tenant.id, &instance.id).unwrap();
        assert!(record.is_some());

        t.plane
            .stop_instance(&tenant.id, &instance.id, &CancelToken::never())
            .await
            .unwrap();
        t.plane
            .destroy_instance(&tenant.id, &instance.id, &CancelToken::never())
            .await
            .unwrap();
        assert!(!t.plane.monitored_instances().await.contains(&instance.id));
        t.plane.shutdown().await;
    }

    // ── Deployments through the facade ─────────────────────────────

    #[tokio::test]
    async fn rolling_deploy_end_to_end() {
        let t = plane().await;
        let tenant = t.plane.create_tenant("Acme", Quota::default()).await.unwrap();
        for _ in 0..2 {
            t.plane
                .create_instance(&tenant.id, "api", "mock", spec("v1"), &CancelToken::never())
                .await
                .unwrap();
        }

        let deployment = t
            .plane
            .deploy(
                &tenant.id,
                "api",
                "mock",
                spec("v2"),
                2,
                StrategyConfig::Rolling { batch_size: 1 },
            )
            .await
            .unwrap();
        let state = wait_terminal(&t.plane, &tenant.id, &deployment.id).await;
        assert_eq!(state, DeploymentState::Succeeded);

        let instances = t.plane.list_service_instances(&tenant.id, "api").unwrap();
        let running_v2 = instances
            .iter()
            .filter(|i| i.generation == 2 && i.state == LifecycleState::Running)
            .count();
        assert_eq!(running_v2, 2);
        t.plane.shutdown().await;
    }

    #[tokio::test]
    async fn deploy_quota_limits_concurrency() {
        let t = plane().await;
        let quota = Quota {
            max_concurrent_deploys: 0,
            ..Quota::default()
        };
        let tenant = t.plane.create_tenant("Locked", quota).await.unwrap();

        let err = t
            .plane
            .deploy(
                &tenant.id,
                "api",
                "mock",
                spec("v1"),
                1,
                StrategyConfig::Rolling { batch_size: 1 },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::QuotaExceeded(_)));
        t.plane.shutdown().await;
    }

    #[tokio::test]
    async fn cancelled_deployment_stays_resumable() {
        // Probes never pass, so the deployment parks in its health
        // wait until cancelled.
        let t = plane_with_probe(ProbeStatus::Unhealthy).await;
        let tenant = t.plane.create_tenant("Acme", Quota::default()).await.unwrap();

        let deployment = t
            .plane
            .deploy(
                &tenant.id,
                "api",
                "mock",
                spec("v1"),
                1,
                StrategyConfig::Rolling { batch_size: 1 },
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        t.plane
            .cancel_deployment(&tenant.id, &deployment.id)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let stored = t.plane.deployment_status(&tenant.id, &deployment.id).unwrap();
        assert!(stored.state.is_active());
        t.plane.shutdown().await;
    }
}
