//! Control plane assembly.
//!
//! The builder takes everything the engine needs — config, state
//! store, providers, bus backend, traffic router, probe factory — and
//! wires the components together: monitor flips feed the lifecycle
//! manager, lifecycle events feed the audit writer and the monitor
//! watcher, and the orchestrator gates on the same bus. No component
//! reaches for a global.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, warn};

use helmplane_core::EngineConfig;
use helmplane_deploy::{NoopRouter, Orchestrator, TrafficRouter};
use helmplane_event::{EventBus, EventFilter, InMemoryBus};
use helmplane_health::{HealthMonitor, Probe};
use helmplane_lifecycle::LifecycleManager;
use helmplane_provider::{Provider, ProviderRegistry};
use helmplane_state::{Instance, StateStore};

use crate::audit::AuditWriter;
use crate::control::ControlPlane;
use crate::error::{ControlError, ControlResult};

/// Chooses the probe for an instance once it starts provisioning.
///
/// Configuration decides probe kinds per workload; the watcher task
/// calls this for every instance entering the monitored window.
pub type ProbeFactory = Arc<dyn Fn(&Instance) -> Arc<dyn Probe> + Send + Sync>;

/// Assembles a [`ControlPlane`] from explicit parts.
pub struct ControlPlaneBuilder {
    config: EngineConfig,
    state: Option<StateStore>,
    providers: Vec<Arc<dyn Provider>>,
    bus: Option<Arc<dyn EventBus>>,
    router: Option<Arc<dyn TrafficRouter>>,
    probe_factory: Option<ProbeFactory>,
}

impl ControlPlaneBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            state: None,
            providers: Vec::new(),
            bus: None,
            router: None,
            probe_factory: None,
        }
    }

    /// Use the given state store (required).
    pub fn with_state(mut self, state: StateStore) -> Self {
        self.state = Some(state);
        self
    }

    /// Register a provider backend. At least one is required.
    pub fn with_provider(mut self, provider: Arc<dyn Provider>) -> Self {
        self.providers.push(provider);
        self
    }

    /// Use a custom event bus backend (defaults to in-process).
    pub fn with_bus(mut self, bus: Arc<dyn EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Use a traffic router (defaults to a no-op router).
    pub fn with_router(mut self, router: Arc<dyn TrafficRouter>) -> Self {
        self.router = Some(router);
        self
    }

    /// Automatically monitor instances with probes from this factory.
    /// Without a factory, monitors are attached explicitly via
    /// [`ControlPlane::watch_instance`].
    pub fn with_probe_factory(mut self, factory: ProbeFactory) -> Self {
        self.probe_factory = Some(factory);
        self
    }

    /// Wire everything together and start the background tasks.
    pub async fn build(self) -> ControlResult<ControlPlane> {
        self.config
            .validate()
            .map_err(|e| ControlError::Validation(e.to_string()))?;
        let state = self
            .state
            .ok_or_else(|| ControlError::Validation("a state store is required".to_string()))?;
        if self.providers.is_empty() {
            return Err(ControlError::Validation(
                "at least one provider is required".to_string(),
            ));
        }

        let mut registry = ProviderRegistry::new();
        for provider in self.providers {
            registry.register(provider);
        }
        let registry = Arc::new(registry);

        let bus: Arc<dyn EventBus> = match self.bus {
            Some(bus) => bus,
            None => Arc::new(InMemoryBus::new(&self.config.event)),
        };
        let router: Arc<dyn TrafficRouter> = match self.router {
            Some(router) => router,
            None => Arc::new(NoopRouter::new()),
        };

        let lifecycle = Arc::new(LifecycleManager::new(
            state.clone(),
            Arc::clone(&registry),
            Arc::clone(&bus),
            &self.config,
        ));

        // Monitor flips drive health transitions in the lifecycle
        // manager (the upward path is events, never a back-reference).
        let callback_lifecycle = Arc::clone(&lifecycle);
        let monitor = Arc::new(
            HealthMonitor::new(state.clone(), self.config.health.clone()).with_callback(
                Arc::new(move |tenant_id, instance_id, status| {
                    let lifecycle = Arc::clone(&callback_lifecycle);
                    Box::pin(async move {
                        if let Err(e) =
                            lifecycle.apply_health(&tenant_id, &instance_id, status).await
                        {
                            warn!(
                                instance = %instance_id,
                                error = %e,
                                "health transition rejected"
                            );
                        }
                    })
                }),
            ),
        );

        let orchestrator = Arc::new(Orchestrator::new(
            state.clone(),
            Arc::clone(&lifecycle),
            Arc::clone(&bus),
            router,
            &self.config,
        ));

        let audit_sub = bus
            .subscribe(AuditWriter::filter())
            .await
            .map_err(|e| ControlError::Validation(format!("audit subscription: {e}")))?;
        let audit = AuditWriter::spawn(state.clone(), audit_sub);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut background = Vec::new();

        background.push(spawn_monitor_watcher(
            Arc::clone(&bus),
            state.clone(),
            Arc::clone(&monitor),
            self.probe_factory.clone(),
            shutdown_rx.clone(),
        )
        .await?);
        background.push(spawn_gc_loop(
            state.clone(),
            self.config.clone(),
            shutdown_rx.clone(),
        ));
        background.push(spawn_escalation_loop(
            state.clone(),
            Arc::clone(&lifecycle),
            shutdown_rx,
        ));

        Ok(ControlPlane::assemble(
            state,
            bus,
            lifecycle,
            orchestrator,
            monitor,
            self.config,
            audit,
            background,
            shutdown_tx,
        ))
    }
}

/// Watch instance events: attach a monitor when provisioning begins,
/// detach it once the instance fails or is destroyed.
async fn spawn_monitor_watcher(
    bus: Arc<dyn EventBus>,
    state: StateStore,
    monitor: Arc<HealthMonitor>,
    probe_factory: Option<ProbeFactory>,
    mut shutdown: watch::Receiver<bool>,
) -> ControlResult<tokio::task::JoinHandle<()>> {
    let mut sub = bus
        .subscribe(EventFilter::all().with_type_prefix("instance."))
        .await
        .map_err(|e| ControlError::Validation(format!("watcher subscription: {e}")))?;

    Ok(tokio::spawn(async move {
        loop {
            tokio::select! {
                event = sub.recv() => {
                    let Some(event) = event else { break };
                    match event.new_state.as_deref() {
                        Some("provisioning") => {
                            let Some(factory) = probe_factory.as_ref() else { continue };
                            match state.get_instance(&event.tenant_id, &event.entity_id) {
                                Ok(Some(instance)) => {
                                    let probe = factory(&instance);
                                    monitor
                                        .start_monitor(&event.tenant_id, &event.entity_id, probe)
                                        .await;
                                }
                                Ok(None) => {}
                                Err(e) => {
                                    warn!(error = %e, "watcher failed to load instance");
                                }
                            }
                        }
                        Some("destroyed") | Some("failed") => {
                            monitor.stop_monitor(&event.entity_id).await;
                        }
                        _ => {}
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        debug!("monitor watcher stopped");
    }))
}

/// Periodically escalate instances stuck in `Degraded` past the
/// configured threshold. The monitor reports a flip only once; the
/// passage of time while degraded is observed here.
fn spawn_escalation_loop(
    state: StateStore,
    lifecycle: Arc<LifecycleManager>,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(15));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let tenants = match state.list_tenants() {
                        Ok(tenants) => tenants,
                        Err(e) => {
                            warn!(error = %e, "escalation sweep failed to list tenants");
                            continue;
                        }
                    };
                    for tenant in tenants {
                        match lifecycle.escalate_degraded(&tenant.id).await {
                            Ok(failed) if !failed.is_empty() => {
                                warn!(tenant = %tenant.id, count = failed.len(), "degraded instances escalated to failed");
                            }
                            Ok(_) => {}
                            Err(e) => warn!(tenant = %tenant.id, error = %e, "escalation sweep failed"),
                        }
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        debug!("escalation loop stopped");
    })
}

/// Periodically remove destroyed instances past their retention window.
fn spawn_gc_loop(
    state: StateStore,
    config: EngineConfig,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let retention = config.lifecycle.destroyed_retention();
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(30));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let cutoff = helmplane_core::epoch_secs().saturating_sub(retention.as_secs());
                    match state.gc_destroyed(cutoff) {
                        Ok(0) => {}
                        Ok(removed) => debug!(removed, "destroyed instances reaped"),
                        Err(e) => warn!(error = %e, "gc sweep failed"),
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        debug!("gc loop stopped");
    })
}
