//! Health monitor — one background check loop per instance.
//!
//! Each loop probes its instance, feeds the result through a
//! [`HealthTracker`], supersedes the instance's `HealthRecord` in the
//! state store, and fires the status-change callback exactly once per
//! flip. Loops are started when an instance begins provisioning and
//! stopped when it reaches a terminal state.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use helmplane_core::{epoch_secs, HealthDefaults};
use helmplane_state::{HealthRecord, HealthStatus, StateStore};

use crate::probe::Probe;
use crate::tracker::HealthTracker;

/// Callback invoked when an instance's health status flips.
///
/// Receives `(tenant_id, instance_id, new_status)`. The lifecycle
/// manager registers this to drive `HealthChanged` transitions.
pub type HealthCallback =
    Arc<dyn Fn(String, String, HealthStatus) -> BoxFuture + Send + Sync>;

type BoxFuture = std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>;

/// Per-instance monitor state.
struct MonitorSlot {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

/// Manages health check loops for all monitored instances.
pub struct HealthMonitor {
    state: StateStore,
    config: HealthDefaults,
    /// Active monitors: instance_id → slot.
    monitors: Arc<RwLock<HashMap<String, MonitorSlot>>>,
    /// Optional callback fired on each status flip.
    on_status_change: Option<HealthCallback>,
}

impl HealthMonitor {
    pub fn new(state: StateStore, config: HealthDefaults) -> Self {
        Self {
            state,
            config,
            monitors: Arc::new(RwLock::new(HashMap::new())),
            on_status_change: None,
        }
    }

    /// Set a callback for health status flips.
    pub fn with_callback(mut self, callback: HealthCallback) -> Self {
        self.on_status_change = Some(callback);
        self
    }

    /// Start monitoring an instance with the given probe.
    ///
    /// Replaces any monitor already running for the instance.
    pub async fn start_monitor(
        &self,
        tenant_id: &str,
        instance_id: &str,
        probe: Arc<dyn Probe>,
    ) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let tenant = tenant_id.to_string();
        let instance = instance_id.to_string();
        let state = self.state.clone();
        let config = self.config.clone();
        let callback = self.on_status_change.clone();

        let handle = tokio::spawn(async move {
            run_check_loop(&tenant, &instance, probe, state, config, callback, shutdown_rx)
                .await;
        });

        let mut monitors = self.monitors.write().await;
        if let Some(old) = monitors.insert(
            instance_id.to_string(),
            MonitorSlot {
                handle,
                shutdown_tx,
            },
        ) {
            let _ = old.shutdown_tx.send(true);
            old.handle.abort();
        }

        info!(%instance_id, "health monitor started");
    }

    /// Stop monitoring an instance.
    pub async fn stop_monitor(&self, instance_id: &str) {
        let mut monitors = self.monitors.write().await;
        if let Some(slot) = monitors.remove(instance_id) {
            let _ = slot.shutdown_tx.send(true);
            slot.handle.abort();
            info!(%instance_id, "health monitor stopped");
        }
    }

    /// Stop all monitors (for graceful shutdown).
    pub async fn stop_all(&self) {
        let mut monitors = self.monitors.write().await;
        for (id, slot) in monitors.drain() {
            let _ = slot.shutdown_tx.send(true);
            slot.handle.abort();
            debug!(instance_id = %id, "health monitor stopped");
        }
        info!("all health monitors stopped");
    }

    /// Instance ids with active monitors.
    pub async fn active_monitors(&self) -> Vec<String> {
        let monitors = self.monitors.read().await;
        monitors.keys().cloned().collect()
    }

    /// Whether an instance has an active monitor.
    pub async fn is_monitoring(&self, instance_id: &str) -> bool {
        let monitors = self.monitors.read().await;
        monitors.contains_key(instance_id)
    }
}

/// The check loop for a single instance.
async fn run_check_loop(
    tenant_id: &str,
    instance_id: &str,
    probe: Arc<dyn Probe>,
    state: StateStore,
    config: HealthDefaults,
    callback: Option<HealthCallback>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tracker = HealthTracker::new(&config);
    let mut flip_ring: Vec<u64> = Vec::new();

    debug!(%instance_id, "health loop starting");

    loop {
        let interval = tracker.next_interval();

        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                let outcome = probe.check().await;
                let flipped = tracker.record(&outcome);
                let now = epoch_secs();

                let mut record = HealthRecord {
                    instance_id: instance_id.to_string(),
                    tenant_id: tenant_id.to_string(),
                    status: tracker.detailed_status(),
                    consecutive_failures: tracker.consecutive_failures(),
                    consecutive_successes: tracker.consecutive_successes(),
                    latency_ms: Some(outcome.latency.as_millis() as u64),
                    detail: outcome.detail.clone(),
                    checked_at: now,
                    recent_flips: flip_ring.clone(),
                };
                if flipped.is_some() {
                    record.push_flip(now, config.flap_ring_size);
                    flip_ring = record.recent_flips.clone();
                }

                if let Err(e) = state.put_health(&record) {
                    error!(%instance_id, error = %e, "failed to store health record");
                }

                if let (Some(new_status), Some(cb)) = (flipped, callback.as_ref()) {
                    cb(
                        tenant_id.to_string(),
                        instance_id.to_string(),
                        new_status,
                    )
                    .await;
                }
            }
            _ = shutdown.changed() => {
                debug!(%instance_id, "health loop shutting down");
                break;
            }
        }
    }
}
