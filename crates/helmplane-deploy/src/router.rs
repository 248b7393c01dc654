//! Traffic routing seam.
//!
//! Shifting traffic between instance generations is an external
//! collaborator operation (a load balancer, service mesh, or edge
//! config). The orchestrator only needs switch, split, and an
//! optional error-rate signal for canary gating.

use std::sync::Mutex;

use async_trait::async_trait;

/// Routing operations the orchestrator drives during rollouts.
#[async_trait]
pub trait TrafficRouter: Send + Sync {
    /// Route all traffic for a service to the given generation.
    async fn switch(&self, tenant_id: &str, service: &str, generation: u64)
        -> anyhow::Result<()>;

    /// Route `percent` of traffic for a service to the given generation.
    async fn split(
        &self,
        tenant_id: &str,
        service: &str,
        generation: u64,
        percent: u32,
    ) -> anyhow::Result<()>;

    /// Observed error rate (percent, 0-100) for traffic hitting the
    /// given generation. `None` when the router has no signal; health
    /// alone then gates canary promotion.
    async fn error_rate(&self, tenant_id: &str, service: &str, generation: u64) -> Option<f64>;
}

/// Router that accepts every operation and reports no error-rate
/// signal. Calls are recorded so tests can assert the sequence.
#[derive(Default)]
pub struct NoopRouter {
    calls: Mutex<Vec<String>>,
    error_rate: Mutex<Option<f64>>,
}

impl NoopRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `error_rate` report a fixed value.
    pub fn set_error_rate(&self, rate: Option<f64>) {
        *self.error_rate.lock().unwrap() = rate;
    }

    /// Recorded calls as `switch:{service}:{generation}` /
    /// `split:{service}:{generation}:{percent}`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl TrafficRouter for NoopRouter {
    async fn switch(
        &self,
        _tenant_id: &str,
        service: &str,
        generation: u64,
    ) -> anyhow::Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("switch:{service}:{generation}"));
        Ok(())
    }

    async fn split(
        &self,
        _tenant_id: &str,
        service: &str,
        generation: u64,
        percent: u32,
    ) -> anyhow::Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("split:{service}:{generation}:{percent}"));
        Ok(())
    }

    async fn error_rate(&self, _tenant_id: &str, _service: &str, _generation: u64) -> Option<f64> {
        *self.error_rate.lock().unwrap()
    }
}
