//! In-memory mock provider.
//!
//! Backs tests and local development. Keeps created units in a map,
//! records every call for assertion, and lets tests script failures
//! per operation.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tracing::debug;

use crate::error::{ProviderError, ProviderResult};
use crate::provider::Provider;
use crate::types::{CreateRequest, ProviderRef, ProviderStatus};

struct Unit {
    req: CreateRequest,
    running: bool,
    replicas: u32,
    restarts: u32,
    ready: bool,
}

#[derive(Default)]
struct MockState {
    units: HashMap<String, Unit>,
    /// Scripted failures per operation name, consumed front-first.
    failures: HashMap<String, VecDeque<ProviderError>>,
    /// Every call as `{op}:{ref-or-id}`.
    calls: Vec<String>,
    next_ref: u64,
}

/// Mock provider holding all state in memory.
pub struct MockProvider {
    name: String,
    state: Mutex<MockState>,
    /// Optional simulated latency range, applied to every call.
    latency: Option<(Duration, Duration)>,
}

impl MockProvider {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(MockState::default()),
            latency: None,
        }
    }

    /// Add simulated latency, uniformly sampled from the given range.
    pub fn with_latency(mut self, min: Duration, max: Duration) -> Self {
        self.latency = Some((min, max));
        self
    }

    /// Script a failure for the next call of `op`
    /// ("create", "start", "stop", "scale", "destroy", "describe").
    /// Multiple injected failures are consumed in order.
    pub fn inject_failure(&self, op: &str, err: ProviderError) {
        let mut state = self.state.lock().unwrap();
        state
            .failures
            .entry(op.to_string())
            .or_default()
            .push_back(err);
    }

    /// Mark a unit as never becoming ready, so describe reports
    /// `ready: false` until cleared.
    pub fn set_ready(&self, provider_ref: &ProviderRef, ready: bool) {
        let mut state = self.state.lock().unwrap();
        if let Some(unit) = state.units.get_mut(provider_ref.as_str()) {
            unit.ready = ready;
        }
    }

    /// Number of recorded calls whose `{op}:{target}` string starts
    /// with the given prefix.
    pub fn call_count(&self, prefix: &str) -> usize {
        let state = self.state.lock().unwrap();
        state.calls.iter().filter(|c| c.starts_with(prefix)).count()
    }

    /// Whether a unit still exists for the ref.
    pub fn has_unit(&self, provider_ref: &ProviderRef) -> bool {
        let state = self.state.lock().unwrap();
        state.units.contains_key(provider_ref.as_str())
    }

    /// Current replica count for the ref, if it exists.
    pub fn replicas(&self, provider_ref: &ProviderRef) -> Option<u32> {
        let state = self.state.lock().unwrap();
        state.units.get(provider_ref.as_str()).map(|u| u.replicas)
    }

    async fn simulate_latency(&self) {
        if let Some((min, max)) = self.latency {
            let delay = if max > min {
                let spread = (max - min).as_millis() as u64;
                min + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
            } else {
                min
            };
            tokio::time::sleep(delay).await;
        }
    }

    fn take_failure(&self, op: &str, target: &str) -> Option<ProviderError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("{op}:{target}"));
        state.failures.get_mut(op).and_then(|q| q.pop_front())
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn create(&self, req: CreateRequest) -> ProviderResult<ProviderRef> {
        self.simulate_latency().await;
        if let Some(err) = self.take_failure("create", &req.instance_id) {
            return Err(err);
        }
        let mut state = self.state.lock().unwrap();
        state.next_ref += 1;
        let provider_ref = format!("{}-unit-{}", self.name, state.next_ref);
        let replicas = req.replicas;
        state.units.insert(
            provider_ref.clone(),
            Unit {
                req,
                running: false,
                replicas,
                restarts: 0,
                ready: true,
            },
        );
        debug!(%provider_ref, "mock unit created");
        Ok(ProviderRef(provider_ref))
    }

    async fn start(&self, provider_ref: &ProviderRef) -> ProviderResult<()> {
        self.simulate_latency().await;
        if let Some(err) = self.take_failure("start", provider_ref.as_str()) {
            return Err(err);
        }
        let mut state = self.state.lock().unwrap();
        match state.units.get_mut(provider_ref.as_str()) {
            Some(unit) => {
                unit.running = true;
                Ok(())
            }
            None => Err(ProviderError::NotFound(provider_ref.to_string())),
        }
    }

    async fn stop(&self, provider_ref: &ProviderRef) -> ProviderResult<()> {
        self.simulate_latency().await;
        if let Some(err) = self.take_failure("stop", provider_ref.as_str()) {
            return Err(err);
        }
        let mut state = self.state.lock().unwrap();
        match state.units.get_mut(provider_ref.as_str()) {
            Some(unit) => {
                unit.running = false;
                Ok(())
            }
            None => Err(ProviderError::NotFound(provider_ref.to_string())),
        }
    }

    async fn scale(&self, provider_ref: &ProviderRef, replicas: u32) -> ProviderResult<()> {
        self.simulate_latency().await;
        if let Some(err) = self.take_failure("scale", provider_ref.as_str()) {
            return Err(err);
        }
        let mut state = self.state.lock().unwrap();
        match state.units.get_mut(provider_ref.as_str()) {
            Some(unit) => {
                unit.replicas = replicas;
                Ok(())
            }
            None => Err(ProviderError::NotFound(provider_ref.to_string())),
        }
    }

    async fn destroy(&self, provider_ref: &ProviderRef) -> ProviderResult<()> {
        self.simulate_latency().await;
        if let Some(err) = self.take_failure("destroy", provider_ref.as_str()) {
            return Err(err);
        }
        let mut state = self.state.lock().unwrap();
        // Destroy is idempotent at the backend: removing a missing unit
        // succeeds.
        state.units.remove(provider_ref.as_str());
        Ok(())
    }

    async fn describe(&self, provider_ref: &ProviderRef) -> ProviderResult<ProviderStatus> {
        self.simulate_latency().await;
        if let Some(err) = self.take_failure("describe", provider_ref.as_str()) {
            return Err(err);
        }
        let state = self.state.lock().unwrap();
        match state.units.get(provider_ref.as_str()) {
            Some(unit) => Ok(ProviderStatus {
                ready: unit.running && unit.ready,
                restarts: unit.restarts,
                message: None,
            }),
            None => Err(ProviderError::NotFound(provider_ref.to_string())),
        }
    }
}
