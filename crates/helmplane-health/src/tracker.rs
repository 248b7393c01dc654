//! Hysteresis tracking for probe results.
//!
//! A status flip requires the configured number of consecutive
//! failures or successes; anything less keeps the reported status
//! unchanged. `Unknown` probe results (timeouts, connection errors)
//! count as failures.

use std::time::Duration;

use tracing::{debug, warn};

use helmplane_core::HealthDefaults;
use helmplane_state::HealthStatus;

use crate::probe::{ProbeOutcome, ProbeStatus};

/// Tracks consecutive probe results for a single instance.
#[derive(Debug)]
pub struct HealthTracker {
    /// Reported status; changes only when a threshold is crossed.
    status: HealthStatus,
    consecutive_failures: u32,
    consecutive_successes: u32,
    unhealthy_threshold: u32,
    healthy_threshold: u32,
    /// Current backoff interval.
    current_backoff: Duration,
    base_interval: Duration,
    max_backoff: Duration,
}

impl HealthTracker {
    /// Create a tracker from the configured defaults.
    pub fn new(config: &HealthDefaults) -> Self {
        Self::with_thresholds(
            config.unhealthy_threshold,
            config.healthy_threshold,
            config.interval(),
        )
    }

    /// Create a tracker with explicit thresholds.
    pub fn with_thresholds(
        unhealthy_threshold: u32,
        healthy_threshold: u32,
        interval: Duration,
    ) -> Self {
        Self {
            status: HealthStatus::Unknown,
            consecutive_failures: 0,
            consecutive_successes: 0,
            unhealthy_threshold: unhealthy_threshold.max(1),
            healthy_threshold: healthy_threshold.max(1),
            current_backoff: interval,
            base_interval: interval,
            max_backoff: Duration::from_secs(60),
        }
    }

    /// Record a probe outcome. Returns `Some(new_status)` when the
    /// reported status flipped, `None` otherwise.
    pub fn record(&mut self, outcome: &ProbeOutcome) -> Option<HealthStatus> {
        match outcome.status {
            ProbeStatus::Healthy => {
                self.consecutive_failures = 0;
                self.consecutive_successes += 1;
                self.current_backoff = self.base_interval;

                if self.consecutive_successes >= self.healthy_threshold
                    && self.status != HealthStatus::Healthy
                {
                    debug!(
                        successes = self.consecutive_successes,
                        "instance recovered to healthy"
                    );
                    self.status = HealthStatus::Healthy;
                    return Some(self.status);
                }
            }
            ProbeStatus::Unhealthy | ProbeStatus::Unknown => {
                self.consecutive_successes = 0;
                self.consecutive_failures += 1;

                // Double the interval up to the cap while failing.
                self.current_backoff = (self.current_backoff * 2).min(self.max_backoff);

                if self.consecutive_failures >= self.unhealthy_threshold
                    && self.status != HealthStatus::Unhealthy
                {
                    warn!(
                        failures = self.consecutive_failures,
                        threshold = self.unhealthy_threshold,
                        "instance marked unhealthy"
                    );
                    self.status = HealthStatus::Unhealthy;
                    return Some(self.status);
                }
            }
        }
        None
    }

    /// Reported status (the one flips are measured against).
    pub fn status(&self) -> HealthStatus {
        self.status
    }

    /// Status for the persisted health record: `Recovering` while an
    /// unhealthy instance has begun passing probes but has not yet
    /// crossed the healthy threshold.
    pub fn detailed_status(&self) -> HealthStatus {
        if self.status == HealthStatus::Unhealthy && self.consecutive_successes > 0 {
            HealthStatus::Recovering
        } else {
            self.status
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn consecutive_successes(&self) -> u32 {
        self.consecutive_successes
    }

    /// Interval before the next check.
    pub fn next_interval(&self) -> Duration {
        self.current_backoff
    }
}
