//! Engine configuration.
//!
//! All tunables the control plane does not hard-code: retry budgets,
//! health-check defaults, bake/soak intervals, event bus sizing.
//! Loaded from a TOML file or built from `EngineConfig::default()`;
//! the resulting object is passed by reference into the facade at
//! startup.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::time::parse_duration;

/// Errors produced while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config value: {0}")]
    Invalid(String),
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EngineConfig {
    pub retry: RetryConfig,
    pub health: HealthDefaults,
    pub lifecycle: LifecycleDefaults,
    pub deploy: DeployDefaults,
    pub event: EventDefaults,
}

/// Retry budget for transient provider failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts before a transient failure is escalated.
    pub max_attempts: u32,
    /// First backoff interval, doubled each attempt (e.g. "500ms").
    pub base_backoff: String,
    /// Backoff ceiling (e.g. "30s").
    pub max_backoff: String,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: "500ms".to_string(),
            max_backoff: "30s".to_string(),
        }
    }
}

impl RetryConfig {
    pub fn base_backoff(&self) -> Duration {
        parse_duration(&self.base_backoff).unwrap_or(Duration::from_millis(500))
    }

    pub fn max_backoff(&self) -> Duration {
        parse_duration(&self.max_backoff).unwrap_or(Duration::from_secs(30))
    }
}

/// Defaults for per-instance health checking.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthDefaults {
    /// Probe interval (e.g. "5s").
    pub interval: String,
    /// Per-probe timeout (e.g. "2s").
    pub timeout: String,
    /// Consecutive failures before a flip to unhealthy.
    pub unhealthy_threshold: u32,
    /// Consecutive successes before a flip back to healthy.
    pub healthy_threshold: u32,
    /// Recent status flips retained for flap detection.
    pub flap_ring_size: usize,
}

impl Default for HealthDefaults {
    fn default() -> Self {
        Self {
            interval: "5s".to_string(),
            timeout: "2s".to_string(),
            unhealthy_threshold: 3,
            healthy_threshold: 3,
            flap_ring_size: 8,
        }
    }
}

impl HealthDefaults {
    pub fn interval(&self) -> Duration {
        parse_duration(&self.interval).unwrap_or(Duration::from_secs(5))
    }

    pub fn timeout(&self) -> Duration {
        parse_duration(&self.timeout).unwrap_or(Duration::from_secs(2))
    }
}

/// Instance lifecycle tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleDefaults {
    /// Continuous unhealthy duration before Degraded escalates to Failed.
    pub degraded_timeout: String,
    /// How long a Destroyed record is kept before garbage collection.
    pub destroyed_retention: String,
    /// Deadline for a provider to report an instance ready.
    pub ready_timeout: String,
}

impl Default for LifecycleDefaults {
    fn default() -> Self {
        Self {
            degraded_timeout: "5m".to_string(),
            destroyed_retention: "1h".to_string(),
            ready_timeout: "2m".to_string(),
        }
    }
}

impl LifecycleDefaults {
    pub fn degraded_timeout(&self) -> Duration {
        parse_duration(&self.degraded_timeout).unwrap_or(Duration::from_secs(300))
    }

    pub fn destroyed_retention(&self) -> Duration {
        parse_duration(&self.destroyed_retention).unwrap_or(Duration::from_secs(3600))
    }

    pub fn ready_timeout(&self) -> Duration {
        parse_duration(&self.ready_timeout).unwrap_or(Duration::from_secs(120))
    }
}

/// Deployment orchestration tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeployDefaults {
    /// Observation window after a batch becomes healthy before the
    /// corresponding old instances are destroyed.
    pub bake_interval: String,
    /// Deadline for a new batch to reach healthy.
    pub health_wait_timeout: String,
    /// Canary observation window before promote/rollback.
    pub soak_interval: String,
}

impl Default for DeployDefaults {
    fn default() -> Self {
        Self {
            bake_interval: "30s".to_string(),
            health_wait_timeout: "5m".to_string(),
            soak_interval: "5m".to_string(),
        }
    }
}

impl DeployDefaults {
    pub fn bake_interval(&self) -> Duration {
        parse_duration(&self.bake_interval).unwrap_or(Duration::from_secs(30))
    }

    pub fn health_wait_timeout(&self) -> Duration {
        parse_duration(&self.health_wait_timeout).unwrap_or(Duration::from_secs(300))
    }

    pub fn soak_interval(&self) -> Duration {
        parse_duration(&self.soak_interval).unwrap_or(Duration::from_secs(300))
    }
}

/// Event bus sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventDefaults {
    /// Per-subscription channel capacity.
    pub channel_capacity: usize,
    /// Upper bound on how long publish may block on one subscriber.
    pub publish_timeout: String,
    /// Events retained for cursor replay.
    pub replay_log_size: usize,
}

impl Default for EventDefaults {
    fn default() -> Self {
        Self {
            channel_capacity: 256,
            publish_timeout: "1s".to_string(),
            replay_log_size: 4096,
        }
    }
}

impl EventDefaults {
    pub fn publish_timeout(&self) -> Duration {
        parse_duration(&self.publish_timeout).unwrap_or(Duration::from_secs(1))
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: EngineConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.health.unhealthy_threshold == 0 || self.health.healthy_threshold == 0 {
            return Err(ConfigError::Invalid(
                "health thresholds must be at least 1".to_string(),
            ));
        }
        if self.event.channel_capacity == 0 {
            return Err(ConfigError::Invalid(
                "event.channel_capacity must be at least 1".to_string(),
            ));
        }
        for (name, value) in [
            ("retry.base_backoff", &self.retry.base_backoff),
            ("retry.max_backoff", &self.retry.max_backoff),
            ("health.interval", &self.health.interval),
            ("health.timeout", &self.health.timeout),
            ("lifecycle.degraded_timeout", &self.lifecycle.degraded_timeout),
            ("lifecycle.destroyed_retention", &self.lifecycle.destroyed_retention),
            ("lifecycle.ready_timeout", &self.lifecycle.ready_timeout),
            ("deploy.bake_interval", &self.deploy.bake_interval),
            ("deploy.health_wait_timeout", &self.deploy.health_wait_timeout),
            ("deploy.soak_interval", &self.deploy.soak_interval),
            ("event.publish_timeout", &self.event.publish_timeout),
        ] {
            if parse_duration(value).is_none() {
                return Err(ConfigError::Invalid(format!(
                    "{name}: cannot parse duration {value:?}"
                )));
            }
        }
        Ok(())
    }
}
