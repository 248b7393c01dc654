//! helmplane-core — shared foundation for the helmplane control plane.
//!
//! Provides prefixed entity id generation, the engine configuration
//! object (built once at startup and passed by reference — there is no
//! process-wide registry), duration/timestamp helpers, and the
//! cancellation token used by every long-running operation.

pub mod cancel;
pub mod config;
pub mod id;
pub mod time;

pub use cancel::{CancelSource, CancelToken};
pub use config::{ConfigError, DeployDefaults, EngineConfig, EventDefaults, HealthDefaults, LifecycleDefaults, RetryConfig};
pub use id::{new_id, IdPrefix};
pub use time::{epoch_millis, epoch_secs, parse_duration};
