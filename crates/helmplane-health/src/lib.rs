//! helmplane-health — health checking for managed instances.
//!
//! Provides probe implementations (HTTP, TCP, command, custom RPC),
//! hysteresis tracking, and per-instance monitor loops.
//!
//! # Architecture
//!
//! ```text
//! HealthMonitor
//!   ├── Per-instance background task
//!   │   ├── HealthTracker (consecutive counters, hysteresis, backoff)
//!   │   ├── Probe::check() → ProbeOutcome
//!   │   └── HealthRecord superseded in StateStore (+ flip ring)
//!   └── HealthCallback fired once per status flip
//! ```
//!
//! A status flip requires `unhealthy_threshold` consecutive failures
//! (or `healthy_threshold` consecutive successes) — a single flaky
//! probe never causes a transition, and each flip fires the callback
//! exactly once.

pub mod monitor;
pub mod probe;
pub mod tracker;

pub use monitor::{HealthCallback, HealthMonitor};
pub use probe::{CommandProbe, CustomProbe, HttpProbe, Probe, ProbeOutcome, ProbeStatus, TcpProbe};
pub use tracker::HealthTracker;
