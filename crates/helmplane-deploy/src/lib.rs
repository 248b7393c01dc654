//! helmplane-deploy — staged rollouts across instance groups.
//!
//! The [`Orchestrator`] moves a service from generation G to G+1 by
//! sequencing lifecycle operations: create new-generation instances,
//! gate on sustained health, retire the old generation. Strategies
//! differ only in batching and traffic handling:
//!
//! - **Rolling** — replace in batches, health-gated between batches.
//! - **Blue-green** — full parallel set, then one traffic switch.
//! - **Canary** — a fraction first, observe through a soak window,
//!   then promote or roll back.
//! - **Recreate** — tear down, then build; no availability guarantee.
//!
//! Progress is persisted as a batch cursor on the deployment record,
//! so a crashed orchestration resumes from the last completed batch
//! rather than restarting. Rollback destroys only new-generation
//! instances past that cursor; completed batches and the remaining
//! old generation stay untouched.

pub mod error;
pub mod orchestrator;
pub mod router;
pub mod strategy;

pub use error::{DeployError, DeployResult};
pub use orchestrator::Orchestrator;
pub use router::{NoopRouter, TrafficRouter};
