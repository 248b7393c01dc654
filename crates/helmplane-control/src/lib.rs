//! helmplane-control — the control plane facade.
//!
//! Composes the state store, provider registry, event bus, health
//! monitor, lifecycle manager, and deployment orchestrator behind
//! tenant-scoped operations. The facade:
//!
//! - enforces tenant quotas before admitting any intent (explicit
//!   quota-exceeded rejections, never silent throttling),
//! - writes an audit entry for every accepted intent, and records
//!   every resulting state transition through a bus subscription,
//! - routes all reads and writes through the store's tenant-scoped
//!   query layer — there is no code path that can construct a
//!   cross-tenant query.
//!
//! Everything is assembled by [`ControlPlaneBuilder`] from an explicit
//! [`EngineConfig`](helmplane_core::EngineConfig); there are no
//! process-wide registries.

pub mod audit;
pub mod builder;
pub mod control;
pub mod error;
pub mod quota;

pub use builder::{ControlPlaneBuilder, ProbeFactory};
pub use control::ControlPlane;
pub use error::{ControlError, ControlResult};
pub use quota::QuotaUsage;
