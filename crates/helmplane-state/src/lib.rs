//! helmplane-state — durable, tenant-scoped state for the control plane.
//!
//! Provides typed CRUD over tenants, instances, deployments, health
//! records, and audit entries. All values are JSON-serialized into
//! redb's `&[u8]` value columns; every key begins with the owning
//! tenant id, so a query cannot cross tenants without constructing a
//! foreign key prefix — and no such code path exists.
//!
//! Instances additionally support an atomic compare-and-set on their
//! `(state, generation)` pair, which is how racing health-driven and
//! operator-driven transitions are kept from losing updates.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
