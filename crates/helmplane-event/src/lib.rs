//! helmplane-event — publish/subscribe for lifecycle notifications.
//!
//! Every state transition in the control plane becomes an immutable
//! [`Event`] published through an [`EventBus`]. Delivery guarantees:
//!
//! - Events for a given entity reach a given subscriber in emission
//!   order. No ordering across entities.
//! - At-least-once: subscribers deduplicate by event id (see
//!   [`DedupWindow`]).
//! - Publish never blocks longer than the configured timeout, and a
//!   slow subscriber cannot stall the others — each subscription has
//!   its own bounded channel.
//!
//! Backends are pluggable; [`InMemoryBus`] is the in-process one. Its
//! bounded replay log makes subscriptions restartable from a sequence
//! cursor.

pub mod bus;
pub mod dedup;
pub mod event;
pub mod inmemory;

pub use bus::{BusError, BusResult, EventBus, Subscription};
pub use dedup::DedupWindow;
pub use event::{EntityKind, Event, EventFilter};
pub use inmemory::InMemoryBus;
