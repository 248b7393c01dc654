//! The `EventBus` trait and subscription handle.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::event::{Event, EventFilter};

/// Result type alias for bus operations.
pub type BusResult<T> = Result<T, BusError>;

/// Errors from event bus operations.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("event bus closed")]
    Closed,
}

/// Publish/subscribe contract, backend-agnostic.
///
/// Publish assigns the event's sequence number and returns it. It may
/// block up to the backend's configured publish timeout per lagging
/// subscriber, never longer; a subscriber that cannot keep up misses
/// live delivery and re-reads from its cursor.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish an event to all matching subscriptions.
    async fn publish(&self, event: Event) -> BusResult<u64>;

    /// Subscribe to events matching the filter, starting from now.
    async fn subscribe(&self, filter: EventFilter) -> BusResult<Subscription>;

    /// Subscribe starting from a sequence cursor; retained events with
    /// `sequence >= cursor` are replayed before live delivery.
    async fn subscribe_from(&self, filter: EventFilter, cursor: u64) -> BusResult<Subscription>;

    /// Shut down the bus. Subsequent publishes fail; open
    /// subscriptions drain and then end.
    async fn close(&self);
}

/// A live subscription. Dropping it unsubscribes.
pub struct Subscription {
    pub(crate) id: u64,
    pub(crate) rx: mpsc::Receiver<Event>,
}

impl Subscription {
    /// Receive the next event, or `None` once the bus has closed and
    /// the buffer is drained.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }

    /// Identifier of this subscription on its bus.
    pub fn id(&self) -> u64 {
        self.id
    }
}
