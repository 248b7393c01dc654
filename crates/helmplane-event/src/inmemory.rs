//! In-process event bus.
//!
//! Each subscription owns a bounded mpsc channel, so delivery paths
//! are isolated: a subscriber that stops draining loses live delivery
//! after the publish timeout but never blocks the publisher or other
//! subscribers. A bounded replay log keeps recent events addressable
//! by sequence number for cursor-restartable subscriptions.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use helmplane_core::EventDefaults;

use crate::bus::{BusError, BusResult, EventBus, Subscription};
use crate::event::{Event, EventFilter};

struct SubEntry {
    id: u64,
    filter: EventFilter,
    tx: mpsc::Sender<Event>,
}

#[derive(Default)]
struct Inner {
    next_sequence: u64,
    next_sub_id: u64,
    log: VecDeque<Event>,
    subs: Vec<SubEntry>,
    closed: bool,
}

/// In-memory bus backend.
pub struct InMemoryBus {
    inner: Arc<Mutex<Inner>>,
    channel_capacity: usize,
    publish_timeout: Duration,
    replay_capacity: usize,
}

impl InMemoryBus {
    /// Create a bus with the given sizing.
    pub fn new(config: &EventDefaults) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                next_sequence: 1,
                ..Inner::default()
            })),
            channel_capacity: config.channel_capacity,
            publish_timeout: config.publish_timeout(),
            replay_capacity: config.replay_log_size,
        }
    }

    /// Number of live subscriptions (for tests and introspection).
    pub fn subscription_count(&self) -> usize {
        self.inner.lock().unwrap().subs.len()
    }

    fn make_subscription(
        &self,
        filter: EventFilter,
        cursor: Option<u64>,
    ) -> BusResult<Subscription> {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return Err(BusError::Closed);
        }

        // Collect replay events first so the channel can be sized to
        // hold all of them plus live headroom.
        let replay: Vec<Event> = match cursor {
            Some(from) => inner
                .log
                .iter()
                .filter(|e| e.sequence >= from && filter.matches(e))
                .cloned()
                .collect(),
            None => Vec::new(),
        };

        let capacity = self.channel_capacity + replay.len();
        let (tx, rx) = mpsc::channel(capacity);
        for event in replay {
            // Cannot fail: the channel was sized for the replay set.
            let _ = tx.try_send(event);
        }

        inner.next_sub_id += 1;
        let id = inner.next_sub_id;
        inner.subs.push(SubEntry { id, filter, tx });
        debug!(subscription = id, "event subscription opened");
        Ok(Subscription { id, rx })
    }
}

#[async_trait]
impl EventBus for InMemoryBus {
    async fn publish(&self, mut event: Event) -> BusResult<u64> {
        // Assign the sequence and snapshot matching subscribers under
        // the lock; all channel sends happen after it is released.
        let (sequence, targets) = {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                return Err(BusError::Closed);
            }
            let sequence = inner.next_sequence;
            inner.next_sequence += 1;
            event.sequence = sequence;

            inner.log.push_back(event.clone());
            while inner.log.len() > self.replay_capacity {
                inner.log.pop_front();
            }

            let targets: Vec<(u64, mpsc::Sender<Event>)> = inner
                .subs
                .iter()
                .filter(|s| s.filter.matches(&event))
                .map(|s| (s.id, s.tx.clone()))
                .collect();
            (sequence, targets)
        };

        let mut dead = Vec::new();
        for (id, tx) in targets {
            match tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(ev)) => {
                    // One bounded wait for a lagging subscriber, then
                    // give up on live delivery; the event stays in the
                    // replay log.
                    match tokio::time::timeout(self.publish_timeout, tx.send(ev)).await {
                        Ok(Ok(())) => {}
                        Ok(Err(_)) => dead.push(id),
                        Err(_) => {
                            warn!(
                                subscription = id,
                                sequence, "subscriber lagging, live delivery skipped"
                            );
                        }
                    }
                }
                Err(mpsc::error::TrySendError::Closed(_)) => dead.push(id),
            }
        }

        if !dead.is_empty() {
            let mut inner = self.inner.lock().unwrap();
            inner.subs.retain(|s| !dead.contains(&s.id));
        }

        Ok(sequence)
    }

    async fn subscribe(&self, filter: EventFilter) -> BusResult<Subscription> {
        self.make_subscription(filter, None)
    }

    async fn subscribe_from(&self, filter: EventFilter, cursor: u64) -> BusResult<Subscription> {
        self.make_subscription(filter, Some(cursor))
    }

    async fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.closed = true;
        // Dropping the senders ends each subscription after it drains.
        inner.subs.clear();
        debug!("event bus closed");
    }
}
