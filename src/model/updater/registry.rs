use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use log::*;
use serde::{Deserialize, Serialize};

use crate::data_type::UpdateEvent;

pub const MAILBOX_CAPACITY: usize = 64;

static NEXT_SUBSCRIBER: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubscriberId(u64);

impl std::fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "subscriber-{}", self.0)
    }
}

/// Registry side of a subscription: where to deliver, and a monitor that
/// disconnects once the matching [`Mailbox`] is gone.
#[derive(Debug, Clone)]
pub struct Subscriber {
    id: SubscriberId,
    outbox: Sender<UpdateEvent>,
    monitor: Receiver<()>,
}

impl Subscriber {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn monitor(&self) -> &Receiver<()> {
        &self.monitor
    }
}

/// Subscriber side: the event queue plus the lifeline the registry watches.
#[derive(Debug)]
pub struct Mailbox {
    id: SubscriberId,
    events: Receiver<UpdateEvent>,
    _lifeline: Sender<()>,
}

impl Mailbox {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn events(&self) -> &Receiver<UpdateEvent> {
        &self.events
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<UpdateEvent, RecvTimeoutError> {
        self.events.recv_timeout(timeout)
    }
}

/// New subscription pair. Keep the [`Mailbox`], hand the [`Subscriber`] to
/// the updater; dropping the mailbox unsubscribes.
pub fn subscription() -> (Subscriber, Mailbox) {
    let id = SubscriberId(NEXT_SUBSCRIBER.fetch_add(1, Ordering::Relaxed));
    let (outbox, events) = bounded(MAILBOX_CAPACITY);
    let (lifeline, monitor) = bounded(0);
    (
        Subscriber {
            id,
            outbox,
            monitor,
        },
        Mailbox {
            id,
            events,
            _lifeline: lifeline,
        },
    )
}

/// Subscriber set, owned and mutated by the updater thread only.
#[derive(Debug, Default)]
pub struct SubscriberRegistry {
    subscribers: BTreeMap<SubscriberId, Subscriber>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent; returns whether the subscriber was newly added.
    pub fn subscribe(&mut self, subscriber: Subscriber) -> bool {
        if self.subscribers.contains_key(&subscriber.id) {
            return false;
        }
        debug!("[Registry] {} subscribed", subscriber.id);
        self.subscribers.insert(subscriber.id, subscriber);
        true
    }

    /// Idempotent; returns whether anything was removed.
    pub fn unsubscribe(&mut self, id: SubscriberId) -> bool {
        let removed = self.subscribers.remove(&id).is_some();
        if removed {
            debug!("[Registry] {} unsubscribed", id);
        }
        removed
    }

    pub fn on_liveness_lost(&mut self, id: SubscriberId) -> bool {
        let removed = self.subscribers.remove(&id).is_some();
        if removed {
            info!("[Registry] {} terminated, removed", id);
        }
        removed
    }

    /// Fire-and-forget delivery to every subscriber; never blocks.
    /// Returns how many subscribers accepted the event.
    pub fn broadcast(&self, event: &UpdateEvent) -> usize {
        let mut delivered = 0;
        for subscriber in self.subscribers.values() {
            match subscriber.outbox.try_send(event.clone()) {
                Ok(_) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!("[Registry] {} mailbox full, event dropped", subscriber.id)
                }
                // gone; the liveness monitor cleans it up
                Err(TrySendError::Disconnected(_)) => {}
            }
        }
        delivered
    }

    /// Snapshot of (id, monitor) pairs for the owner's select loop.
    pub fn monitors(&self) -> Vec<(SubscriberId, Receiver<()>)> {
        self.subscribers
            .values()
            .map(|s| (s.id, s.monitor.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }
}
