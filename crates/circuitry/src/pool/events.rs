//! Pool change notifications.
//!
//! Subscribers are plain callbacks invoked on the task that mutated the pool,
//! after the slot table lock has been released. Attaching or detaching is
//! safe at any time; a subscriber sees every event published while attached.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use serde::Serialize;

/// A structural change to a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "event", content = "index", rename_all = "lowercase")]
pub enum PoolEvent {
    /// Slot became ready.
    Created(usize),
    /// Ready slot was removed (deleted or leased).
    Deleted(usize),
}

impl PoolEvent {
    pub fn index(&self) -> usize {
        match self {
            PoolEvent::Created(index) | PoolEvent::Deleted(index) => *index,
        }
    }
}

type Callback = Arc<dyn Fn(PoolEvent) + Send + Sync>;
type Subscribers = DashMap<u64, Callback>;

pub(crate) struct EventHub {
    next_id: AtomicU64,
    subscribers: Arc<Subscribers>,
}

impl EventHub {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            subscribers: Arc::new(DashMap::new()),
        }
    }

    pub fn subscribe(&self, callback: Callback) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.insert(id, callback);
        Subscription {
            id,
            subscribers: Arc::downgrade(&self.subscribers),
        }
    }

    pub fn publish(&self, event: PoolEvent) {
        // Snapshot first so a callback may unsubscribe without deadlocking the map.
        let callbacks: Vec<Callback> = self
            .subscribers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for callback in callbacks {
            callback(event);
        }
    }

    #[cfg(test)]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

/// Registration handle; dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    id: u64,
    subscribers: Weak<Subscribers>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(subscribers) = self.subscribers.upgrade() {
            subscribers.remove(&self.id);
        }
    }
}
