//! Channels that carry invalidation signals to cache managers.
//!
//! An [`InvalidationBus`] is created explicitly and handed to every [`CacheManager`] that should
//! listen to it. It owns two broadcast channels that address every tracked key of every
//! listening manager:
//!
//! - "invalidate all" purges persisted records without recomputing them,
//! - "invalidate and update all" purges them and immediately schedules a refresh.
//!
//! Additionally, the bus keeps a registry of named [`Notifier`]s. Producers and consumers of a
//! signal can rendezvous on a name without holding a reference to each other; the channel is
//! created on first use by either side and lives as long as the bus.
//!
//! [`CacheManager`]: crate::CacheManager

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;

use crate::caching::CacheKey;

/// The capacity of every channel created by [`InvalidationBus::default`].
pub const DEFAULT_NOTIFIER_CAPACITY: usize = 64;

/// A signal on a [`Notifier`]: either a specific key, or `None` for every tracked key.
pub type Signal = Option<CacheKey>;

/// A broadcast channel of [`Signal`]s.
///
/// Clones refer to the same channel.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: broadcast::Sender<Signal>,
}

impl Notifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publishes a signal to all current subscribers.
    ///
    /// Signals published while nobody is subscribed are dropped.
    pub fn notify(&self, key: Signal) {
        if self.tx.send(key).is_err() {
            tracing::trace!("Dropping signal without subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Signal> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Whether both handles refer to the same channel.
    pub fn same_channel(&self, other: &Notifier) -> bool {
        self.tx.same_channel(&other.tx)
    }
}

#[derive(Debug)]
struct BusInner {
    capacity: usize,
    invalidate_all: Notifier,
    update_all: Notifier,
    named: Mutex<HashMap<String, Notifier>>,
}

/// An explicitly owned set of invalidation channels.
///
/// Clones refer to the same bus.
#[derive(Debug, Clone)]
pub struct InvalidationBus {
    inner: Arc<BusInner>,
}

impl Default for InvalidationBus {
    fn default() -> Self {
        Self::new(DEFAULT_NOTIFIER_CAPACITY)
    }
}

impl InvalidationBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                capacity,
                invalidate_all: Notifier::new(capacity),
                update_all: Notifier::new(capacity),
                named: Default::default(),
            }),
        }
    }

    /// Purges the persisted records of every key tracked by any listening manager.
    pub fn invalidate_all(&self) {
        self.inner.invalidate_all.notify(None);
    }

    /// Purges and refreshes every key tracked by any listening manager.
    pub fn invalidate_and_update_all(&self) {
        self.inner.update_all.notify(None);
    }

    pub fn invalidate_all_channel(&self) -> &Notifier {
        &self.inner.invalidate_all
    }

    pub fn update_all_channel(&self) -> &Notifier {
        &self.inner.update_all
    }

    /// Returns the named notifier, creating it if this is its first use.
    pub fn notifier(&self, name: &str) -> Notifier {
        let mut named = self.inner.named.lock().unwrap();
        named
            .entry(name.to_owned())
            .or_insert_with(|| {
                tracing::trace!(name, "Creating named notifier");
                Notifier::new(self.inner.capacity)
            })
            .clone()
    }

    /// Publishes a signal on the named notifier.
    pub fn notify(&self, name: &str, key: Signal) {
        self.notifier(name).notify(key);
    }
}
