use crate::error::{Error, Result};
use common::Key;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObserverId(u64);

impl ObserverId {
    /// Allocates a process-unique id.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ObserverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "observer#{}", self.0)
    }
}

/// Something that wants to hear about invalidation of a key.
pub trait Observer: Send + Sync {
    fn observer_id(&self) -> ObserverId;

    /// Called once per invalidation pass for each registration whose key
    /// matched, with the epoch of that pass. Runs without any coordinator
    /// lock held, so it may re-enter the coordinator.
    fn on_invalidate(&self, key: &Key, epoch: u64);
}

/// Non-owning back reference to an observer.
struct Registration {
    observer: Weak<dyn Observer>,
}

impl Registration {
    fn is_alive(&self) -> bool {
        self.observer.strong_count() > 0
    }

    fn upgrade(&self) -> Option<Arc<dyn Observer>> {
        self.observer.upgrade()
    }
}

#[derive(Default)]
struct Bucket {
    observers:      HashMap<ObserverId, Registration>,
    /// Epoch of the last invalidation pass that matched this key.
    invalidated_at: u64,
}

/// Per-key observer buckets. Buckets never stay empty.
#[derive(Default)]
pub struct ObserverRegistry {
    buckets: HashMap<Key, Bucket>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, observer: &Arc<dyn Observer>, key: Key) -> Result<()> {
        let id = observer.observer_id();
        let bucket = self.buckets.entry(key.clone()).or_default();
        match bucket.observers.entry(id) {
            Entry::Occupied(mut slot) => {
                if slot.get().is_alive() {
                    return Err(Error::ObserverAlreadyRegistered { key, observer: id });
                }
                // a dead registration under the same id is replaced
                slot.insert(Registration {
                    observer: Arc::downgrade(observer),
                });
            }
            Entry::Vacant(slot) => {
                slot.insert(Registration {
                    observer: Arc::downgrade(observer),
                });
            }
        }
        debug!(key = %key, observer = %id, "observer registered");
        Ok(())
    }

    pub fn remove(&mut self, id: ObserverId, key: &Key) -> Result<()> {
        let not_found = || Error::ObserverNotFound {
            key:      key.clone(),
            observer: id,
        };
        let bucket = self.buckets.get_mut(key).ok_or_else(not_found)?;
        bucket.observers.remove(&id).ok_or_else(not_found)?;
        if bucket.observers.is_empty() {
            self.buckets.remove(key);
        }
        debug!(key = %key, observer = %id, "observer removed");
        Ok(())
    }

    /// Stamps every key matching `pattern` with `epoch`, purges dead
    /// registrations under them and snapshots the survivors. Callbacks are
    /// not invoked here, see [`Notification::dispatch`].
    pub fn collect_matching(&mut self, pattern: &Key, epoch: u64) -> Notification {
        let mut targets = Vec::new();
        let mut purged = 0;

        for (key, bucket) in self.buckets.iter_mut() {
            if !key.matches(pattern) {
                continue;
            }
            bucket.invalidated_at = epoch;
            bucket.observers.retain(|id, registration| match registration.upgrade() {
                Some(observer) => {
                    targets.push((key.clone(), observer));
                    true
                }
                None => {
                    warn!(key = %key, observer = %id, "purging dead observer");
                    purged += 1;
                    false
                }
            });
        }
        self.buckets.retain(|_, bucket| !bucket.observers.is_empty());

        Notification {
            targets,
            purged,
            epoch,
        }
    }

    /// Whether an invalidation pass newer than `since` matched `key`.
    pub fn invalidated_since(&self, key: &Key, since: u64) -> bool {
        self.buckets
            .get(key)
            .is_some_and(|bucket| bucket.invalidated_at > since)
    }

    /// Drops every dead registration. Returns how many were removed.
    pub fn purge_dead(&mut self) -> usize {
        let mut purged = 0;
        for bucket in self.buckets.values_mut() {
            let before = bucket.observers.len();
            bucket
                .observers
                .retain(|_, registration| registration.is_alive());
            purged += before - bucket.observers.len();
        }
        self.buckets.retain(|_, bucket| !bucket.observers.is_empty());
        purged
    }

    pub fn contains(&self, id: ObserverId, key: &Key) -> bool {
        self.buckets
            .get(key)
            .is_some_and(|bucket| bucket.observers.contains_key(&id))
    }

    /// Registrations under exactly `key`, dead ones included.
    pub fn count(&self, key: &Key) -> usize {
        self.buckets.get(key).map_or(0, |bucket| bucket.observers.len())
    }

    pub fn len(&self) -> usize {
        self.buckets
            .values()
            .map(|bucket| bucket.observers.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

/// Live observers captured by [`ObserverRegistry::collect_matching`].
pub struct Notification {
    targets: Vec<(Key, Arc<dyn Observer>)>,
    purged:  usize,
    epoch:   u64,
}

impl Notification {
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Dead registrations dropped while collecting.
    pub fn purged(&self) -> usize {
        self.purged
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Invokes each captured observer once. Returns the number notified.
    pub fn dispatch(self) -> usize {
        let count = self.targets.len();
        for (key, observer) in self.targets {
            observer.on_invalidate(&key, self.epoch);
        }
        count
    }
}
