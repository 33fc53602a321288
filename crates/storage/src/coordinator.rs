use crate::cache::{CacheStore, memory::MemoryCache};
use crate::error::{Error, Result};
use crate::registry::{Observer, ObserverId, ObserverRegistry};
use crate::stats::{CacheStats, CacheStatsSnapshot};
use common::{EngineConfig, Key};
use parking_lot::Mutex;
use std::any::{Any, type_name};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Outcome of [`Coordinator::invalidate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invalidation {
    /// Cache entries removed, in no particular order.
    pub removed:  Vec<Key>,
    /// Observers whose callback ran.
    pub notified: usize,
    pub epoch:    u64,
}

struct State<C> {
    cache:     C,
    observers: ObserverRegistry,
    /// Bumped by every invalidation pass.
    epoch:     u64,
}

struct Shared<C> {
    state:       Mutex<State<C>>,
    stats:       CacheStats,
    default_ttl: Duration,
}

/// Owner of the cache store and the observer registry.
///
/// Every map mutation happens under one lock, so concurrent `read`, `write`
/// and `invalidate` calls are linearizable. Observer callbacks are always
/// dispatched after the lock is released. Cloning is cheap and clones share
/// the same state.
pub struct Coordinator<C = MemoryCache> {
    shared: Arc<Shared<C>>,
}

impl<C> Clone for Coordinator<C> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl Default for Coordinator {
    fn default() -> Self {
        Self::new(&EngineConfig::default())
    }
}

impl Coordinator {
    pub fn new(config: &EngineConfig) -> Self {
        Self::with_cache(config)
    }
}

impl<C: CacheStore> Coordinator<C> {
    pub fn with_cache(config: &EngineConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                state:       Mutex::new(State {
                    cache:     C::init(),
                    observers: ObserverRegistry::new(),
                    epoch:     0,
                }),
                stats:       CacheStats::new(),
                default_ttl: config.default_ttl,
            }),
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.shared.default_ttl
    }

    /// Reads a live cached value.
    ///
    /// Fails with [`Error::CacheMiss`] or [`Error::CacheExpired`] (the expired
    /// entry is removed), or with [`Error::TypeMismatch`] when the entry holds
    /// something other than `T`.
    pub fn read<T>(&self, key: &Key) -> Result<T>
    where
        T: Any + Clone + Send + Sync,
    {
        let lookup = self.shared.state.lock().cache.get(key);
        match lookup {
            Ok(value) => {
                let value = value.downcast_ref::<T>().cloned().ok_or_else(|| {
                    warn!(key = %key, expected = type_name::<T>(), "cached value has unexpected type");
                    Error::TypeMismatch {
                        key:      key.clone(),
                        expected: type_name::<T>(),
                    }
                })?;
                self.shared.stats.record_hit();
                debug!(key = %key, "cache hit");
                Ok(value)
            }
            Err(e @ Error::CacheExpired(_)) => {
                self.shared.stats.record_expiration();
                debug!(key = %key, "cache entry expired");
                Err(e)
            }
            Err(e) => {
                self.shared.stats.record_miss();
                debug!(key = %key, "cache miss");
                Err(e)
            }
        }
    }

    /// Stores `value` under `key`, replacing any previous entry.
    pub fn write<T>(&self, key: Key, value: T, ttl: Duration)
    where
        T: Any + Send + Sync,
    {
        debug!(key = %key, ttl = ?ttl, "cache write");
        self.shared
            .state
            .lock()
            .cache
            .set(key, Arc::new(value), ttl);
        self.shared.stats.record_write();
    }

    /// Stores `value` unless an invalidation pass newer than `since` matched
    /// an observed `key`. Returns whether the value was stored.
    ///
    /// Readers capture [`epoch`](Self::epoch) before they start fetching, so a
    /// value fetched before an invalidation cannot land in the cache after it,
    /// even when the fetch settles before its observer is notified.
    pub fn write_unless_invalidated<T>(&self, key: Key, value: T, ttl: Duration, since: u64) -> bool
    where
        T: Any + Send + Sync,
    {
        {
            let mut state = self.shared.state.lock();
            if state.observers.invalidated_since(&key, since) {
                debug!(key = %key, since, epoch = state.epoch, "rejecting write of invalidated value");
                return false;
            }
            state.cache.set(key.clone(), Arc::new(value), ttl);
        }
        debug!(key = %key, ttl = ?ttl, "cache write");
        self.shared.stats.record_write();
        true
    }

    /// Number of invalidation passes so far.
    pub fn epoch(&self) -> u64 {
        self.shared.state.lock().epoch
    }

    /// Removes every entry matching `pattern`, then notifies every live
    /// observer registered under a matching key.
    ///
    /// The removal, the epoch bump and the observer snapshot happen in one
    /// critical section, so a notified observer that re-reads never sees a
    /// removed value.
    pub fn invalidate(&self, pattern: &Key) -> Invalidation {
        let (removed, notification) = {
            let mut state = self.shared.state.lock();
            state.epoch += 1;
            let epoch = state.epoch;
            let removed = state.cache.remove_matching(pattern);
            let notification = state.observers.collect_matching(pattern, epoch);
            (removed, notification)
        };

        let epoch = notification.epoch();
        info!(
            pattern = %pattern,
            epoch,
            entries = removed.len(),
            observers = notification.len(),
            "invalidating"
        );

        let purged = notification.purged();
        let notified = notification.dispatch();
        self.shared
            .stats
            .record_invalidation(removed.len(), notified, purged);

        Invalidation {
            removed,
            notified,
            epoch,
        }
    }

    pub fn invalidate_all(&self) -> Invalidation {
        self.invalidate(&Key::root())
    }

    pub fn subscribe(&self, observer: &Arc<dyn Observer>, key: Key) -> Result<()> {
        self.shared.state.lock().observers.add(observer, key)
    }

    pub fn unsubscribe(&self, id: ObserverId, key: &Key) -> Result<()> {
        self.shared.state.lock().observers.remove(id, key)
    }

    pub fn is_subscribed(&self, id: ObserverId, key: &Key) -> bool {
        self.shared.state.lock().observers.contains(id, key)
    }

    /// Registrations under exactly `key`.
    pub fn observer_count(&self, key: &Key) -> usize {
        self.shared.state.lock().observers.count(key)
    }

    /// Removes expired entries and dead observer registrations.
    ///
    /// Expired entries are also dropped lazily on read, so this only bounds
    /// memory. Returns the number of cache entries removed.
    pub fn sweep_expired(&self) -> usize {
        let (removed, purged) = {
            let mut state = self.shared.state.lock();
            let removed = state.cache.remove_expired();
            let purged = state.observers.purge_dead();
            (removed.len(), purged)
        };
        self.shared.stats.record_sweep(removed, purged);
        if removed > 0 || purged > 0 {
            debug!(entries = removed, dead_observers = purged, "sweep complete");
        }
        removed
    }

    /// Runs [`sweep_expired`](Self::sweep_expired) every `period` until the
    /// last coordinator handle is dropped.
    pub fn spawn_sweeper(&self, period: Duration) -> JoinHandle<()> {
        let shared = Arc::downgrade(&self.shared);
        info!(period = ?period, "starting cache sweeper");

        tokio::spawn(async move {
            let mut interval = time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // the first tick completes immediately
            interval.tick().await;

            loop {
                interval.tick().await;
                let Some(shared) = shared.upgrade() else {
                    debug!("coordinator dropped, stopping cache sweeper");
                    break;
                };
                Coordinator { shared }.sweep_expired();
            }
        })
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Number of cache entries, expired ones not yet removed included.
    pub fn len(&self) -> usize {
        self.shared.state.lock().cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
