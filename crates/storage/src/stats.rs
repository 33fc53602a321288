use std::sync::atomic::{AtomicU64, Ordering};

/// Coordinator counters, updated without taking the coordinator lock.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits:                AtomicU64,
    misses:              AtomicU64,
    expirations:         AtomicU64,
    writes:              AtomicU64,
    invalidated_entries: AtomicU64,
    notifications:       AtomicU64,
    dead_observers:      AtomicU64,
    swept_entries:       AtomicU64,
}

/// Point-in-time copy of [`CacheStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStatsSnapshot {
    pub hits:                u64,
    pub misses:              u64,
    pub expirations:         u64,
    pub writes:              u64,
    pub invalidated_entries: u64,
    pub notifications:       u64,
    pub dead_observers:      u64,
    pub swept_entries:       u64,
}

impl CacheStatsSnapshot {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

fn add(counter: &AtomicU64, n: usize) {
    counter.fetch_add(n as u64, Ordering::Relaxed);
}

impl CacheStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        add(&self.hits, 1);
    }

    pub fn record_miss(&self) {
        add(&self.misses, 1);
    }

    /// An expired read counts as a miss too.
    pub fn record_expiration(&self) {
        add(&self.expirations, 1);
        add(&self.misses, 1);
    }

    pub fn record_write(&self) {
        add(&self.writes, 1);
    }

    pub fn record_invalidation(&self, entries: usize, notified: usize, dead: usize) {
        add(&self.invalidated_entries, entries);
        add(&self.notifications, notified);
        add(&self.dead_observers, dead);
    }

    pub fn record_sweep(&self, entries: usize, dead: usize) {
        add(&self.swept_entries, entries);
        add(&self.dead_observers, dead);
    }

    pub fn snapshot(&self) -> CacheStatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        CacheStatsSnapshot {
            hits:                load(&self.hits),
            misses:              load(&self.misses),
            expirations:         load(&self.expirations),
            writes:              load(&self.writes),
            invalidated_entries: load(&self.invalidated_entries),
            notifications:       load(&self.notifications),
            dead_observers:      load(&self.dead_observers),
            swept_entries:       load(&self.swept_entries),
        }
    }
}
