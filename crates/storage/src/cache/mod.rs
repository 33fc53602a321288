pub mod memory;

use crate::error::Result;
use common::Key;
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Type-erased cached value.
pub type CachedValue = Arc<dyn Any + Send + Sync>;

#[derive(Clone)]
pub struct CacheEntry {
    pub value:       CachedValue,
    pub captured_at: Instant,
    pub ttl:         Duration,
}

impl CacheEntry {
    pub fn new(value: CachedValue, ttl: Duration) -> Self {
        Self {
            value,
            captured_at: Instant::now(),
            ttl,
        }
    }

    pub fn is_expired_at(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.captured_at) > self.ttl
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Instant::now())
    }
}

impl std::fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEntry")
            .field("captured_at", &self.captured_at)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

/// Keyed storage behind the coordinator.
///
/// Implementations are not synchronized themselves; the coordinator owns the
/// only instance and calls it with its lock held.
pub trait CacheStore: Send + 'static {
    fn init() -> Self;

    /// Returns the live value, removing the entry and failing with
    /// [`Error::CacheExpired`](crate::Error::CacheExpired) when its TTL has passed.
    fn get(&mut self, key: &Key) -> Result<CachedValue>;

    /// Stores or fully replaces the entry for `key`, resetting its capture time.
    fn set(&mut self, key: Key, value: CachedValue, ttl: Duration);

    /// Removes every entry whose key matches `pattern` and returns the removed keys.
    fn remove_matching(&mut self, pattern: &Key) -> Vec<Key>;

    /// Removes every expired entry and returns the removed keys.
    fn remove_expired(&mut self) -> Vec<Key>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
