use crate::cache::{CacheEntry, CacheStore, CachedValue};
use crate::error::{Error, Result};
use common::Key;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Hash-map backed [`CacheStore`].
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: HashMap<Key, CacheEntry>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.entries.contains_key(key)
    }
}

impl CacheStore for MemoryCache {
    fn init() -> Self {
        Self::new()
    }

    fn get(&mut self, key: &Key) -> Result<CachedValue> {
        let entry = self
            .entries
            .get(key)
            .ok_or_else(|| Error::CacheMiss(key.clone()))?;

        if entry.is_expired() {
            self.entries.remove(key);
            return Err(Error::CacheExpired(key.clone()));
        }
        Ok(entry.value.clone())
    }

    fn set(&mut self, key: Key, value: CachedValue, ttl: Duration) {
        self.entries.insert(key, CacheEntry::new(value, ttl));
    }

    fn remove_matching(&mut self, pattern: &Key) -> Vec<Key> {
        let removed: Vec<Key> = self
            .entries
            .keys()
            .filter(|key| key.matches(pattern))
            .cloned()
            .collect();
        for key in &removed {
            self.entries.remove(key);
        }
        removed
    }

    fn remove_expired(&mut self) -> Vec<Key> {
        let now = Instant::now();
        let mut removed = Vec::new();
        self.entries.retain(|key, entry| {
            if entry.is_expired_at(now) {
                removed.push(key.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}
