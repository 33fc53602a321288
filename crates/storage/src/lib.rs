//! In-memory cache store, observer registry and the coordinator that
//! serializes access to both.

mod cache;
mod coordinator;
mod registry;
mod stats;

pub mod error;

pub use cache::memory::MemoryCache;
pub use cache::{CacheEntry, CacheStore, CachedValue};
pub use coordinator::{Coordinator, Invalidation};
pub use error::{Error, Result};
pub use registry::{Notification, Observer, ObserverId, ObserverRegistry};
pub use stats::{CacheStats, CacheStatsSnapshot};
