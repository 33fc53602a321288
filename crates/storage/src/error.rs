use crate::registry::ObserverId;
use common::Key;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("observer {observer} is already registered for key {key}")]
    ObserverAlreadyRegistered { key: Key, observer: ObserverId },

    #[error("observer {observer} is not registered for key {key}")]
    ObserverNotFound { key: Key, observer: ObserverId },

    #[error("no cache entry for key {0}")]
    CacheMiss(Key),

    #[error("cache entry for key {0} expired")]
    CacheExpired(Key),

    #[error("cached value for key {key} is not a {expected}")]
    TypeMismatch { key: Key, expected: &'static str },
}

impl Error {
    /// Miss and expiry only steer a reader towards refetching.
    pub fn is_cache_miss(&self) -> bool {
        matches!(self, Error::CacheMiss(_) | Error::CacheExpired(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
