use faststr::FastStr;
use thiserror::Error;

/// Reason carried by an `error` [`LoadingState`](crate::LoadingState).
///
/// Only cancellation and the fetch/write function's own failure ever reach a
/// query or mutation's error state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("operation cancelled")]
    OperationCancelled,
    #[error("{0}")]
    OperationFailed(FastStr),
}

impl Error {
    /// Wraps an underlying fetch/write failure, keeping its display text as the reason.
    pub fn failed(reason: impl std::fmt::Display) -> Self {
        Error::OperationFailed(reason.to_string().into())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::OperationCancelled)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value:?} ({reason})")]
    InvalidValue {
        name:   &'static str,
        value:  FastStr,
        reason: FastStr,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
