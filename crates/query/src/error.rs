use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Storage(#[from] storage::Error),

    #[error("queries and mutations must be created inside a tokio runtime")]
    NoRuntime,
}

pub type Result<T> = std::result::Result<T, Error>;
