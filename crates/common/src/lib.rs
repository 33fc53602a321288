pub mod config;
pub mod error;
pub mod key;
pub mod state;

mod log;

pub use config::{EngineConfig, LogConfig};
pub use error::{ConfigError, Error};
pub use key::{Key, KeyPart};
pub use log::logging_stdout;
pub use state::LoadingState;
