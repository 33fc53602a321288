//! Engine configuration.
//!
//! Values come from the process environment (a `.env` file is loaded by the
//! binary before [`EngineConfig::from_env`] runs).

use crate::error::ConfigError;
use std::time::Duration;
use tracing::level_filters::LevelFilter;

pub const ENV_DEFAULT_TTL_SECS: &str = "FETCHLAKE_DEFAULT_TTL_SECS";
pub const ENV_SWEEP_INTERVAL_SECS: &str = "FETCHLAKE_SWEEP_INTERVAL_SECS";
pub const ENV_LOG_LEVEL: &str = "FETCHLAKE_LOG_LEVEL";

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Used when `RUST_LOG` is unset.
    pub default_level:  LevelFilter,
    /// Attach file and line to each event.
    pub with_file_line: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        let default_level = if cfg!(debug_assertions) {
            LevelFilter::DEBUG
        } else {
            LevelFilter::INFO
        };
        Self {
            default_level,
            with_file_line: cfg!(debug_assertions),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// TTL applied to cache writes that do not carry their own.
    pub default_ttl:    Duration,
    /// Period of the expired-entry sweeper, `None` disables it.
    pub sweep_interval: Option<Duration>,
    pub log:            LogConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_ttl:    Duration::from_secs(300),
            sweep_interval: Some(Duration::from_secs(60)),
            log:            LogConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Option<Duration>) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_log_level(mut self, level: LevelFilter) -> Self {
        self.log.default_level = level;
        self
    }

    /// Reads overrides from the environment, keeping defaults for unset variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(raw) = lookup(ENV_DEFAULT_TTL_SECS) {
            config.default_ttl = Duration::from_secs(parse_secs(ENV_DEFAULT_TTL_SECS, &raw)?);
        }

        if let Some(raw) = lookup(ENV_SWEEP_INTERVAL_SECS) {
            config.sweep_interval = match parse_secs(ENV_SWEEP_INTERVAL_SECS, &raw)? {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            };
        }

        if let Some(raw) = lookup(ENV_LOG_LEVEL) {
            config.log.default_level = raw.trim().parse::<LevelFilter>().map_err(|e| {
                ConfigError::InvalidValue {
                    name:   ENV_LOG_LEVEL,
                    value:  raw.clone().into(),
                    reason: e.to_string().into(),
                }
            })?;
        }

        Ok(config)
    }
}

fn parse_secs(name: &'static str, raw: &str) -> Result<u64, ConfigError> {
    raw.trim()
        .parse::<u64>()
        .map_err(|e| ConfigError::InvalidValue {
            name,
            value: raw.to_owned().into(),
            reason: e.to_string().into(),
        })
}
