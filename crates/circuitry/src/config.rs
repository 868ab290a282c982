//! Engine configuration, layered from environment variables over defaults.

use std::time::Duration;

use crate::fetch::FetchConfig;

pub const ENV_OUTER_CAPACITY: &str = "CIRCUITRY_OUTER_CAPACITY";
pub const ENV_INNER_CAPACITY: &str = "CIRCUITRY_INNER_CAPACITY";
pub const ENV_PROXY: &str = "CIRCUITRY_PROXY";
pub const ENV_PREFILL: &str = "CIRCUITRY_PREFILL";
pub const ENV_REPLENISH: &str = "CIRCUITRY_REPLENISH";
pub const ENV_MAX_ATTEMPTS: &str = "CIRCUITRY_MAX_ATTEMPTS";
pub const ENV_ATTEMPT_TIMEOUT: &str = "CIRCUITRY_ATTEMPT_TIMEOUT";
pub const ENV_BACKOFF_BASE: &str = "CIRCUITRY_BACKOFF_BASE";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{name}: expected {expected}, got {value:?}")]
    Malformed {
        name: &'static str,
        expected: &'static str,
        value: String,
    },
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Transport client slots.
    pub outer_capacity: usize,
    /// Circuit slots, mapped onto clients by modulo.
    pub inner_capacity: usize,
    /// `socks5h://host:port`; `None` connects directly.
    pub proxy: Option<String>,
    pub prefill: bool,
    pub replenish: bool,
    pub fetch: FetchConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            outer_capacity: 3,
            inner_capacity: 9,
            proxy: None,
            prefill: true,
            replenish: true,
            fetch: FetchConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source; unset or empty variables keep defaults.
    pub fn from_lookup<L>(lookup: L) -> Result<Self, ConfigError>
    where
        L: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(v) = get(ENV_OUTER_CAPACITY) {
            config.outer_capacity = parse_count(ENV_OUTER_CAPACITY, &v)?;
        }
        if let Some(v) = get(ENV_INNER_CAPACITY) {
            config.inner_capacity = parse_count(ENV_INNER_CAPACITY, &v)?;
        }
        if let Some(v) = get(ENV_PROXY) {
            config.proxy = Some(v.trim().to_string());
        }
        if let Some(v) = get(ENV_PREFILL) {
            config.prefill = parse_flag(ENV_PREFILL, &v)?;
        }
        if let Some(v) = get(ENV_REPLENISH) {
            config.replenish = parse_flag(ENV_REPLENISH, &v)?;
        }
        if let Some(v) = get(ENV_MAX_ATTEMPTS) {
            config.fetch.max_attempts = parse_count(ENV_MAX_ATTEMPTS, &v)?;
        }
        if let Some(v) = get(ENV_ATTEMPT_TIMEOUT) {
            config.fetch.attempt_timeout = parse_seconds(ENV_ATTEMPT_TIMEOUT, &v)?;
        }
        if let Some(v) = get(ENV_BACKOFF_BASE) {
            config.fetch.backoff_base = parse_seconds(ENV_BACKOFF_BASE, &v)?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.outer_capacity == 0 {
            return Err(ConfigError::Zero("outer capacity"));
        }
        if self.inner_capacity == 0 {
            return Err(ConfigError::Zero("inner capacity"));
        }
        if self.fetch.max_attempts == 0 {
            return Err(ConfigError::Zero("max attempts"));
        }
        if self.fetch.attempt_timeout.is_zero() {
            return Err(ConfigError::Zero("attempt timeout"));
        }
        Ok(())
    }
}

pub fn parse_count<T: std::str::FromStr>(name: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Malformed {
        name,
        expected: "a non-negative integer",
        value: value.to_string(),
    })
}

pub fn parse_flag(name: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Malformed {
            name,
            expected: "a boolean",
            value: value.to_string(),
        }),
    }
}

/// Seconds as a float, e.g. `2.5`.
pub fn parse_seconds(name: &'static str, value: &str) -> Result<Duration, ConfigError> {
    value
        .trim()
        .parse::<f64>()
        .ok()
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
        .ok_or_else(|| ConfigError::Malformed {
            name,
            expected: "a non-negative number of seconds",
            value: value.to_string(),
        })
}
