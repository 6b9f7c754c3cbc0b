//! Queue configuration.
//!
//! Read at invocation start: an optional TOML file, then environment
//! overrides. Per-invocation operator flags (ignore-limits, force) live on
//! [`crate::runner::RunOptions`], not here.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use cronq_core::{normalize_classname, BackoffPolicy, ConcurrencyLimits};

pub const ENV_CONFIG: &str = "CRONQ_CONFIG";
pub const ENV_DATABASE_URL: &str = "CRONQ_DATABASE_URL";
pub const ENV_ENABLED: &str = "CRONQ_ENABLED";
pub const ENV_CONCURRENCY_LIMIT: &str = "CRONQ_CONCURRENCY_LIMIT";
pub const ENV_BLOCKING_LIMIT: &str = "CRONQ_BLOCKING_LIMIT";
pub const ENV_MAX_RUNTIME_SECS: &str = "CRONQ_MAX_RUNTIME_SECS";

/// Longest accepted backoff ceiling: one year.
pub const MAX_BACKOFF_SECS: u64 = 365 * 24 * 60 * 60;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid value for {key}: {value:?}")]
    InvalidEnv { key: &'static str, value: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Global switch for the whole queue.
    pub enabled: bool,
    pub database_url: String,
    /// Ceiling for non-blocking tasks across all classes.
    pub concurrency_limit: usize,
    /// Separate pool for blocking tasks.
    pub blocking_limit: usize,
    /// Per-classname ceilings; override handler-declared limits.
    pub class_limits: HashMap<String, usize>,
    pub max_runtime_secs: u64,
    pub lock_grace_secs: u64,
    /// Lock lifetime when limits (and so the max runtime) are ignored.
    pub unbounded_lock_secs: u64,
    pub poll_interval_ms: u64,
    pub backoff: BackoffConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub base_secs: u64,
    pub max_secs: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_secs: 60,
            max_secs: 86_400,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            database_url: "sqlite://cronq.db".to_string(),
            concurrency_limit: 3,
            blocking_limit: 1,
            class_limits: HashMap::new(),
            max_runtime_secs: 1800,
            lock_grace_secs: 60,
            unbounded_lock_secs: 86_400,
            poll_interval_ms: 1000,
            backoff: BackoffConfig::default(),
        }
    }
}

impl QueueConfig {
    /// Load from a TOML file, or defaults when `path` is `None`.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(p) => {
                let data = fs::read_to_string(p).map_err(|source| ConfigError::Read {
                    path: p.to_path_buf(),
                    source,
                })?;
                toml::from_str(&data).map_err(|source| ConfigError::Parse {
                    path: p.to_path_buf(),
                    source,
                })?
            }
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Load from `CRONQ_CONFIG` (if set) and apply environment overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let lookup = |key: &str| std::env::var(key).ok();
        let path = lookup(ENV_CONFIG).map(PathBuf::from);
        let mut config = Self::load(path.as_deref())?;
        config.apply_env(lookup)?;
        Ok(config)
    }

    /// Apply overrides from a key lookup (normally the process environment).
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_DATABASE_URL) {
            self.database_url = url;
        }
        if let Some(v) = lookup(ENV_ENABLED) {
            self.enabled = parse_flag(ENV_ENABLED, &v)?;
        }
        if let Some(v) = lookup(ENV_CONCURRENCY_LIMIT) {
            self.concurrency_limit = parse_value(ENV_CONCURRENCY_LIMIT, &v)?;
        }
        if let Some(v) = lookup(ENV_BLOCKING_LIMIT) {
            self.blocking_limit = parse_value(ENV_BLOCKING_LIMIT, &v)?;
        }
        if let Some(v) = lookup(ENV_MAX_RUNTIME_SECS) {
            self.max_runtime_secs = parse_value(ENV_MAX_RUNTIME_SECS, &v)?;
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "poll_interval_ms must be greater than zero".into(),
            ));
        }
        if self.backoff.base_secs == 0 {
            return Err(ConfigError::Invalid(
                "backoff.base_secs must be greater than zero".into(),
            ));
        }
        if self.backoff.base_secs > self.backoff.max_secs {
            return Err(ConfigError::Invalid(format!(
                "backoff.base_secs ({}) exceeds backoff.max_secs ({})",
                self.backoff.base_secs, self.backoff.max_secs
            )));
        }
        if self.backoff.max_secs > MAX_BACKOFF_SECS {
            return Err(ConfigError::Invalid(format!(
                "backoff.max_secs ({}) exceeds {MAX_BACKOFF_SECS}",
                self.backoff.max_secs
            )));
        }
        if self.database_url.trim().is_empty() {
            return Err(ConfigError::Invalid("database_url must not be empty".into()));
        }
        Ok(())
    }

    /// Effective limits: handler-declared class limits overlaid by config.
    pub fn concurrency_limits(&self, declared: &HashMap<String, usize>) -> ConcurrencyLimits {
        let mut limits = ConcurrencyLimits {
            global: self.concurrency_limit,
            blocking: self.blocking_limit,
            per_class: HashMap::new(),
        };
        for (classname, limit) in declared.iter().chain(self.class_limits.iter()) {
            limits
                .per_class
                .insert(normalize_classname(classname), *limit);
        }
        limits
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_secs(self.backoff.base_secs),
            Duration::from_secs(self.backoff.max_secs),
        )
    }

    pub fn max_runtime(&self) -> Duration {
        Duration::from_secs(self.max_runtime_secs)
    }

    pub fn lock_grace(&self) -> Duration {
        Duration::from_secs(self.lock_grace_secs)
    }

    pub fn unbounded_lock(&self) -> Duration {
        Duration::from_secs(self.unbounded_lock_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Accepts `1/0`, `true/false`, `yes/no`, `on/off`.
pub fn parse_flag(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::InvalidEnv {
            key,
            value: value.to_string(),
        }),
    }
}

pub fn parse_value<T: FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        key,
        value: value.to_string(),
    })
}
