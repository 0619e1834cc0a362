//! Host configuration loading from file, environment variables, or a flat
//! key/value map.

use serde::Deserialize;
use std::time::Duration;
use tabula_db::{DbRuntimeSettings, ServiceSettings, DEFAULT_BATCH_THRESHOLD};
use thiserror::Error;

/// Every key accepted by [`Config::set`] and [`Config::from_flat_map`].
pub const KEYS: &[&str] = &[
    "database.path",
    "database.pool_max_size",
    "database.busy_timeout_ms",
    "database.connection_timeout_ms",
    "database.health_check_interval_secs",
    "database.max_concurrent_operations",
    "batch.size_threshold",
    "tasks.batch_flush_secs",
    "tasks.health_check_secs",
    "tasks.maintenance_secs",
    "logging.level",
    "logging.json",
];

/// Top-level host configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub batch: BatchConfig,

    /// Periodic maintenance loops.
    #[serde(default)]
    pub tasks: TaskConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Database and pool configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Path to the shared SQLite database file.
    pub path: String,

    pub pool_max_size: u32,

    /// SQLite busy timeout in milliseconds.
    pub busy_timeout_ms: u64,

    /// How long a caller waits for a pooled connection, in milliseconds.
    pub connection_timeout_ms: u64,

    /// Minimum seconds between two pool health checks.
    pub health_check_interval_secs: u64,

    /// Upper bound on database operations running at once.
    pub max_concurrent_operations: usize,
}

/// Write batching configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Pending items per statement that trigger an immediate flush.
    pub size_threshold: usize,
}

/// Periods of the background loops, in seconds. `0` disables a loop.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    pub batch_flush_secs: u64,
    pub health_check_secs: u64,
    pub maintenance_secs: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "tabula_db=debug,info").
    pub level: String,

    /// Whether to output logs in JSON format.
    pub json: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        let runtime = DbRuntimeSettings::default();
        Self {
            path: "tabula.db".to_string(),
            pool_max_size: runtime.pool_max_size,
            busy_timeout_ms: runtime.busy_timeout_ms,
            connection_timeout_ms: runtime.connection_timeout_ms,
            health_check_interval_secs: runtime.health_check_interval.as_secs(),
            max_concurrent_operations: 16,
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            size_threshold: DEFAULT_BATCH_THRESHOLD,
        }
    }
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            batch_flush_secs: 5,
            health_check_secs: 60,
            maintenance_secs: 300,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// A key was given a value it cannot hold.
    #[error("invalid value for '{key}': {reason}")]
    InvalidValue { key: String, reason: String },
}

impl ConfigError {
    fn invalid(key: &str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::invalid(key, e.to_string()))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        other => Err(ConfigError::invalid(key, format!("expected a boolean, got '{other}'"))),
    }
}

impl Config {
    /// Builds a configuration from flat `section.field` keys over defaults.
    ///
    /// Unknown keys are logged and ignored.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] naming the first key whose value
    /// does not parse or is out of range.
    pub fn from_flat_map<I, K, V>(entries: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Self::default();
        for (key, value) in entries {
            let key = key.as_ref();
            if KEYS.contains(&key) {
                config.set(key, value.as_ref())?;
            } else {
                tracing::warn!(key, "ignoring unknown configuration key");
            }
        }
        config.validate()?;
        Ok(config)
    }

    /// Sets one flat key.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] for unknown keys or values that
    /// do not parse.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "database.path" => self.database.path = value.to_string(),
            "database.pool_max_size" => self.database.pool_max_size = parse(key, value)?,
            "database.busy_timeout_ms" => self.database.busy_timeout_ms = parse(key, value)?,
            "database.connection_timeout_ms" => {
                self.database.connection_timeout_ms = parse(key, value)?
            }
            "database.health_check_interval_secs" => {
                self.database.health_check_interval_secs = parse(key, value)?
            }
            "database.max_concurrent_operations" => {
                self.database.max_concurrent_operations = parse(key, value)?
            }
            "batch.size_threshold" => self.batch.size_threshold = parse(key, value)?,
            "tasks.batch_flush_secs" => self.tasks.batch_flush_secs = parse(key, value)?,
            "tasks.health_check_secs" => self.tasks.health_check_secs = parse(key, value)?,
            "tasks.maintenance_secs" => self.tasks.maintenance_secs = parse(key, value)?,
            "logging.level" => self.logging.level = value.to_string(),
            "logging.json" => self.logging.json = parse_bool(key, value)?,
            _ => return Err(ConfigError::invalid(key, "unknown configuration key")),
        }
        Ok(())
    }

    /// Rejects values that parse but cannot work.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] naming the offending key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database.path.trim().is_empty() {
            return Err(ConfigError::invalid("database.path", "must not be empty"));
        }
        if self.database.pool_max_size == 0 {
            return Err(ConfigError::invalid("database.pool_max_size", "must be at least 1"));
        }
        if self.database.max_concurrent_operations == 0 {
            return Err(ConfigError::invalid(
                "database.max_concurrent_operations",
                "must be at least 1",
            ));
        }
        if self.batch.size_threshold == 0 {
            return Err(ConfigError::invalid("batch.size_threshold", "must be at least 1"));
        }
        Ok(())
    }

    /// Settings for the data service described by this configuration.
    pub fn service_settings(&self) -> ServiceSettings {
        ServiceSettings {
            path: self.database.path.clone(),
            runtime: DbRuntimeSettings {
                busy_timeout_ms: self.database.busy_timeout_ms,
                pool_max_size: self.database.pool_max_size,
                connection_timeout_ms: self.database.connection_timeout_ms,
                health_check_interval: Duration::from_secs(
                    self.database.health_check_interval_secs,
                ),
            },
            batch_size_threshold: self.batch.size_threshold,
            max_concurrent_operations: self.database.max_concurrent_operations,
        }
    }
}

/// Environment variable that overrides `key`: `TABULA_` followed by the key
/// upper-cased with dots replaced by underscores.
pub fn env_var_for(key: &str) -> String {
    format!("TABULA_{}", key.replace('.', "_").to_ascii_uppercase())
}

/// Applies overrides for every known key that `lookup` resolves.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidValue`] for the first override that does
/// not parse.
pub fn apply_overrides<F>(config: &mut Config, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    for key in KEYS {
        if let Some(value) = lookup(&env_var_for(key)) {
            config.set(key, &value)?;
        }
    }
    Ok(())
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Every key can be overridden by an environment variable named by
/// [`env_var_for`], for example `TABULA_DATABASE_PATH` or
/// `TABULA_TASKS_BATCH_FLUSH_SECS`.
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed,
/// or if a value is invalid.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    apply_overrides(&mut config, |name| std::env::var(name).ok())?;
    config.validate()?;
    Ok(config)
}
