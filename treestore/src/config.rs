//! Database configuration.
//!
//! A [`Config`] is built in code with its builder methods or loaded from
//! environment variables.
//!
//! # Environment Variables
//!
//! - `TREESTORE_CACHE_SIZE_BYTES`: node cache budget (default: 64 MiB)
//! - `TREESTORE_CREATE_IF_MISSING`: `true` or `false` (default: `true`)
//! - `TREESTORE_FLUSH_EVERY_MS`: background flush interval, `0` disables it (default: `500`)
//! - `TREESTORE_LOG_CAPACITY_BYTES`: log region size for new databases (default: 16 MiB)
//!
//! # Invariants
//!
//! - `log_capacity_bytes` is clamped to at least 1 MiB when a file is created
//! - `flush_every_ms` is never `Some(0)`

use std::path::Path;

use crate::db::Db;
use crate::error::Result;
use crate::storage::wal::{DEFAULT_WAL_CAPACITY, MIN_WAL_CAPACITY};

/// Options for opening a database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Memory budget for decoded nodes, in bytes.
    pub cache_size_bytes: usize,
    /// Initialize a new database when the path does not exist.
    pub create_if_missing: bool,
    /// Interval of the background flusher; `None` disables it.
    pub flush_every_ms: Option<u64>,
    /// Size of the log region. Only used when the file is created.
    pub log_capacity_bytes: u64,
}

/// Error returned when loading configuration fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable is missing.
    MissingEnvVar(String),
    /// An environment variable has an invalid value.
    InvalidValue { name: String, message: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingEnvVar(name) => {
                write!(f, "missing required environment variable: {name}")
            }
            Self::InvalidValue { name, message } => {
                write!(f, "invalid value for {name}: {message}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_size_bytes: Self::DEFAULT_CACHE_SIZE_BYTES,
            create_if_missing: true,
            flush_every_ms: Some(Self::DEFAULT_FLUSH_EVERY_MS),
            log_capacity_bytes: DEFAULT_WAL_CAPACITY,
        }
    }
}

impl Config {
    /// Default node cache budget.
    pub const DEFAULT_CACHE_SIZE_BYTES: usize = 64 * 1024 * 1024;
    /// Default background flush interval.
    pub const DEFAULT_FLUSH_EVERY_MS: u64 = 500;

    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn cache_size_bytes(mut self, bytes: usize) -> Self {
        self.cache_size_bytes = bytes;
        self
    }

    #[must_use]
    pub const fn create_if_missing(mut self, create: bool) -> Self {
        self.create_if_missing = create;
        self
    }

    /// Set the flush interval. `None` or `Some(0)` disables the flusher.
    #[must_use]
    pub const fn flush_every_ms(mut self, interval: Option<u64>) -> Self {
        self.flush_every_ms = match interval {
            Some(0) | None => None,
            Some(ms) => Some(ms),
        };
        self
    }

    #[must_use]
    pub const fn log_capacity_bytes(mut self, bytes: u64) -> Self {
        self.log_capacity_bytes = if bytes < MIN_WAL_CAPACITY {
            MIN_WAL_CAPACITY
        } else {
            bytes
        };
        self
    }

    /// Open the database at `path` with this configuration.
    pub fn open(self, path: impl AsRef<Path>) -> Result<Db> {
        Db::open(path, self)
    }

    /// Load configuration from environment variables, using defaults for
    /// anything unset.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set but cannot be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(bytes) = load_var::<usize>("TREESTORE_CACHE_SIZE_BYTES")? {
            config = config.cache_size_bytes(bytes);
        }
        if let Some(create) = load_var::<bool>("TREESTORE_CREATE_IF_MISSING")? {
            config = config.create_if_missing(create);
        }
        if let Some(ms) = load_var::<u64>("TREESTORE_FLUSH_EVERY_MS")? {
            config = config.flush_every_ms(Some(ms));
        }
        if let Some(bytes) = load_var::<u64>("TREESTORE_LOG_CAPACITY_BYTES")? {
            config = config.log_capacity_bytes(bytes);
        }
        Ok(config)
    }
}

/// Parse an optional environment variable.
fn load_var<T>(name: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(value) => parse_value(name, &value).map(Some),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(std::env::VarError::NotUnicode(_)) => Err(ConfigError::InvalidValue {
            name: name.to_string(),
            message: "not valid unicode".to_string(),
        }),
    }
}

fn parse_value<T>(name: &str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse::<T>().map_err(|e| ConfigError::InvalidValue {
        name: name.to_string(),
        message: format!("'{value}': {e}"),
    })
}
