//! Settings for a gqlazy client: cache lifetimes, batching window, alias
//! hashing, HTTP transport and logging.
//!
//! Values come from `~/.gqlazy/config.toml`, then `.gqlazy/config.toml` in the
//! project, then [`ConfigOverrides`]; see [`ConfigLoader`].

mod error;
mod loader;

pub use error::ConfigError;
pub use loader::ConfigLoader;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Shortest alias hash that keeps collisions unlikely for realistic argument sets.
pub const MIN_ALIAS_LENGTH: usize = 4;

/// Longest alias hash (hex digest of sha256).
pub const MAX_ALIAS_LENGTH: usize = 64;

/// Everything a client and the CLI read at startup.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ClientConfig {
    /// Cache configuration
    pub cache: CacheConfig,

    /// Scheduler configuration
    pub scheduler: SchedulerConfig,

    /// Selection and query compiler configuration
    pub selection: SelectionConfig,

    /// HTTP transport configuration
    pub transport: TransportConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Cache configuration.
///
/// # Example TOML
///
/// ```toml
/// [cache]
/// max_age_ms = 60000
/// stale_while_revalidate_ms = 300000
/// normalization = true
/// identity_fields = ["id", "_id"]
/// array_merge = "replace"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// How long a query result is served as fresh
    pub max_age_ms: u64,

    /// Never expire entries and retain them strongly (overrides `max_age_ms`)
    pub immutable: bool,

    /// Window after `max_age_ms` during which stale data is served while a refetch runs
    pub stale_while_revalidate_ms: u64,

    /// Maximum number of root field containers kept before LRU eviction
    pub max_entries: usize,

    /// Store identity-bearing objects once and share them across paths
    pub normalization: bool,

    /// Fields that identify an object together with `__typename`
    pub identity_fields: Vec<String>,

    /// How conflicting arrays are merged into normalized objects
    pub array_merge: ArrayMergeMode,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_age_ms: 0,
            immutable: false,
            stale_while_revalidate_ms: 5 * 60 * 1000,
            max_entries: 4096,
            normalization: true,
            identity_fields: vec!["id".to_string(), "_id".to_string()],
            array_merge: ArrayMergeMode::default(),
        }
    }
}

impl CacheConfig {
    /// Validate cache settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_entries == 0 {
            return Err(ConfigError::invalid_value(
                "cache.max_entries",
                "must be greater than zero",
            ));
        }
        if self.normalization && self.identity_fields.is_empty() {
            return Err(ConfigError::Validation(
                "cache.normalization is enabled but cache.identity_fields is empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Array conflict policy for normalized objects.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ArrayMergeMode {
    /// Equal lengths keep the existing array, different lengths replace it
    #[default]
    KeepEqualLength,
    /// Always take the incoming array
    Replace,
}

impl std::fmt::Display for ArrayMergeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::KeepEqualLength => write!(f, "keep-equal-length"),
            Self::Replace => write!(f, "replace"),
        }
    }
}

impl std::str::FromStr for ArrayMergeMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "keep-equal-length" | "keep_equal_length" => Ok(Self::KeepEqualLength),
            "replace" => Ok(Self::Replace),
            _ => Err(ConfigError::Validation(format!(
                "Unknown array merge mode: '{}'. Valid values: keep-equal-length, replace",
                s
            ))),
        }
    }
}

/// Scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Debounce window in milliseconds (0 = flush after one task yield)
    pub window_ms: u64,
}

/// Selection and query compiler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionConfig {
    /// Length of the argument hash used in generated aliases
    pub alias_length: usize,

    /// Number of compiled documents memoized by the query builder
    pub document_cache_size: usize,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            alias_length: 6,
            document_cache_size: 256,
        }
    }
}

impl SelectionConfig {
    /// Validate selection settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_ALIAS_LENGTH..=MAX_ALIAS_LENGTH).contains(&self.alias_length) {
            return Err(ConfigError::invalid_value(
                "selection.alias_length",
                format!(
                    "must be between {} and {}, got {}",
                    MIN_ALIAS_LENGTH, MAX_ALIAS_LENGTH, self.alias_length
                ),
            ));
        }
        Ok(())
    }
}

/// HTTP transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// GraphQL endpoint URL
    pub endpoint: String,

    /// Extra request headers
    pub headers: HashMap<String, String>,

    /// Environment variable holding a bearer token (optional)
    pub auth_token_env: Option<String>,

    /// Request timeout in seconds
    pub timeout_secs: u64,

    /// Maximum retry attempts for transient failures
    pub max_retries: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:4000/graphql".to_string(),
            headers: HashMap::new(),
            auth_token_env: None,
            timeout_secs: 30,
            max_retries: 3,
        }
    }
}

impl TransportConfig {
    /// Validate transport settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoint.is_empty() {
            return Err(ConfigError::Validation(
                "transport.endpoint is required".to_string(),
            ));
        }
        if !(self.endpoint.starts_with("http://") || self.endpoint.starts_with("https://")) {
            return Err(ConfigError::invalid_value(
                "transport.endpoint",
                format!("'{}' is not an http(s) URL", self.endpoint),
            ));
        }
        Ok(())
    }
}

/// Where and how the CLI writes its `tracing` output.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Maximum level, parsed as a `tracing::Level`
    pub level: String,
    pub format: LogFormat,
    /// Write to this file instead of stderr
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: LogFormat::Text,
            file: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    /// One JSON object per event
    Json,
}

/// Values set on the command line. `None` leaves the file value alone.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub endpoint: Option<String>,
    pub max_age_ms: Option<u64>,
    pub window_ms: Option<u64>,
    pub normalization: Option<bool>,
    pub log_level: Option<String>,
}

impl ClientConfig {
    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(endpoint) = &overrides.endpoint {
            self.transport.endpoint.clone_from(endpoint);
        }
        if let Some(level) = &overrides.log_level {
            self.logging.level.clone_from(level);
        }
        self.cache.max_age_ms = overrides.max_age_ms.unwrap_or(self.cache.max_age_ms);
        self.cache.normalization = overrides.normalization.unwrap_or(self.cache.normalization);
        self.scheduler.window_ms = overrides.window_ms.unwrap_or(self.scheduler.window_ms);
    }

    /// Check every section; the first failure is returned.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.cache.validate()?;
        self.selection.validate()?;
        self.transport.validate()?;
        Ok(())
    }

    /// Render as the TOML accepted by [`ConfigLoader`].
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}
