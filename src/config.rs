//! Configuration loading
//!
//! Settings come from a TOML file: an explicit `--config` path, else
//! `$POOLCAST_CONFIG`, else `config.toml` in the XDG config directory. Every
//! section has defaults, so a missing file means "use the defaults". A few
//! environment variables override the file for quick tuning.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use directories::ProjectDirs;
use serde::Deserialize;
use thiserror::Error;

use crate::data::weather::{DEFAULT_RETRY_AFTER_SECS, OPEN_METEO_BASE_URL};
use crate::data::{Location, LocationDirectory};
use crate::dead_letter::{Backoff, ExponentialBackoff, FixedBackoff, WorkerConfig};
use crate::refresh::RefreshConfig;

/// Environment variable naming the config file
pub const CONFIG_ENV: &str = "POOLCAST_CONFIG";
const TTL_ENV: &str = "POOLCAST_CACHE_TTL_SECS";
const MAX_ATTEMPTS_ENV: &str = "POOLCAST_RETRY_MAX_ATTEMPTS";

/// Errors that can occur while loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Config file is not valid TOML for our schema
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    /// Settings parsed but are not usable
    #[error("Invalid configuration:\n  - {}", .0.join("\n  - "))]
    Invalid(Vec<String>),
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub cache: CacheConfig,
    pub upstream: UpstreamConfig,
    pub retry: RetryConfig,
    pub refresh: RefreshSettings,
    pub locations: Vec<Location>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Directory for cache files; XDG cache dir when unset
    pub dir: Option<PathBuf>,
    /// Maximum age at which cached readings are served without a refresh
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: None,
            ttl_secs: 1800,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub timeout_secs: u64,
    /// Used when a rate-limit response has no usable `Retry-After`
    pub default_retry_after_secs: u64,
    /// Hours before now included in each refresh
    pub past_hours: u32,
    /// Hours after now included in each refresh
    pub forecast_hours: u32,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: OPEN_METEO_BASE_URL.to_string(),
            timeout_secs: 15,
            default_retry_after_secs: DEFAULT_RETRY_AFTER_SECS,
            past_hours: 0,
            forecast_hours: 48,
        }
    }
}

/// Retry delay strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    /// Retry every tick
    #[default]
    Fixed,
    /// Double the delay after each failure
    Exponential,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Dead letter directory file; XDG data dir when unset
    pub store_path: Option<PathBuf>,
    pub tick_interval_secs: u64,
    pub batch_size: usize,
    pub max_attempts: u32,
    pub backoff: BackoffKind,
    /// Cap for exponential backoff
    pub max_backoff_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            store_path: None,
            tick_interval_secs: 60,
            batch_size: 25,
            max_attempts: 5,
            backoff: BackoffKind::Fixed,
            max_backoff_secs: 3600,
        }
    }
}

impl RetryConfig {
    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            tick_interval: Duration::from_secs(self.tick_interval_secs),
            batch_size: self.batch_size,
            max_attempts: self.max_attempts,
        }
    }

    pub fn backoff(&self) -> Arc<dyn Backoff> {
        let interval = Duration::from_secs(self.tick_interval_secs);
        match self.backoff {
            BackoffKind::Fixed => Arc::new(FixedBackoff(interval)),
            BackoffKind::Exponential => Arc::new(ExponentialBackoff {
                base: interval,
                max: Duration::from_secs(self.max_backoff_secs),
            }),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RefreshSettings {
    pub enabled: bool,
    pub interval_secs: u64,
}

impl Default for RefreshSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 900,
        }
    }
}

impl From<&RefreshSettings> for RefreshConfig {
    fn from(settings: &RefreshSettings) -> Self {
        RefreshConfig {
            interval: Duration::from_secs(settings.interval_secs),
            enabled: settings.enabled,
        }
    }
}

impl AppConfig {
    /// Loads, applies environment overrides, and validates
    ///
    /// An explicitly requested file must exist; the default location may be absent.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let env_path = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
        let mut config = match explicit.map(Path::to_path_buf).or(env_path) {
            Some(path) => Self::from_file(&path)?,
            None => match default_config_path() {
                Some(path) if path.exists() => Self::from_file(&path)?,
                _ => Self::default(),
            },
        };
        config.apply_env_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Applies overrides from `lookup` (the process environment in production)
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(raw) = lookup(TTL_ENV) {
            self.cache.ttl_secs = parse_env_number(TTL_ENV, &raw)?;
        }
        if let Some(raw) = lookup(MAX_ATTEMPTS_ENV) {
            self.retry.max_attempts = parse_env_number(MAX_ATTEMPTS_ENV, &raw)?;
        }
        Ok(())
    }

    /// Collects every problem rather than stopping at the first
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut issues: Vec<String> = Vec::new();

        if self.cache.ttl_secs == 0 {
            issues.push("cache.ttl_secs must be > 0".into());
        }
        if self.upstream.base_url.trim().is_empty() {
            issues.push("upstream.base_url must not be empty".into());
        }
        if self.upstream.timeout_secs == 0 {
            issues.push("upstream.timeout_secs must be > 0".into());
        }
        if self.upstream.forecast_hours == 0 && self.upstream.past_hours == 0 {
            issues.push("upstream.past_hours + upstream.forecast_hours must be > 0".into());
        }
        if self.retry.tick_interval_secs == 0 {
            issues.push("retry.tick_interval_secs must be > 0".into());
        }
        if self.retry.batch_size == 0 {
            issues.push("retry.batch_size must be > 0".into());
        }
        if self.retry.max_attempts == 0 {
            issues.push("retry.max_attempts must be > 0".into());
        }
        if self.retry.backoff == BackoffKind::Exponential
            && self.retry.max_backoff_secs < self.retry.tick_interval_secs
        {
            issues.push("retry.max_backoff_secs must be >= retry.tick_interval_secs".into());
        }
        if self.refresh.enabled && self.refresh.interval_secs == 0 {
            issues.push("refresh.interval_secs must be > 0".into());
        }

        let mut seen = std::collections::HashSet::new();
        for location in &self.locations {
            if location.id.trim().is_empty() {
                issues.push("locations: id must not be empty".into());
            } else if !seen.insert(location.id.as_str()) {
                issues.push(format!("locations: duplicate id '{}'", location.id));
            }
            if !location.coordinates().is_valid() {
                issues.push(format!(
                    "locations.{}: coordinates ({}, {}) out of range",
                    location.id, location.latitude, location.longitude
                ));
            }
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(issues))
        }
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.ttl_secs)
    }

    pub fn location_directory(&self) -> LocationDirectory {
        LocationDirectory::new(self.locations.clone())
    }
}

fn parse_env_number<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim()
        .parse()
        .map_err(|_| ConfigError::Invalid(vec![format!("{} must be a non-negative integer, got '{}'", name, raw)]))
}

/// `config.toml` in the XDG config directory (`~/.config/poolcast/` on Linux)
pub fn default_config_path() -> Option<PathBuf> {
    ProjectDirs::from("", "", "poolcast").map(|dirs| dirs.config_dir().join("config.toml"))
}
