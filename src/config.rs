use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::bootstrap::BootstrapOptions;
use crate::error::ConfigError;

/// Registry service configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Default tracing filter when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Project store; bootstrap falls back to the placeholder project without one
    #[serde(default)]
    pub store: Option<StoreConfig>,

    #[serde(default)]
    pub bootstrap: BootstrapConfig,

    #[serde(default)]
    pub events: EventsConfig,

    #[serde(default)]
    pub registry: RegistryConfig,

    #[serde(default)]
    pub health: HealthConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BootstrapConfig {
    #[serde(default = "default_query_timeout")]
    pub query_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventsConfig {
    #[serde(default = "default_event_capacity")]
    pub capacity: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RegistryConfig {
    /// Warn once the pool holds more accessors than this
    #[serde(default)]
    pub max_accessors: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Self-test period; 0 disables the periodic check
    #[serde(default = "default_self_test_interval")]
    pub self_test_interval_secs: u64,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_connections() -> u32 {
    4
}

fn default_query_timeout() -> u64 {
    10
}

fn default_event_capacity() -> usize {
    64
}

fn default_self_test_interval() -> u64 {
    60
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            query_timeout_secs: default_query_timeout(),
        }
    }
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            capacity: default_event_capacity(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            self_test_interval_secs: default_self_test_interval(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            store: None,
            bootstrap: BootstrapConfig::default(),
            events: EventsConfig::default(),
            registry: RegistryConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml(&content)?;
        info!(
            store = config.store.as_ref().map(|s| s.url.as_str()).unwrap_or("none"),
            "configuration loaded"
        );
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bootstrap.query_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "bootstrap.query_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.events.capacity == 0 {
            return Err(ConfigError::Invalid(
                "events.capacity must be greater than 0".to_string(),
            ));
        }
        if let Some(store) = &self.store {
            if store.url.trim().is_empty() {
                return Err(ConfigError::Invalid("store.url must not be empty".to_string()));
            }
        }
        Ok(())
    }

    pub fn bootstrap_options(&self) -> BootstrapOptions {
        BootstrapOptions {
            query_timeout: Duration::from_secs(self.bootstrap.query_timeout_secs),
        }
    }

    pub fn self_test_interval(&self) -> Option<Duration> {
        match self.health.self_test_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}
