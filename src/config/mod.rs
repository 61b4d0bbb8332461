//! Application configuration.
//!
//! Aggregates configuration from all modules into a single Config struct
//! that can be loaded from YAML files or environment variables.

mod registry;
mod services;

pub use registry::RegistryConfig;
pub use services::{AclConfig, AgentConfig, DispatcherConfig, RelayConfig};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "EVENTRELAY_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "EVENTRELAY";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "EVENTRELAY_LOG";
/// Environment variable holding the agent's bearer token.
pub const AGENT_TOKEN_ENV_VAR: &str = "EVENTRELAY_AGENT_TOKEN";

use serde::Deserialize;

use crate::bus::{MessagingConfig, MessagingType};

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Registry (SQLite) configuration.
    pub registry: RegistryConfig,
    /// Delivery channel backend.
    pub messaging: MessagingConfig,
    /// Fan-out dispatcher settings.
    pub dispatcher: DispatcherConfig,
    /// ACL predicate settings.
    pub acl: AclConfig,
    /// Subscriber agent settings.
    pub agent: AgentConfig,
    /// Channel to agent relay settings.
    pub relay: RelayConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `config.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings no component can run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dispatcher.max_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "dispatcher.max_concurrency must be at least 1".to_string(),
            ));
        }
        if self.registry.path.trim().is_empty() {
            return Err(ConfigError::Invalid("registry.path is empty".to_string()));
        }
        Ok(())
    }

    /// Reject the in-process channel bus for a component running in its own
    /// process: nothing else could reach its queues.
    pub fn require_shared_messaging(&self, component: &str) -> Result<(), ConfigError> {
        if self.messaging.messaging_type == MessagingType::Channel {
            return Err(ConfigError::Invalid(format!(
                "{} cannot use messaging.type `channel`: its queues live inside one process. \
                 Use messaging.type `sqs`, or run eventrelay-standalone",
                component
            )));
        }
        Ok(())
    }

    /// Create config for testing.
    pub fn for_test() -> Self {
        Self {
            registry: RegistryConfig::in_memory(),
            ..Self::default()
        }
    }
}
