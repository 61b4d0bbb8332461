//! Per-process service configuration types.

use std::time::Duration;

use serde::Deserialize;

use super::{ConfigError, AGENT_TOKEN_ENV_VAR};
use crate::executor::DEFAULT_SHELL;

/// Fan-out dispatcher configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Channel the producer publishes raw events to.
    pub inbound_channel: String,
    /// Maximum concurrent per-subscriber forwards for one event.
    pub max_concurrency: usize,
    /// Timeout for each registry query.
    pub registry_timeout_ms: u64,
    /// Timeout for each ACL predicate call.
    pub predicate_timeout_ms: u64,
    /// Timeout for each outbound send.
    pub send_timeout_ms: u64,
    /// Maximum inbound messages fetched per poll.
    pub max_messages: usize,
    /// Sleep between polls that returned nothing.
    pub idle_poll_ms: u64,
    /// Log unknown ACL function references at startup.
    pub validate_acl_on_start: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            inbound_channel: "eventrelay-inbound.fifo".to_string(),
            max_concurrency: 8,
            registry_timeout_ms: 5_000,
            predicate_timeout_ms: 2_000,
            send_timeout_ms: 5_000,
            max_messages: 10,
            idle_poll_ms: 500,
            validate_acl_on_start: true,
        }
    }
}

impl DispatcherConfig {
    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }
}

/// ACL predicate configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AclConfig {
    /// Strategy details document used by `admin_tag_check`.
    pub strategy_file: Option<String>,
}

/// Subscriber agent configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Address the HTTP API listens on.
    pub bind: String,
    /// File holding the bearer token. Falls back to `EVENTRELAY_AGENT_TOKEN`.
    pub token_file: Option<String>,
    /// Wait for each command to exit and log its output inline.
    pub wait: bool,
    /// Shell commands are run with, as `<shell> -c <command>`.
    pub shell: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8021".to_string(),
            token_file: None,
            wait: false,
            shell: DEFAULT_SHELL.to_string(),
        }
    }
}

impl AgentConfig {
    /// Resolve the bearer token from the token file or the environment.
    pub fn resolve_token(&self) -> Result<String, ConfigError> {
        let token = match &self.token_file {
            Some(path) => std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.clone(),
                source,
            })?,
            None => std::env::var(AGENT_TOKEN_ENV_VAR).map_err(|_| {
                ConfigError::Invalid(format!(
                    "agent.token_file is not set and {} is empty",
                    AGENT_TOKEN_ENV_VAR
                ))
            })?,
        };

        let token = token.trim().to_string();
        if token.is_empty() {
            return Err(ConfigError::Invalid("agent token is empty".to_string()));
        }
        Ok(token)
    }
}

/// Relay configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Subscriber channels this relay drains.
    pub channels: Vec<String>,
    /// Timeout for each POST to an agent.
    pub http_timeout_ms: u64,
    /// Maximum messages fetched per poll.
    pub max_messages: usize,
    /// Sleep between polls that returned nothing.
    pub idle_poll_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            channels: Vec::new(),
            http_timeout_ms: 10_000,
            max_messages: 10,
            idle_poll_ms: 500,
        }
    }
}

impl RelayConfig {
    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }
}
