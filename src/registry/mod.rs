//! Registry of subscribers, subscriptions and ACL function metadata.
//!
//! This module contains:
//! - `Registry` trait: read-only keyed queries used by the dispatcher
//! - `RegistryStore` trait: the write path used by provisioning and the
//!   subscriber management API
//! - Implementations: SQLite, in-memory mock

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::RegistryConfig;

pub mod mock;
pub mod schema;
pub mod sqlite;

pub use mock::MockRegistry;
pub use sqlite::SqliteRegistry;

/// Result type for registry operations.
pub type Result<T> = std::result::Result<T, RegistryError>;

/// Errors that can occur during registry operations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Subscriber not found: {0}")]
    SubscriberNotFound(String),

    #[error("ACL function not found: {0}")]
    AclFunctionNotFound(String),

    #[error("Invalid role: {0}")]
    InvalidRole(String),

    #[error("Invalid timestamp in column {column}: {value}")]
    InvalidTimestamp { column: &'static str, value: String },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Registry unavailable: {0}")]
    Unavailable(String),
}

/// Subscriber role.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    #[default]
    User,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::User => "user",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "admin" => Ok(Role::Admin),
            "user" => Ok(Role::User),
            other => Err(RegistryError::InvalidRole(other.to_string())),
        }
    }
}

/// A registered subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscriber {
    pub username: String,
    pub role: Role,
    /// Address of the subscriber's private outbound channel. Assigned at
    /// registration and never changed afterwards.
    pub channel_ref: String,
    /// Bearer token presented to the subscriber's agent.
    pub auth_credential: String,
    /// Where the subscriber's agent listens (`host:port` or a full URL).
    pub agent_endpoint: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Subscriber {
    pub fn new(
        username: impl Into<String>,
        role: Role,
        channel_ref: impl Into<String>,
        auth_credential: impl Into<String>,
    ) -> Self {
        Self {
            username: username.into(),
            role,
            channel_ref: channel_ref.into(),
            auth_credential: auth_credential.into(),
            agent_endpoint: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_agent_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.agent_endpoint = Some(endpoint.into());
        self
    }
}

/// A `(username, event_type)` subscription and its command template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub username: String,
    pub event_type: String,
    pub command: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A named ACL predicate and the reference it resolves through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclFunction {
    pub name: String,
    /// Key into the predicate registry.
    pub reference: String,
}

/// Read-only registry queries.
///
/// Implementations:
/// - `SqliteRegistry`: SQLite via sqlx
/// - `MockRegistry`: In-memory mock for testing
#[async_trait]
pub trait Registry: Send + Sync {
    /// Usernames subscribed to an event type, ordered by username.
    async fn subscribers_for_event(&self, event_type: &str) -> Result<Vec<String>>;

    /// The ordered ACL chain mapped to an event type.
    async fn acl_chain_for_event(&self, event_type: &str) -> Result<Vec<AclFunction>>;

    /// The delivery channel of a subscriber, if registered.
    async fn channel_for_subscriber(&self, username: &str) -> Result<Option<String>>;

    /// The command template of a subscription, if present.
    async fn command_template(&self, username: &str, event_type: &str) -> Result<Option<String>>;

    async fn subscriber(&self, username: &str) -> Result<Option<Subscriber>>;

    /// Reverse lookup used by the relay to learn whose channel it drains.
    async fn subscriber_by_channel(&self, channel_ref: &str) -> Result<Option<Subscriber>>;

    async fn subscribers(&self) -> Result<Vec<Subscriber>>;

    /// Every subscription, used to warm the agent command cache.
    async fn all_subscriptions(&self) -> Result<Vec<Subscription>>;

    async fn acl_functions(&self) -> Result<Vec<AclFunction>>;
}

/// Registry write path.
#[async_trait]
pub trait RegistryStore: Registry {
    /// Insert a subscriber, or update role, credential and endpoint of an
    /// existing one. The channel reference of an existing subscriber is kept.
    async fn upsert_subscriber(&self, subscriber: &Subscriber) -> Result<()>;

    /// Delete a subscriber and, by cascade, all of its subscriptions.
    async fn delete_subscriber(&self, username: &str) -> Result<bool>;

    /// Insert or replace the command of a subscription.
    async fn upsert_subscription(
        &self,
        username: &str,
        event_type: &str,
        command: &str,
    ) -> Result<Subscription>;

    /// Returns false when no such subscription existed.
    async fn delete_subscription(&self, username: &str, event_type: &str) -> Result<bool>;

    async fn list_subscriptions(
        &self,
        username: &str,
        event_type: Option<&str>,
    ) -> Result<Vec<Subscription>>;

    async fn register_acl_function(&self, name: &str, reference: &str) -> Result<()>;

    /// Delete an ACL function and, by cascade, its event mappings.
    async fn delete_acl_function(&self, name: &str) -> Result<bool>;

    /// Append an ACL function to the chain of an event type. Mapping an
    /// already mapped function keeps its position.
    async fn map_acl_function(&self, event_type: &str, name: &str) -> Result<()>;

    async fn unmap_acl_function(&self, event_type: &str, name: &str) -> Result<bool>;
}

pub(crate) fn parse_timestamp(column: &'static str, value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|_| RegistryError::InvalidTimestamp {
            column,
            value: value.to_string(),
        })
}

/// Open the registry described by configuration and create its schema.
pub async fn init_registry(config: &RegistryConfig) -> Result<Arc<SqliteRegistry>> {
    info!(path = %config.path, "Registry: sqlite");

    if config.path != ":memory:" {
        if let Some(parent) = std::path::Path::new(&config.path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| RegistryError::Unavailable(e.to_string()))?;
            }
        }
    }

    let registry = SqliteRegistry::connect(&config.url()).await?;
    registry.init().await?;
    Ok(Arc::new(registry))
}
