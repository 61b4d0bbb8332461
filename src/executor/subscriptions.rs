//! Subscriber-facing subscription management.
//!
//! Every write lands in the registry first and is then applied to the
//! command cache while the cache's write lock is held.

use std::sync::Arc;

use tracing::info;

use super::CommandCache;
use crate::registry::{RegistryError, RegistryStore, Subscription};

/// Errors returned by subscription management.
#[derive(Debug, thiserror::Error)]
pub enum SubscriptionError {
    #[error("Invalid request: {0}")]
    Invalid(String),

    #[error("Subscription not found for username: {username} and event type: {event_type}")]
    NotFound { username: String, event_type: String },

    #[error("Unknown subscriber: {0}")]
    UnknownSubscriber(String),

    #[error("Registry error: {0}")]
    Registry(RegistryError),
}

impl From<RegistryError> for SubscriptionError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::SubscriberNotFound(username) => Self::UnknownSubscriber(username),
            other => Self::Registry(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, SubscriptionError>;

fn require(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(SubscriptionError::Invalid(format!("{} is required", field)));
    }
    Ok(())
}

/// Subscribe, edit, unsubscribe and list on behalf of subscribers.
pub struct SubscriptionService {
    store: Arc<dyn RegistryStore>,
    cache: Arc<CommandCache>,
}

impl SubscriptionService {
    pub fn new(store: Arc<dyn RegistryStore>, cache: Arc<CommandCache>) -> Self {
        Self { store, cache }
    }

    pub fn cache(&self) -> &Arc<CommandCache> {
        &self.cache
    }

    /// Create or replace the command of a subscription.
    pub async fn subscribe(
        &self,
        username: &str,
        event_type: &str,
        command: &str,
    ) -> Result<Subscription> {
        require("username", username)?;
        require("event_type", event_type)?;
        require("command", command)?;

        let mut cache = self.cache.write().await;
        let subscription = self
            .store
            .upsert_subscription(username, event_type, command)
            .await?;
        cache.insert(username, event_type, command);

        info!(username = %username, event_type = %event_type, "Subscribed");
        Ok(subscription)
    }

    /// Replace the command of an existing subscription.
    pub async fn edit(
        &self,
        username: &str,
        event_type: &str,
        command: &str,
    ) -> Result<Subscription> {
        require("username", username)?;
        require("event_type", event_type)?;
        require("command", command)?;

        let mut cache = self.cache.write().await;
        let existing = self
            .store
            .list_subscriptions(username, Some(event_type))
            .await?;
        if existing.is_empty() {
            return Err(SubscriptionError::NotFound {
                username: username.to_string(),
                event_type: event_type.to_string(),
            });
        }

        let subscription = self
            .store
            .upsert_subscription(username, event_type, command)
            .await?;
        cache.insert(username, event_type, command);

        info!(username = %username, event_type = %event_type, "Subscription edited");
        Ok(subscription)
    }

    /// Remove a subscription. Nothing is created when it does not exist.
    pub async fn unsubscribe(&self, username: &str, event_type: &str) -> Result<()> {
        require("username", username)?;
        require("event_type", event_type)?;

        let mut cache = self.cache.write().await;
        if !self.store.delete_subscription(username, event_type).await? {
            return Err(SubscriptionError::NotFound {
                username: username.to_string(),
                event_type: event_type.to_string(),
            });
        }
        cache.remove(username, event_type);

        info!(username = %username, event_type = %event_type, "Unsubscribed");
        Ok(())
    }

    pub async fn list_subscriptions(
        &self,
        username: &str,
        event_type: Option<&str>,
    ) -> Result<Vec<Subscription>> {
        require("username", username)?;
        Ok(self.store.list_subscriptions(username, event_type).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{MockRegistry, Registry, Role, Subscriber};

    async fn service() -> (Arc<MockRegistry>, SubscriptionService) {
        let registry = Arc::new(MockRegistry::new());
        registry
            .upsert_subscriber(&Subscriber::new("alice", Role::User, "q", "t"))
            .await
            .unwrap();
        let service = SubscriptionService::new(registry.clone(), Arc::new(CommandCache::new()));
        (registry, service)
    }

    #[tokio::test]
    async fn test_subscribe_writes_store_and_cache() {
        let (registry, service) = service().await;
        service.subscribe("alice", "deploy", "run <x>").await.unwrap();

        assert_eq!(
            registry.command_template("alice", "deploy").await.unwrap(),
            Some("run <x>".to_string())
        );
        assert_eq!(
            service.cache().get("alice", "deploy").await.as_deref(),
            Some("run <x>")
        );
    }

    #[tokio::test]
    async fn test_subscribe_twice_keeps_one_row() {
        let (registry, service) = service().await;
        service.subscribe("alice", "deploy", "v1").await.unwrap();
        service.subscribe("alice", "deploy", "v2").await.unwrap();

        let rows = registry.list_subscriptions("alice", None).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].command, "v2");
        assert_eq!(service.cache().get("alice", "deploy").await.as_deref(), Some("v2"));
    }

    #[tokio::test]
    async fn test_unknown_subscriber() {
        let (_, service) = service().await;
        let err = service.subscribe("ghost", "deploy", "x").await.unwrap_err();
        assert!(matches!(err, SubscriptionError::UnknownSubscriber(_)));
        assert!(service.cache().is_empty().await);
    }

    #[tokio::test]
    async fn test_edit_requires_existing_subscription() {
        let (_, service) = service().await;
        let err = service.edit("alice", "deploy", "x").await.unwrap_err();
        assert!(matches!(err, SubscriptionError::NotFound { .. }));

        service.subscribe("alice", "deploy", "v1").await.unwrap();
        service.edit("alice", "deploy", "v2").await.unwrap();
        assert_eq!(service.cache().get("alice", "deploy").await.as_deref(), Some("v2"));
    }

    #[tokio::test]
    async fn test_unsubscribe_missing_is_not_found() {
        let (registry, service) = service().await;
        let err = service.unsubscribe("alice", "deploy").await.unwrap_err();
        assert!(matches!(err, SubscriptionError::NotFound { .. }));
        assert!(registry.all_subscriptions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unsubscribe_removes_from_cache() {
        let (_, service) = service().await;
        service.subscribe("alice", "deploy", "v1").await.unwrap();
        service.unsubscribe("alice", "deploy").await.unwrap();
        assert!(service.cache().get("alice", "deploy").await.is_none());
    }

    #[tokio::test]
    async fn test_empty_arguments_rejected() {
        let (_, service) = service().await;
        assert!(matches!(
            service.subscribe("alice", " ", "x").await,
            Err(SubscriptionError::Invalid(_))
        ));
        assert!(matches!(
            service.subscribe("alice", "deploy", "").await,
            Err(SubscriptionError::Invalid(_))
        ));
        assert!(matches!(
            service.list_subscriptions("", None).await,
            Err(SubscriptionError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn test_list_filters_by_event_type() {
        let (_, service) = service().await;
        service.subscribe("alice", "a", "1").await.unwrap();
        service.subscribe("alice", "b", "2").await.unwrap();

        assert_eq!(service.list_subscriptions("alice", None).await.unwrap().len(), 2);
        let only_b = service.list_subscriptions("alice", Some("b")).await.unwrap();
        assert_eq!(only_b.len(), 1);
        assert_eq!(only_b[0].command, "2");
    }
}
