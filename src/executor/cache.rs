//! In-memory command template cache.

use std::collections::HashMap;

use tokio::sync::{RwLock, RwLockWriteGuard};
use tracing::info;

use crate::registry::{Registry, RegistryError};

type Key = (String, String);

/// Templates keyed by `(username, event_type)`.
///
/// Loaded from the registry at startup and kept current by the
/// subscription service. Readers never block each other; writers are
/// serialized.
#[derive(Debug, Default)]
pub struct CommandCache {
    entries: RwLock<HashMap<Key, String>>,
}

/// Exclusive write access to the cache.
pub struct CacheWriter<'a> {
    entries: RwLockWriteGuard<'a, HashMap<Key, String>>,
}

impl CacheWriter<'_> {
    pub fn insert(&mut self, username: &str, event_type: &str, command: &str) {
        self.entries.insert(
            (username.to_string(), event_type.to_string()),
            command.to_string(),
        );
    }

    pub fn remove(&mut self, username: &str, event_type: &str) -> Option<String> {
        self.entries
            .remove(&(username.to_string(), event_type.to_string()))
    }
}

impl CommandCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a cache holding every subscription in the registry.
    pub async fn load(registry: &dyn Registry) -> Result<Self, RegistryError> {
        let subscriptions = registry.all_subscriptions().await?;
        let entries: HashMap<Key, String> = subscriptions
            .into_iter()
            .map(|s| ((s.username, s.event_type), s.command))
            .collect();

        info!(templates = entries.len(), "Command cache loaded");
        Ok(Self {
            entries: RwLock::new(entries),
        })
    }

    pub async fn get(&self, username: &str, event_type: &str) -> Option<String> {
        self.entries
            .read()
            .await
            .get(&(username.to_string(), event_type.to_string()))
            .cloned()
    }

    /// Take the write lock. Held by the subscription service across the
    /// store write so the cache applies writes in store order.
    pub async fn write(&self) -> CacheWriter<'_> {
        CacheWriter {
            entries: self.entries.write().await,
        }
    }

    pub async fn insert(&self, username: &str, event_type: &str, command: &str) {
        self.write().await.insert(username, event_type, command);
    }

    pub async fn remove(&self, username: &str, event_type: &str) -> Option<String> {
        self.write().await.remove(username, event_type)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{MockRegistry, RegistryStore, Role, Subscriber};

    #[tokio::test]
    async fn test_load_from_registry() {
        let registry = MockRegistry::new();
        registry
            .upsert_subscriber(&Subscriber::new("alice", Role::User, "q", "t"))
            .await
            .unwrap();
        registry
            .upsert_subscription("alice", "deploy", "bash deploy.sh")
            .await
            .unwrap();

        let cache = CommandCache::load(&registry).await.unwrap();
        assert_eq!(cache.len().await, 1);
        assert_eq!(
            cache.get("alice", "deploy").await.as_deref(),
            Some("bash deploy.sh")
        );
        assert!(cache.get("alice", "other").await.is_none());
    }

    #[tokio::test]
    async fn test_insert_replaces_and_remove() {
        let cache = CommandCache::new();
        cache.insert("alice", "deploy", "v1").await;
        cache.insert("alice", "deploy", "v2").await;
        assert_eq!(cache.get("alice", "deploy").await.as_deref(), Some("v2"));

        assert_eq!(cache.remove("alice", "deploy").await.as_deref(), Some("v2"));
        assert!(cache.is_empty().await);
    }
}
