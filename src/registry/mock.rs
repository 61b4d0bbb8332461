//! In-memory registry for testing.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use super::{
    AclFunction, Registry, RegistryError, RegistryStore, Result, Subscriber, Subscription,
};

#[derive(Default)]
struct State {
    subscribers: BTreeMap<String, Subscriber>,
    subscriptions: BTreeMap<(String, String), Subscription>,
    acl_functions: BTreeMap<String, String>,
    mappings: HashMap<String, Vec<String>>,
}

/// Mock registry that keeps everything in memory.
///
/// Supports failure and latency injection for exercising the dispatcher's
/// timeout and error paths.
#[derive(Default)]
pub struct MockRegistry {
    state: RwLock<State>,
    fail_queries: RwLock<bool>,
    query_delay: RwLock<Option<Duration>>,
}

impl MockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_fail_queries(&self, fail: bool) {
        *self.fail_queries.write().await = fail;
    }

    pub async fn set_query_delay(&self, delay: Option<Duration>) {
        *self.query_delay.write().await = delay;
    }

    async fn before_query(&self) -> Result<()> {
        let delay = *self.query_delay.read().await;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if *self.fail_queries.read().await {
            return Err(RegistryError::Unavailable(
                "Mock registry failure".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl Registry for MockRegistry {
    async fn subscribers_for_event(&self, event_type: &str) -> Result<Vec<String>> {
        self.before_query().await?;
        let state = self.state.read().await;
        Ok(state
            .subscriptions
            .keys()
            .filter(|(_, et)| et == event_type)
            .map(|(username, _)| username.clone())
            .collect())
    }

    async fn acl_chain_for_event(&self, event_type: &str) -> Result<Vec<AclFunction>> {
        self.before_query().await?;
        let state = self.state.read().await;
        let names = state.mappings.get(event_type).cloned().unwrap_or_default();
        Ok(names
            .into_iter()
            .filter_map(|name| {
                state.acl_functions.get(&name).map(|reference| AclFunction {
                    name: name.clone(),
                    reference: reference.clone(),
                })
            })
            .collect())
    }

    async fn channel_for_subscriber(&self, username: &str) -> Result<Option<String>> {
        self.before_query().await?;
        let state = self.state.read().await;
        Ok(state
            .subscribers
            .get(username)
            .map(|s| s.channel_ref.clone()))
    }

    async fn command_template(&self, username: &str, event_type: &str) -> Result<Option<String>> {
        self.before_query().await?;
        let state = self.state.read().await;
        Ok(state
            .subscriptions
            .get(&(username.to_string(), event_type.to_string()))
            .map(|s| s.command.clone()))
    }

    async fn subscriber(&self, username: &str) -> Result<Option<Subscriber>> {
        self.before_query().await?;
        Ok(self.state.read().await.subscribers.get(username).cloned())
    }

    async fn subscriber_by_channel(&self, channel_ref: &str) -> Result<Option<Subscriber>> {
        self.before_query().await?;
        let state = self.state.read().await;
        Ok(state
            .subscribers
            .values()
            .find(|s| s.channel_ref == channel_ref)
            .cloned())
    }

    async fn subscribers(&self) -> Result<Vec<Subscriber>> {
        self.before_query().await?;
        Ok(self.state.read().await.subscribers.values().cloned().collect())
    }

    async fn all_subscriptions(&self) -> Result<Vec<Subscription>> {
        self.before_query().await?;
        Ok(self
            .state
            .read()
            .await
            .subscriptions
            .values()
            .cloned()
            .collect())
    }

    async fn acl_functions(&self) -> Result<Vec<AclFunction>> {
        self.before_query().await?;
        Ok(self
            .state
            .read()
            .await
            .acl_functions
            .iter()
            .map(|(name, reference)| AclFunction {
                name: name.clone(),
                reference: reference.clone(),
            })
            .collect())
    }
}

#[async_trait]
impl RegistryStore for MockRegistry {
    async fn upsert_subscriber(&self, subscriber: &Subscriber) -> Result<()> {
        let mut state = self.state.write().await;
        match state.subscribers.get_mut(&subscriber.username) {
            Some(existing) => {
                existing.role = subscriber.role;
                existing.auth_credential = subscriber.auth_credential.clone();
                existing.agent_endpoint = subscriber.agent_endpoint.clone();
            }
            None => {
                state
                    .subscribers
                    .insert(subscriber.username.clone(), subscriber.clone());
            }
        }
        Ok(())
    }

    async fn delete_subscriber(&self, username: &str) -> Result<bool> {
        let mut state = self.state.write().await;
        let removed = state.subscribers.remove(username).is_some();
        state.subscriptions.retain(|(u, _), _| u != username);
        Ok(removed)
    }

    async fn upsert_subscription(
        &self,
        username: &str,
        event_type: &str,
        command: &str,
    ) -> Result<Subscription> {
        let mut state = self.state.write().await;
        if !state.subscribers.contains_key(username) {
            return Err(RegistryError::SubscriberNotFound(username.to_string()));
        }

        let now = Utc::now();
        let subscription = state
            .subscriptions
            .entry((username.to_string(), event_type.to_string()))
            .and_modify(|s| {
                s.command = command.to_string();
                s.updated_at = now;
            })
            .or_insert_with(|| Subscription {
                username: username.to_string(),
                event_type: event_type.to_string(),
                command: command.to_string(),
                created_at: now,
                updated_at: now,
            });
        Ok(subscription.clone())
    }

    async fn delete_subscription(&self, username: &str, event_type: &str) -> Result<bool> {
        let mut state = self.state.write().await;
        Ok(state
            .subscriptions
            .remove(&(username.to_string(), event_type.to_string()))
            .is_some())
    }

    async fn list_subscriptions(
        &self,
        username: &str,
        event_type: Option<&str>,
    ) -> Result<Vec<Subscription>> {
        let state = self.state.read().await;
        Ok(state
            .subscriptions
            .values()
            .filter(|s| s.username == username)
            .filter(|s| event_type.map_or(true, |et| s.event_type == et))
            .cloned()
            .collect())
    }

    async fn register_acl_function(&self, name: &str, reference: &str) -> Result<()> {
        let mut state = self.state.write().await;
        state
            .acl_functions
            .insert(name.to_string(), reference.to_string());
        Ok(())
    }

    async fn delete_acl_function(&self, name: &str) -> Result<bool> {
        let mut state = self.state.write().await;
        let removed = state.acl_functions.remove(name).is_some();
        for chain in state.mappings.values_mut() {
            chain.retain(|n| n != name);
        }
        Ok(removed)
    }

    async fn map_acl_function(&self, event_type: &str, name: &str) -> Result<()> {
        let mut state = self.state.write().await;
        if !state.acl_functions.contains_key(name) {
            return Err(RegistryError::AclFunctionNotFound(name.to_string()));
        }
        let chain = state.mappings.entry(event_type.to_string()).or_default();
        if !chain.iter().any(|n| n == name) {
            chain.push(name.to_string());
        }
        Ok(())
    }

    async fn unmap_acl_function(&self, event_type: &str, name: &str) -> Result<bool> {
        let mut state = self.state.write().await;
        let Some(chain) = state.mappings.get_mut(event_type) else {
            return Ok(false);
        };
        let before = chain.len();
        chain.retain(|n| n != name);
        Ok(chain.len() != before)
    }
}
