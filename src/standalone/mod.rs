//! Single-process runtime.
//!
//! Runs the dispatcher, the relay and the agent API in one process over one
//! delivery channel. With the default in-process channel bus this is the
//! only deployment in which producers, dispatcher and relay share queues.
//!
//! ```ignore
//! let runtime = Runtime::start(&config).await?;
//! shutdown_signal().await;
//! runtime.shutdown().await;
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::acl::{AclEngine, PredicateRegistry};
use crate::api::{serve_on, AgentState};
use crate::bus::{init_delivery_channel, DeliveryChannel, PollerHandle};
use crate::config::{Config, ConfigError};
use crate::dispatch::{spawn_inbound_consumer, DispatchError, DispatchLimits, Dispatcher};
use crate::executor::{CommandCache, CommandExecutor, SubscriptionService};
use crate::registry::{Registry, RegistryError, SqliteRegistry};
use crate::relay::{spawn_relays, Relay, RelayError};
use crate::utils::bootstrap::connect_registry_with_retry;

/// Errors raised while starting the runtime.
#[derive(Debug, thiserror::Error)]
pub enum StandaloneError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Messaging setup failed: {0}")]
    Messaging(Box<dyn std::error::Error + Send + Sync>),

    #[error("Dispatcher setup failed: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Relay setup failed: {0}")]
    Relay(#[from] RelayError),

    #[error("Failed to bind agent on {bind}: {source}")]
    Bind {
        bind: String,
        #[source]
        source: std::io::Error,
    },
}

/// Every eventrelay component running in this process.
pub struct Runtime {
    registry: Arc<SqliteRegistry>,
    channel: Arc<dyn DeliveryChannel>,
    inbound_channel: String,
    agent_addr: SocketAddr,
    agent_stop: oneshot::Sender<()>,
    agent_task: JoinHandle<()>,
    consumer: PollerHandle,
    relays: Vec<PollerHandle>,
}

impl Runtime {
    /// Connect the registry, bind the agent and start the consumers.
    ///
    /// The relay drains `relay.channels`, or when that is empty the channel
    /// of every subscriber registered at startup.
    pub async fn start(config: &Config) -> Result<Self, StandaloneError> {
        config.validate()?;
        let token = config.agent.resolve_token()?;

        let registry = connect_registry_with_retry(&config.registry).await?;
        let channel = init_delivery_channel(&config.messaging)
            .await
            .map_err(StandaloneError::Messaging)?;

        // Agent
        let cache = Arc::new(CommandCache::load(registry.as_ref()).await?);
        let executor = Arc::new(
            CommandExecutor::new(cache.clone(), config.agent.wait).with_shell(&config.agent.shell),
        );
        let subscriptions = Arc::new(SubscriptionService::new(registry.clone(), cache));
        let listener = tokio::net::TcpListener::bind(&config.agent.bind)
            .await
            .map_err(|source| StandaloneError::Bind {
                bind: config.agent.bind.clone(),
                source,
            })?;
        let agent_addr = listener.local_addr().map_err(|source| StandaloneError::Bind {
            bind: config.agent.bind.clone(),
            source,
        })?;

        let (agent_stop, stopped) = oneshot::channel::<()>();
        let state = AgentState::new(executor, subscriptions, token);
        let agent_task = tokio::spawn(async move {
            let shutdown = async move {
                let _ = stopped.await;
            };
            if let Err(e) = serve_on(state, listener, shutdown).await {
                error!(error = %e, "Agent API failed");
            }
        });

        // Dispatcher
        let predicates = PredicateRegistry::with_builtins(&config.acl);
        info!(predicates = ?predicates.names().collect::<Vec<_>>(), "ACL predicates registered");
        let engine = AclEngine::new(
            predicates,
            Duration::from_millis(config.dispatcher.predicate_timeout_ms),
        );
        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            engine,
            channel.clone(),
            DispatchLimits::from(&config.dispatcher),
        ));
        if config.dispatcher.validate_acl_on_start {
            let unresolved = dispatcher.unresolved_acl_functions().await?;
            if !unresolved.is_empty() {
                warn!(
                    functions = ?unresolved,
                    "ACL functions reference unknown predicates; events mapped to them are denied"
                );
            }
        }
        let consumer = spawn_inbound_consumer(dispatcher, &config.dispatcher);

        // Relay
        let mut relay_config = config.relay.clone();
        if relay_config.channels.is_empty() {
            relay_config.channels = registry
                .subscribers()
                .await?
                .into_iter()
                .map(|s| s.channel_ref)
                .collect();
        }
        if relay_config.channels.is_empty() {
            warn!("No subscriber channels to relay");
        }
        let relay = Arc::new(Relay::new(
            registry.clone(),
            channel.clone(),
            relay_config.http_timeout(),
        )?);
        let relays = spawn_relays(relay, &relay_config);

        info!(
            agent = %agent_addr,
            inbound = %config.dispatcher.inbound_channel,
            channels = ?relay_config.channels,
            "Standalone runtime started"
        );

        Ok(Self {
            registry,
            channel,
            inbound_channel: config.dispatcher.inbound_channel.clone(),
            agent_addr,
            agent_stop,
            agent_task,
            consumer,
            relays,
        })
    }

    pub fn registry(&self) -> &Arc<SqliteRegistry> {
        &self.registry
    }

    /// The channel shared by producers, dispatcher and relay.
    pub fn channel(&self) -> &Arc<dyn DeliveryChannel> {
        &self.channel
    }

    /// Address the agent API is bound to.
    pub fn agent_addr(&self) -> SocketAddr {
        self.agent_addr
    }

    /// Put a raw event body on the inbound channel.
    pub async fn publish(&self, body: &str, ordering_key: &str) -> crate::bus::Result<String> {
        self.channel
            .send(&self.inbound_channel, body, ordering_key)
            .await
    }

    /// Stop consumers first, then the agent.
    pub async fn shutdown(self) {
        self.consumer.shutdown().await;
        for relay in self.relays {
            relay.shutdown().await;
        }
        let _ = self.agent_stop.send(());
        if let Err(e) = self.agent_task.await {
            error!(error = %e, "Agent task panicked");
        }
        info!("Standalone runtime stopped");
    }
}
