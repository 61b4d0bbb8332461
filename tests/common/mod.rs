//! Shared fixtures for the pipeline integration tests.
//!
//! Wires an in-memory SQLite registry, one in-process channel bus, the
//! dispatcher, the relay and an agent on an ephemeral port.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use eventrelay::acl::{AclEngine, PredicateRegistry, ADMIN_TAG_CHECK};
use eventrelay::api::{router, AgentState};
use eventrelay::bus::{ChannelBus, DeliveryChannel};
use eventrelay::config::AclConfig;
use eventrelay::dispatch::{DispatchLimits, Dispatcher};
use eventrelay::executor::{CommandCache, CommandExecutor, SubscriptionService};
use eventrelay::registry::{RegistryStore, Role, SqliteRegistry, Subscriber};
use eventrelay::relay::Relay;

pub const INBOUND: &str = "inbound.fifo";
pub const AGENT_TOKEN: &str = "agent-token";

pub struct Pipeline {
    pub registry: Arc<SqliteRegistry>,
    pub channel: Arc<ChannelBus>,
    pub dispatcher: Arc<Dispatcher>,
    pub relay: Arc<Relay>,
    pub subscriptions: Arc<SubscriptionService>,
    pub workdir: tempfile::TempDir,
}

pub fn channel_of(username: &str) -> String {
    format!("{}-events.fifo", username)
}

impl Pipeline {
    /// Build the pipeline with alice (admin on strategy s1) and bob
    /// (viewer on s1) registered, and `admin_tag_check` guarding `t2`.
    pub async fn start() -> Self {
        let workdir = tempfile::tempdir().unwrap();
        let strategy_file = workdir.path().join("strategies.json");
        let mut file = std::fs::File::create(&strategy_file).unwrap();
        write!(
            file,
            r#"{{"s1": {{"users": {{"alice": ["admin"], "bob": ["viewer"]}}}}}}"#
        )
        .unwrap();

        let registry = Arc::new(SqliteRegistry::connect("sqlite::memory:").await.unwrap());
        registry.init().await.unwrap();

        let cache = Arc::new(CommandCache::new());
        let executor = Arc::new(CommandExecutor::new(cache.clone(), true));
        let subscriptions = Arc::new(SubscriptionService::new(registry.clone(), cache));
        let agent = spawn_agent(AgentState::new(executor, subscriptions.clone(), AGENT_TOKEN)).await;

        for username in ["alice", "bob"] {
            let subscriber =
                Subscriber::new(username, Role::User, channel_of(username), AGENT_TOKEN)
                    .with_agent_endpoint(agent.clone());
            registry.upsert_subscriber(&subscriber).await.unwrap();
        }
        registry
            .register_acl_function(ADMIN_TAG_CHECK, ADMIN_TAG_CHECK)
            .await
            .unwrap();
        registry
            .map_acl_function("t2", ADMIN_TAG_CHECK)
            .await
            .unwrap();

        let channel = Arc::new(ChannelBus::default());
        let acl = AclConfig {
            strategy_file: Some(strategy_file.display().to_string()),
        };
        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            AclEngine::new(PredicateRegistry::with_builtins(&acl), Duration::from_secs(2)),
            channel.clone(),
            DispatchLimits::default(),
        ));
        let relay = Arc::new(Relay::new(registry.clone(), channel.clone(), Duration::from_secs(5)).unwrap());

        Self {
            registry,
            channel,
            dispatcher,
            relay,
            subscriptions,
            workdir,
        }
    }

    /// File the subscription commands append to.
    pub fn output_file(&self) -> PathBuf {
        self.workdir.path().join("executed.log")
    }

    /// Subscribe `username` to `event_type` with a command recording who ran it.
    pub async fn subscribe(&self, username: &str, event_type: &str) {
        let command = format!(
            "echo '<username> {} <strategy>' >> '{}'",
            event_type,
            self.output_file().display()
        );
        self.subscriptions
            .subscribe(username, event_type, &command)
            .await
            .unwrap();
    }

    pub async fn publish(&self, body: &str) {
        self.channel.send(INBOUND, body, "producer").await.unwrap();
    }

    /// Drain the inbound channel through the dispatcher.
    pub async fn dispatch_pending(&self) {
        loop {
            let messages = self.channel.receive(INBOUND, 10).await.unwrap();
            if messages.is_empty() {
                return;
            }
            for message in messages {
                self.dispatcher.process(&message).await.unwrap();
            }
        }
    }

    /// Drain every subscriber channel through the relay.
    pub async fn relay_pending(&self) {
        for username in ["alice", "bob"] {
            loop {
                let messages = self
                    .channel
                    .receive(&channel_of(username), 10)
                    .await
                    .unwrap();
                if messages.is_empty() {
                    break;
                }
                for message in messages {
                    self.relay.relay(&message).await.unwrap();
                }
            }
        }
    }

    /// Lines appended by executed commands.
    pub fn executed(&self) -> Vec<String> {
        read_lines(&self.output_file())
    }
}

fn read_lines(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .map(|s| s.lines().map(str::to_string).collect())
        .unwrap_or_default()
}

async fn spawn_agent(state: AgentState) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, router(state)).await;
    });
    addr.to_string()
}
