//! eventrelay-agent: subscriber-side command executor
//!
//! Serves the agent HTTP API. Events POSTed to `/` run the command the
//! subscriber registered for the event type, with `<key>` placeholders
//! filled from the event payload.
//!
//! ## Architecture
//! ```text
//! [eventrelay-relay] --(HTTP, bearer)--> [eventrelay-agent] --> sh -c <command>
//!                                               |
//!                                        command cache <-- registry
//! ```
//!
//! ## Configuration
//! - EVENTRELAY_CONFIG: path to a YAML config file (default: config.yaml)
//! - EVENTRELAY__AGENT__BIND: listen address (default: 0.0.0.0:8021)
//! - EVENTRELAY_AGENT_TOKEN: bearer token when `agent.token_file` is unset

use std::sync::Arc;

use tracing::info;

use eventrelay::api::{serve, AgentState};
use eventrelay::config::Config;
use eventrelay::executor::{CommandCache, CommandExecutor, SubscriptionService};
use eventrelay::utils::bootstrap::{connect_registry_with_retry, init_tracing, shutdown_signal};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = Config::load(std::env::args().nth(1).as_deref())?;
    config.validate()?;
    let token = config.agent.resolve_token()?;

    let registry = connect_registry_with_retry(&config.registry).await?;
    let cache = Arc::new(CommandCache::load(registry.as_ref()).await?);

    let executor = Arc::new(
        CommandExecutor::new(cache.clone(), config.agent.wait).with_shell(&config.agent.shell),
    );
    let subscriptions = Arc::new(SubscriptionService::new(registry, cache));
    let state = AgentState::new(executor, subscriptions, token);

    info!(bind = %config.agent.bind, wait = config.agent.wait, "eventrelay-agent started");
    serve(state, &config.agent.bind, shutdown_signal())
        .await
        .map_err(|e| e as Box<dyn std::error::Error>)?;

    info!("eventrelay-agent stopped");
    Ok(())
}
