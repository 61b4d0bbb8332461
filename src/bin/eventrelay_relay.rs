//! eventrelay-relay: subscriber channel to agent relay
//!
//! Drains the configured subscriber channels and delivers every event to
//! the owning subscriber's agent, with `username` injected.
//!
//! ## Architecture
//! ```text
//! <username>-events channel --> [eventrelay-relay] --(HTTP, bearer)--> [eventrelay-agent]
//! ```
//!
//! ## Configuration
//! - EVENTRELAY_CONFIG: path to a YAML config file (default: config.yaml)
//! - relay.channels: channel references to drain

use std::sync::Arc;

use tracing::{info, warn};

use eventrelay::bus::init_delivery_channel;
use eventrelay::config::Config;
use eventrelay::relay::{spawn_relays, Relay};
use eventrelay::utils::bootstrap::{connect_registry_with_retry, init_tracing, shutdown_signal};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = Config::load(std::env::args().nth(1).as_deref())?;
    config.validate()?;
    config.require_shared_messaging("eventrelay-relay")?;
    if config.relay.channels.is_empty() {
        warn!("relay.channels is empty, nothing to relay");
    }

    let registry = connect_registry_with_retry(&config.registry).await?;
    let channel = init_delivery_channel(&config.messaging)
        .await
        .map_err(|e| e as Box<dyn std::error::Error>)?;

    let relay = Arc::new(Relay::new(registry, channel, config.relay.http_timeout())?);
    let pollers = spawn_relays(relay, &config.relay);
    info!(channels = ?config.relay.channels, "eventrelay-relay started");

    shutdown_signal().await;
    for poller in pollers {
        poller.shutdown().await;
    }
    info!("eventrelay-relay stopped");
    Ok(())
}
