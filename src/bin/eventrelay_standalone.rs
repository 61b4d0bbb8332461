//! eventrelay-standalone: every component in one process
//!
//! Runs the dispatcher, the relay and the agent API over a single delivery
//! channel. This is the deployment for the default in-process channel bus,
//! whose queues cannot be reached from other processes.
//!
//! ## Architecture
//! ```text
//! eventrelay-standalone
//!     ├── inbound channel --> Dispatcher --> <username>-events channels
//!     ├── <username>-events channels --> Relay --(HTTP, bearer)--> agent API
//!     └── agent API (agent.bind) --> sh -c <command>
//! ```
//!
//! Subscribers' `agent_endpoint` must point at `agent.bind`.
//!
//! ## Configuration
//! - EVENTRELAY_CONFIG: path to a YAML config file (default: config.yaml)
//! - EVENTRELAY_AGENT_TOKEN: agent bearer token when `agent.token_file` is unset
//! - relay.channels: channels to relay (default: every registered subscriber's)

use tracing::info;

use eventrelay::config::Config;
use eventrelay::standalone::Runtime;
use eventrelay::utils::bootstrap::{init_tracing, shutdown_signal};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = Config::load(std::env::args().nth(1).as_deref())?;
    let runtime = Runtime::start(&config).await?;
    info!(agent = %runtime.agent_addr(), "eventrelay-standalone started");

    shutdown_signal().await;
    runtime.shutdown().await;
    info!("eventrelay-standalone stopped");
    Ok(())
}
