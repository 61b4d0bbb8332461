//! eventrelay-dispatcher: authorized fan-out
//!
//! Consumes the inbound channel and forwards every event to the private
//! channel of each subscriber whose ACL chain grants it.
//!
//! ## Architecture
//! ```text
//! [producer] --> inbound channel --> [eventrelay-dispatcher] --> <username>-events channels
//!                                          |
//!                                    registry + ACL predicates
//! ```
//!
//! ## Configuration
//! - EVENTRELAY_CONFIG: path to a YAML config file (default: config.yaml)
//! - EVENTRELAY__DISPATCHER__INBOUND_CHANNEL: inbound channel reference
//! - EVENTRELAY__REGISTRY__PATH: SQLite registry path

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use eventrelay::acl::{AclEngine, PredicateRegistry};
use eventrelay::bus::init_delivery_channel;
use eventrelay::config::Config;
use eventrelay::dispatch::{spawn_inbound_consumer, DispatchLimits, Dispatcher};
use eventrelay::utils::bootstrap::{connect_registry_with_retry, init_tracing, shutdown_signal};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = Config::load(std::env::args().nth(1).as_deref())?;
    config.validate()?;
    config.require_shared_messaging("eventrelay-dispatcher")?;

    let registry = connect_registry_with_retry(&config.registry).await?;
    let channel = init_delivery_channel(&config.messaging)
        .await
        .map_err(|e| e as Box<dyn std::error::Error>)?;

    let predicates = PredicateRegistry::with_builtins(&config.acl);
    info!(predicates = ?predicates.names().collect::<Vec<_>>(), "ACL predicates registered");
    let engine = AclEngine::new(
        predicates,
        Duration::from_millis(config.dispatcher.predicate_timeout_ms),
    );
    let dispatcher = Arc::new(Dispatcher::new(
        registry,
        engine,
        channel,
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
    info!(
        inbound = %config.dispatcher.inbound_channel,
        max_concurrency = config.dispatcher.max_concurrency,
        "eventrelay-dispatcher started"
    );

    shutdown_signal().await;
    consumer.shutdown().await;
    info!("eventrelay-dispatcher stopped");
    Ok(())
}
