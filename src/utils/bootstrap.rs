//! Bootstrap utilities for eventrelay binaries.
//!
//! Shared initialization code for all eventrelay binaries.

use std::sync::Arc;

use backon::BackoffBuilder;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use super::retry::connection_backoff;
use crate::config::{RegistryConfig, LOG_ENV_VAR};
use crate::registry::{init_registry, RegistryError, SqliteRegistry};

/// Initialize tracing with EVENTRELAY_LOG environment variable.
///
/// Defaults to "info" level if EVENTRELAY_LOG is not set.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Open the registry, retrying with exponential backoff while the database
/// is unreachable.
pub async fn connect_registry_with_retry(
    config: &RegistryConfig,
) -> Result<Arc<SqliteRegistry>, RegistryError> {
    let mut backoff = connection_backoff().build();

    loop {
        match init_registry(config).await {
            Ok(registry) => {
                info!(path = %config.path, "Connected to registry");
                return Ok(registry);
            }
            Err(e) => match backoff.next() {
                Some(delay) => {
                    warn!(error = %e, retry_in = ?delay, "Registry unavailable, retrying");
                    tokio::time::sleep(delay).await;
                }
                None => return Err(e),
            },
        }
    }
}

/// Resolve when the process receives Ctrl-C.
pub async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
