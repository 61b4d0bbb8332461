//! Authorized fan-out of inbound events.
//!
//! One inbound message is dispatched at a time:
//! 1. Parse `event_type` (a malformed body is never acked)
//! 2. Load the subscribers and the ordered ACL chain of the event type
//! 3. Evaluate the chain per subscriber; faults deny only that subscriber
//! 4. Forward the original body to every authorized subscriber's channel,
//!    with bounded concurrency and ordering keys assigned up front
//! 5. Ack the inbound message once every forward attempt has finished
//!
//! Per-subscriber failures are logged and absorbed. Recovery relies on
//! redelivery of the whole inbound message, which is safe because every
//! forward carries a deterministic dedup fingerprint.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tracing::{debug, error, info, warn, Span};

use crate::acl::{AclEngine, AclError};
use crate::bus::{BusError, DeliveryChannel, ReceivedMessage};
use crate::config::DispatcherConfig;
use crate::event::{Event, EventError};
use crate::registry::{AclFunction, Registry, RegistryError};

mod consumer;

pub use consumer::{spawn_inbound_consumer, InboundConsumer};

/// Result type for dispatch operations.
pub type Result<T> = std::result::Result<T, DispatchError>;

/// Event-level dispatch failures. The inbound message is left unacked.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Malformed event: {0}")]
    MalformedEvent(#[from] EventError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Registry query timed out after {0:?}")]
    RegistryTimeout(Duration),
}

/// Timeouts and concurrency bounds applied to one dispatch.
#[derive(Debug, Clone)]
pub struct DispatchLimits {
    pub max_concurrency: usize,
    pub registry_timeout: Duration,
    pub send_timeout: Duration,
}

impl Default for DispatchLimits {
    fn default() -> Self {
        Self::from(&DispatcherConfig::default())
    }
}

impl From<&DispatcherConfig> for DispatchLimits {
    fn from(config: &DispatcherConfig) -> Self {
        Self {
            max_concurrency: config.max_concurrency.max(1),
            registry_timeout: Duration::from_millis(config.registry_timeout_ms),
            send_timeout: Duration::from_millis(config.send_timeout_ms),
        }
    }
}

/// Outcome of the ACL chain for one subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authorization {
    Granted,
    Denied,
    /// The chain could not be evaluated. Treated as denied.
    Fault(String),
}

impl Authorization {
    pub fn is_granted(&self) -> bool {
        matches!(self, Authorization::Granted)
    }
}

/// Why forwarding to one authorized subscriber failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryFault {
    #[error("subscriber has no delivery channel")]
    NoChannel,

    #[error("channel lookup failed: {0}")]
    Lookup(String),

    #[error("send failed: {0}")]
    Send(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

/// What happened to one inbound event. Not persisted.
#[derive(Debug, Clone)]
pub struct DispatchRecord {
    pub event: Event,
    /// Subscribers of the event type, in registry order.
    pub subscribers: Vec<String>,
    pub authorization: BTreeMap<String, Authorization>,
    /// Subscribers whose channel accepted the body.
    pub forwarded: BTreeSet<String>,
    pub failures: BTreeMap<String, DeliveryFault>,
    /// Whether the inbound message was acked.
    pub acknowledged: bool,
}

impl DispatchRecord {
    /// The subscribers entitled to the event.
    pub fn authorized(&self) -> BTreeSet<String> {
        self.authorization
            .iter()
            .filter(|(_, a)| a.is_granted())
            .map(|(u, _)| u.clone())
            .collect()
    }
}

/// Ordering key of a subscriber's outbound channel.
///
/// Keys are per subscriber so that one subscriber's events stay in order
/// without serializing delivery across subscribers.
pub fn ordering_key(username: &str) -> String {
    format!("{}-events", username)
}

struct Outcome {
    username: String,
    authorization: Authorization,
    delivery: Option<std::result::Result<(), DeliveryFault>>,
}

/// Fans inbound events out to authorized subscribers.
pub struct Dispatcher {
    registry: Arc<dyn Registry>,
    acl: AclEngine,
    channel: Arc<dyn DeliveryChannel>,
    limits: DispatchLimits,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<dyn Registry>,
        acl: AclEngine,
        channel: Arc<dyn DeliveryChannel>,
        limits: DispatchLimits,
    ) -> Self {
        Self {
            registry,
            acl,
            channel,
            limits,
        }
    }

    pub fn channel(&self) -> &Arc<dyn DeliveryChannel> {
        &self.channel
    }

    /// Names of registered ACL functions whose reference has no predicate.
    pub async fn unresolved_acl_functions(&self) -> Result<Vec<String>> {
        let functions = self.query(self.registry.acl_functions()).await?;
        Ok(self.acl.predicates().validate(&functions))
    }

    /// Dispatch one inbound message and ack it when every forward attempt
    /// has completed.
    ///
    /// Event-level errors leave the message unacked for redelivery.
    pub async fn process(&self, message: &ReceivedMessage) -> Result<DispatchRecord> {
        let mut record = self.dispatch(&message.body).await?;

        match self
            .channel
            .ack(&message.channel_ref, &message.receipt_handle)
            .await
        {
            Ok(acked) => {
                if !acked {
                    warn!(
                        message_id = %message.message_id,
                        "Inbound receipt expired before ack, message will be redelivered"
                    );
                }
                record.acknowledged = acked;
            }
            Err(e) => {
                error!(message_id = %message.message_id, error = %e, "Failed to ack inbound message");
            }
        }

        Ok(record)
    }

    /// Authorize and forward one event body. Does not ack.
    #[tracing::instrument(name = "dispatch", skip_all, fields(event_type = tracing::field::Empty))]
    pub async fn dispatch(&self, body: &str) -> Result<DispatchRecord> {
        let event = Event::parse(body.as_bytes()).inspect_err(|e| {
            warn!(error = %e, "Rejecting malformed event");
        })?;
        Span::current().record("event_type", event.event_type.as_str());

        let subscribers = self
            .query(self.registry.subscribers_for_event(&event.event_type))
            .await?;
        let chain = self
            .query(self.registry.acl_chain_for_event(&event.event_type))
            .await?;

        debug!(
            subscribers = subscribers.len(),
            acl_chain = ?chain.iter().map(|f| f.name.as_str()).collect::<Vec<_>>(),
            "Resolved subscribers and ACL chain"
        );

        // Ordering keys are fixed before any concurrent work starts.
        let targets: Vec<(String, String)> = subscribers
            .iter()
            .map(|u| (u.clone(), ordering_key(u)))
            .collect();

        let outcomes: Vec<Outcome> = stream::iter(targets)
            .map(|(username, key)| self.fan_out_one(username, key, &chain, &event, body))
            .buffer_unordered(self.limits.max_concurrency)
            .collect()
            .await;

        let mut record = DispatchRecord {
            event,
            subscribers,
            authorization: BTreeMap::new(),
            forwarded: BTreeSet::new(),
            failures: BTreeMap::new(),
            acknowledged: false,
        };
        for outcome in outcomes {
            match outcome.delivery {
                Some(Ok(())) => {
                    record.forwarded.insert(outcome.username.clone());
                }
                Some(Err(fault)) => {
                    record.failures.insert(outcome.username.clone(), fault);
                }
                None => {}
            }
            record
                .authorization
                .insert(outcome.username, outcome.authorization);
        }

        info!(
            subscribers = record.subscribers.len(),
            authorized = record.authorized().len(),
            forwarded = record.forwarded.len(),
            failed = record.failures.len(),
            "Event dispatched"
        );
        Ok(record)
    }

    async fn fan_out_one(
        &self,
        username: String,
        key: String,
        chain: &[AclFunction],
        event: &Event,
        body: &str,
    ) -> Outcome {
        let authorization = match self.acl.evaluate(chain, &username, event).await {
            Ok(true) => Authorization::Granted,
            Ok(false) => Authorization::Denied,
            Err(e) => {
                log_policy_fault(&username, &e);
                Authorization::Fault(e.to_string())
            }
        };

        let delivery = if authorization.is_granted() {
            let result = self.forward(&username, &key, body).await;
            if let Err(ref fault) = result {
                error!(subscriber = %username, error = %fault, "Delivery failed");
            }
            Some(result)
        } else {
            None
        };

        Outcome {
            username,
            authorization,
            delivery,
        }
    }

    async fn forward(
        &self,
        username: &str,
        key: &str,
        body: &str,
    ) -> std::result::Result<(), DeliveryFault> {
        let channel_ref = tokio::time::timeout(
            self.limits.registry_timeout,
            self.registry.channel_for_subscriber(username),
        )
        .await
        .map_err(|_| DeliveryFault::Timeout(self.limits.registry_timeout))?
        .map_err(|e| DeliveryFault::Lookup(e.to_string()))?
        .ok_or(DeliveryFault::NoChannel)?;

        let delivery_id = tokio::time::timeout(
            self.limits.send_timeout,
            self.channel.send(&channel_ref, body, key),
        )
        .await
        .map_err(|_| DeliveryFault::Timeout(self.limits.send_timeout))?
        .map_err(|e: BusError| DeliveryFault::Send(e.to_string()))?;

        debug!(
            subscriber = %username,
            channel = %channel_ref,
            delivery_id = %delivery_id,
            "Forwarded event"
        );
        Ok(())
    }

    async fn query<T>(
        &self,
        fut: impl Future<Output = std::result::Result<T, RegistryError>>,
    ) -> Result<T> {
        tokio::time::timeout(self.limits.registry_timeout, fut)
            .await
            .map_err(|_| DispatchError::RegistryTimeout(self.limits.registry_timeout))?
            .map_err(DispatchError::from)
    }
}

fn log_policy_fault(username: &str, error: &AclError) {
    match error {
        AclError::UnknownPredicate(reference) => error!(
            subscriber = %username,
            reference = %reference,
            "ACL function has no registered predicate, denying"
        ),
        _ => warn!(subscriber = %username, error = %error, "ACL evaluation failed, denying"),
    }
}

#[cfg(test)]
mod tests;
