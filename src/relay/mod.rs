//! Subscriber channel relay.
//!
//! Drains a subscriber's outbound channel and hands every event to that
//! subscriber's agent:
//! 1. Resolve the subscriber owning the channel
//! 2. Inject `username` into the JSON body
//! 3. POST to the agent endpoint with the subscriber's bearer credential
//! 4. Ack once the agent gave a definitive answer
//!
//! A definitive answer is a success or a non-retryable status (no command
//! subscribed, spawn failure, rejected credential): the event would fail the
//! same way again, so it is logged and acked. Timeouts, connection failures
//! and retryable statuses leave the message for redelivery, as does anything
//! that went wrong before the agent was reached.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{error, info, instrument, warn};

use crate::bus::{
    spawn_poller, BusError, DeliveryChannel, Disposition, MessageHandler, PollerConfig,
    PollerHandle, ReceivedMessage,
};
use crate::client::{AgentClient, ClientError};
use crate::config::RelayConfig;
use crate::event::{inject_username, EventError};
use crate::registry::{Registry, RegistryError};

/// Result type for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;

/// Reasons a message was not relayed and acked.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("No subscriber owns channel: {0}")]
    UnknownChannel(String),

    #[error("Subscriber {0} has no agent endpoint")]
    NoAgentEndpoint(String),

    #[error("Malformed event body: {0}")]
    MalformedBody(#[from] EventError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Agent delivery failed: {0}")]
    Delivery(#[from] ClientError),

    #[error("Ack failed after delivery: {0}")]
    Ack(#[from] BusError),
}

/// How the agent answered a relayed event. Both outcomes are acked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// The agent ran the subscriber's command.
    Executed { username: String },
    /// The agent refused the event with a non-retryable status.
    Refused {
        username: String,
        status: u16,
        reason: String,
    },
}

impl Delivery {
    pub fn username(&self) -> &str {
        match self {
            Delivery::Executed { username } | Delivery::Refused { username, .. } => username,
        }
    }
}

/// Relays subscriber channels to their agents.
pub struct Relay {
    registry: Arc<dyn Registry>,
    channel: Arc<dyn DeliveryChannel>,
    http: reqwest::Client,
}

impl Relay {
    pub fn new(
        registry: Arc<dyn Registry>,
        channel: Arc<dyn DeliveryChannel>,
        http_timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(http_timeout)
            .build()
            .map_err(ClientError::Http)?;
        Ok(Self {
            registry,
            channel,
            http,
        })
    }

    pub fn channel(&self) -> &Arc<dyn DeliveryChannel> {
        &self.channel
    }

    /// Deliver one message to its subscriber's agent and ack it once the
    /// agent answered definitively.
    #[instrument(
        name = "relay.relay",
        skip(self, message),
        fields(channel = %message.channel_ref, message_id = %message.message_id)
    )]
    pub async fn relay(&self, message: &ReceivedMessage) -> Result<Delivery> {
        let subscriber = self
            .registry
            .subscriber_by_channel(&message.channel_ref)
            .await?
            .ok_or_else(|| RelayError::UnknownChannel(message.channel_ref.clone()))?;

        let endpoint = subscriber
            .agent_endpoint
            .as_deref()
            .ok_or_else(|| RelayError::NoAgentEndpoint(subscriber.username.clone()))?;

        let body = inject_username(&message.body, &subscriber.username)?;
        let username = subscriber.username.clone();
        let client =
            AgentClient::with_client(self.http.clone(), endpoint, &subscriber.auth_credential);

        let delivery = match client.execute(body).await {
            Ok(()) => Delivery::Executed { username },
            Err(e) if e.is_retryable() => return Err(e.into()),
            Err(ClientError::Status { status, body }) => {
                warn!(
                    username = %username,
                    status = %status,
                    reason = %body,
                    "Agent refused event, acking without execution"
                );
                Delivery::Refused {
                    username,
                    status: status.as_u16(),
                    reason: body,
                }
            }
            Err(e) => return Err(e.into()),
        };

        if !self
            .channel
            .ack(&message.channel_ref, &message.receipt_handle)
            .await?
        {
            warn!("Receipt expired before ack, message may be delivered again");
        }

        if let Delivery::Executed { username } = &delivery {
            info!(username = %username, "Event relayed to agent");
        }
        Ok(delivery)
    }
}

#[async_trait]
impl MessageHandler for Relay {
    async fn handle(&self, message: ReceivedMessage) -> Disposition {
        match self.relay(&message).await {
            Ok(_) => Disposition::Done,
            Err(e @ (RelayError::UnknownChannel(_) | RelayError::NoAgentEndpoint(_))) => {
                warn!(
                    channel = %message.channel_ref,
                    message_id = %message.message_id,
                    error = %e,
                    "Message left on channel"
                );
                Disposition::Redeliver
            }
            Err(e) => {
                error!(
                    channel = %message.channel_ref,
                    message_id = %message.message_id,
                    receive_count = message.receive_count,
                    error = %e,
                    "Relay failed, message will be redelivered"
                );
                Disposition::Redeliver
            }
        }
    }
}

/// Start one poller per configured channel.
pub fn spawn_relays(relay: Arc<Relay>, config: &RelayConfig) -> Vec<PollerHandle> {
    config
        .channels
        .iter()
        .map(|channel_ref| {
            info!(channel = %channel_ref, "Relaying channel");
            spawn_poller(
                relay.channel().clone(),
                PollerConfig {
                    channel_ref: channel_ref.clone(),
                    max_messages: config.max_messages,
                    idle_poll: config.idle_poll(),
                },
                relay.clone(),
            )
        })
        .collect()
}
