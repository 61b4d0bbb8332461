//! Delivery channels for inbound and per-subscriber outbound messages.
//!
//! This module contains:
//! - `DeliveryChannel` trait: send/receive/ack over a durable, at-least-once,
//!   ordered-per-group queue
//! - Dedup fingerprints over canonicalized bodies
//! - Bus configuration types
//! - Implementations: in-process channel bus, SQS FIFO (feature `sqs`), Mock

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::info;

// Implementation modules
pub mod channel;
pub mod mock;
pub mod poller;
#[cfg(feature = "sqs")]
pub mod sqs;

// Re-exports
pub use channel::{ChannelBus, ChannelBusConfig};
pub use mock::{MockChannel, SentMessage};
pub use poller::{spawn_poller, Disposition, MessageHandler, PollerConfig, PollerHandle};
#[cfg(feature = "sqs")]
pub use sqs::SqsChannel;

// ============================================================================
// Traits
// ============================================================================

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Send failed: {0}")]
    Send(String),

    #[error("Receive failed: {0}")]
    Receive(String),

    #[error("Ack failed: {0}")]
    Ack(String),

    #[error("Invalid channel reference: {0}")]
    InvalidChannel(String),
}

/// A message taken from a channel and not yet acknowledged.
///
/// Until it is acked the message stays invisible for the channel's
/// visibility timeout and then becomes receivable again.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedMessage {
    /// Channel the message was received from.
    pub channel_ref: String,
    /// Stable identity assigned at send time.
    pub message_id: String,
    /// The body exactly as it was sent.
    pub body: String,
    /// Token proving this receive, required to ack.
    pub receipt_handle: String,
    /// Ordering group of the message, when the channel reports it.
    pub ordering_key: Option<String>,
    /// How many times this message has been received, including this time.
    pub receive_count: u32,
}

/// Interface for durable delivery channels.
///
/// Implementations:
/// - `ChannelBus`: in-process FIFO queues with dedup and visibility timeout
/// - `SqsChannel`: AWS SQS FIFO queues
/// - `MockChannel`: `ChannelBus` plus send recording and failure injection
#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    /// Enqueue a body. Messages sharing `ordering_key` are delivered in send
    /// order. A body whose fingerprint was sent within the dedup window is
    /// accepted but not enqueued twice.
    ///
    /// Returns the delivery id of the (possibly earlier) message.
    async fn send(&self, channel_ref: &str, body: &str, ordering_key: &str) -> Result<String>;

    /// Take up to `max_messages` visible messages.
    async fn receive(&self, channel_ref: &str, max_messages: usize) -> Result<Vec<ReceivedMessage>>;

    /// Remove a received message for good.
    ///
    /// Returns false when the receipt is unknown or has expired.
    async fn ack(&self, channel_ref: &str, receipt_handle: &str) -> Result<bool>;
}

// ============================================================================
// Fingerprints
// ============================================================================

/// Deterministic dedup token for a body.
///
/// SHA-256 over the canonical JSON form (object keys sorted, no
/// insignificant whitespace), hex-encoded. Bodies that are not JSON are
/// hashed as raw bytes.
pub fn fingerprint(body: &str) -> String {
    let canonical = match serde_json::from_str::<Value>(body) {
        Ok(value) => canonical_json(&value),
        Err(_) => body.to_string(),
    };
    compute_hash(canonical.as_bytes())
}

fn compute_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Serialize a JSON value with object keys in sorted order at every depth.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                if let Some(v) = map.get(key) {
                    write_canonical(v, out);
                }
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Convert an SQS queue ARN into its queue URL.
///
/// `arn:aws:sqs:us-east-1:123456789012:orders.fifo` becomes
/// `https://sqs.us-east-1.amazonaws.com/123456789012/orders.fifo`.
pub fn queue_url_from_arn(arn: &str) -> Result<String> {
    let parts: Vec<&str> = arn.split(':').collect();
    match parts.as_slice() {
        ["arn", partition, "sqs", region, account, name]
            if !partition.is_empty()
                && !region.is_empty()
                && !account.is_empty()
                && !name.is_empty() =>
        {
            Ok(format!(
                "https://sqs.{}.amazonaws.com/{}/{}",
                region, account, name
            ))
        }
        _ => Err(BusError::InvalidChannel(arn.to_string())),
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Messaging type discriminator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessagingType {
    /// In-process channel bus (single process, no external broker).
    #[default]
    Channel,
    /// AWS SQS FIFO queues.
    Sqs,
}

/// Messaging configuration (discriminated union).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// Messaging type discriminator.
    #[serde(rename = "type")]
    pub messaging_type: MessagingType,
    /// Channel bus configuration.
    pub channel: ChannelBusConfig,
    /// SQS-specific configuration.
    pub sqs: SqsConfig,
}

/// SQS-specific configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SqsConfig {
    /// AWS region (e.g., "us-east-1"). Uses default provider chain if not set.
    pub region: Option<String>,
    /// Custom endpoint URL (for LocalStack or testing).
    pub endpoint_url: Option<String>,
    /// Wait time seconds for long polling (default: 20).
    pub wait_time_secs: i32,
    /// Visibility timeout applied to received messages (default: 30).
    pub visibility_timeout_secs: i32,
}

impl Default for SqsConfig {
    fn default() -> Self {
        Self {
            region: None,
            endpoint_url: None,
            wait_time_secs: 20,
            visibility_timeout_secs: 30,
        }
    }
}

// ============================================================================
// Factory
// ============================================================================

/// Initialize the delivery channel based on configuration.
///
/// SQS requires the `sqs` feature.
pub async fn init_delivery_channel(
    config: &MessagingConfig,
) -> std::result::Result<Arc<dyn DeliveryChannel>, Box<dyn std::error::Error + Send + Sync>> {
    match config.messaging_type {
        MessagingType::Channel => {
            info!(messaging_type = "channel", "Delivery channel initialized");
            Ok(Arc::new(ChannelBus::new(config.channel.clone())))
        }
        MessagingType::Sqs => {
            #[cfg(feature = "sqs")]
            {
                let bus = SqsChannel::new(config.sqs.clone()).await?;
                info!(messaging_type = "sqs", "Delivery channel initialized");
                Ok(Arc::new(bus))
            }

            #[cfg(not(feature = "sqs"))]
            {
                Err("SQS support requires the 'sqs' feature. Rebuild with --features sqs".into())
            }
        }
    }
}
