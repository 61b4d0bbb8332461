//! In-memory channel bus for standalone mode.
//!
//! Mirrors the semantics of a FIFO queue service within a single process:
//! per-group ordering, a dedup window keyed on body fingerprints, and a
//! visibility timeout after which unacknowledged messages are redelivered.
//! Ideal for local development and testing without external dependencies.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use super::{fingerprint, DeliveryChannel, ReceivedMessage, Result};

/// Configuration for the channel bus.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChannelBusConfig {
    /// How long a fingerprint suppresses identical sends (default: 300s).
    pub dedup_window_ms: u64,
    /// How long a received message stays hidden before redelivery (default: 30s).
    pub visibility_timeout_ms: u64,
}

impl Default for ChannelBusConfig {
    fn default() -> Self {
        Self {
            dedup_window_ms: 300_000,
            visibility_timeout_ms: 30_000,
        }
    }
}

impl ChannelBusConfig {
    pub fn dedup_window(&self) -> Duration {
        Duration::from_millis(self.dedup_window_ms)
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_millis(self.visibility_timeout_ms)
    }
}

#[derive(Debug, Clone)]
struct StoredMessage {
    message_id: String,
    body: String,
    ordering_key: String,
    receive_count: u32,
}

#[derive(Debug)]
struct InFlight {
    seq: u64,
    message: StoredMessage,
    visible_at: Instant,
}

#[derive(Debug, Default)]
struct Queue {
    next_seq: u64,
    /// Visible messages keyed by send sequence.
    pending: BTreeMap<u64, StoredMessage>,
    /// Received but unacknowledged messages keyed by receipt handle.
    in_flight: HashMap<String, InFlight>,
    /// Fingerprint -> (first sent at, message id).
    dedup: HashMap<String, (Instant, String)>,
}

impl Queue {
    fn expire(&mut self, now: Instant, dedup_window: Duration) {
        self.dedup
            .retain(|_, (sent_at, _)| now.duration_since(*sent_at) < dedup_window);

        let expired: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, f)| f.visible_at <= now)
            .map(|(receipt, _)| receipt.clone())
            .collect();
        for receipt in expired {
            if let Some(flight) = self.in_flight.remove(&receipt) {
                debug!(
                    message_id = %flight.message.message_id,
                    "Visibility timeout expired, message requeued"
                );
                self.pending.insert(flight.seq, flight.message);
            }
        }
    }
}

/// In-memory FIFO queues addressed by channel reference.
///
/// Channels are created on first use.
pub struct ChannelBus {
    config: ChannelBusConfig,
    queues: Mutex<HashMap<String, Queue>>,
}

impl ChannelBus {
    pub fn new(config: ChannelBusConfig) -> Self {
        Self {
            config,
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// Number of messages not yet acknowledged, visible or in flight.
    pub async fn depth(&self, channel_ref: &str) -> usize {
        self.queues
            .lock()
            .await
            .get(channel_ref)
            .map(|q| q.pending.len() + q.in_flight.len())
            .unwrap_or(0)
    }
}

impl Default for ChannelBus {
    fn default() -> Self {
        Self::new(ChannelBusConfig::default())
    }
}

#[async_trait]
impl DeliveryChannel for ChannelBus {
    #[tracing::instrument(name = "bus.send", skip_all, fields(channel = %channel_ref))]
    async fn send(&self, channel_ref: &str, body: &str, ordering_key: &str) -> Result<String> {
        let dedup_id = fingerprint(body);
        let now = Instant::now();

        let mut queues = self.queues.lock().await;
        let queue = queues.entry(channel_ref.to_string()).or_default();
        queue.expire(now, self.config.dedup_window());

        if let Some((_, message_id)) = queue.dedup.get(&dedup_id) {
            debug!(
                message_id = %message_id,
                dedup_id = %dedup_id,
                "Duplicate send suppressed"
            );
            return Ok(message_id.clone());
        }

        let message_id = uuid::Uuid::new_v4().to_string();
        let seq = queue.next_seq;
        queue.next_seq += 1;
        queue.pending.insert(
            seq,
            StoredMessage {
                message_id: message_id.clone(),
                body: body.to_string(),
                ordering_key: ordering_key.to_string(),
                receive_count: 0,
            },
        );
        queue.dedup.insert(dedup_id, (now, message_id.clone()));

        debug!(message_id = %message_id, ordering_key = %ordering_key, "Message enqueued");
        Ok(message_id)
    }

    async fn receive(&self, channel_ref: &str, max_messages: usize) -> Result<Vec<ReceivedMessage>> {
        let now = Instant::now();
        let mut queues = self.queues.lock().await;
        let Some(queue) = queues.get_mut(channel_ref) else {
            return Ok(Vec::new());
        };
        queue.expire(now, self.config.dedup_window());

        // A group with a message in flight is blocked until that message is
        // acked or becomes visible again.
        let blocked: HashSet<String> = queue
            .in_flight
            .values()
            .map(|f| f.message.ordering_key.clone())
            .collect();

        let selected: Vec<u64> = queue
            .pending
            .iter()
            .filter(|(_, m)| !blocked.contains(&m.ordering_key))
            .take(max_messages)
            .map(|(seq, _)| *seq)
            .collect();

        let visible_at = now + self.config.visibility_timeout();
        let mut received = Vec::with_capacity(selected.len());
        for seq in selected {
            let Some(mut message) = queue.pending.remove(&seq) else {
                continue;
            };
            message.receive_count += 1;

            let receipt_handle = uuid::Uuid::new_v4().to_string();
            received.push(ReceivedMessage {
                channel_ref: channel_ref.to_string(),
                message_id: message.message_id.clone(),
                body: message.body.clone(),
                receipt_handle: receipt_handle.clone(),
                ordering_key: Some(message.ordering_key.clone()),
                receive_count: message.receive_count,
            });
            queue.in_flight.insert(
                receipt_handle,
                InFlight {
                    seq,
                    message,
                    visible_at,
                },
            );
        }

        Ok(received)
    }

    async fn ack(&self, channel_ref: &str, receipt_handle: &str) -> Result<bool> {
        let now = Instant::now();
        let mut queues = self.queues.lock().await;
        let Some(queue) = queues.get_mut(channel_ref) else {
            return Ok(false);
        };
        queue.expire(now, self.config.dedup_window());
        Ok(queue.in_flight.remove(receipt_handle).is_some())
    }
}
