//! Mock delivery channel for testing.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{
    fingerprint, BusError, ChannelBus, ChannelBusConfig, DeliveryChannel, ReceivedMessage, Result,
};

/// A send observed by the mock.
#[derive(Debug, Clone, PartialEq)]
pub struct SentMessage {
    pub channel_ref: String,
    pub body: String,
    pub ordering_key: String,
    pub dedup_id: String,
}

/// Mock delivery channel for testing.
///
/// Wraps a `ChannelBus` so messages can be received and acked, records every
/// send attempt, and injects failures per channel.
#[derive(Default)]
pub struct MockChannel {
    inner: ChannelBus,
    sent: RwLock<Vec<SentMessage>>,
    fail_channels: RwLock<HashSet<String>>,
    fail_receive: RwLock<bool>,
    fail_ack: RwLock<bool>,
    send_delay: RwLock<Option<Duration>>,
}

impl MockChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: ChannelBusConfig) -> Self {
        Self {
            inner: ChannelBus::new(config),
            ..Self::default()
        }
    }

    /// Make every send to `channel_ref` fail.
    pub async fn set_fail_on_send(&self, channel_ref: &str, fail: bool) {
        let mut channels = self.fail_channels.write().await;
        if fail {
            channels.insert(channel_ref.to_string());
        } else {
            channels.remove(channel_ref);
        }
    }

    pub async fn set_fail_on_receive(&self, fail: bool) {
        *self.fail_receive.write().await = fail;
    }

    pub async fn set_fail_on_ack(&self, fail: bool) {
        *self.fail_ack.write().await = fail;
    }

    pub async fn set_send_delay(&self, delay: Option<Duration>) {
        *self.send_delay.write().await = delay;
    }

    /// Every successful send, including ones suppressed as duplicates.
    pub async fn sent(&self) -> Vec<SentMessage> {
        self.sent.read().await.clone()
    }

    pub async fn sent_to(&self, channel_ref: &str) -> Vec<SentMessage> {
        self.sent
            .read()
            .await
            .iter()
            .filter(|m| m.channel_ref == channel_ref)
            .cloned()
            .collect()
    }

    pub async fn depth(&self, channel_ref: &str) -> usize {
        self.inner.depth(channel_ref).await
    }
}

#[async_trait]
impl DeliveryChannel for MockChannel {
    async fn send(&self, channel_ref: &str, body: &str, ordering_key: &str) -> Result<String> {
        let delay = *self.send_delay.read().await;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_channels.read().await.contains(channel_ref) {
            return Err(BusError::Send(format!(
                "Mock send failure on {}",
                channel_ref
            )));
        }

        let id = self.inner.send(channel_ref, body, ordering_key).await?;
        self.sent.write().await.push(SentMessage {
            channel_ref: channel_ref.to_string(),
            body: body.to_string(),
            ordering_key: ordering_key.to_string(),
            dedup_id: fingerprint(body),
        });
        Ok(id)
    }

    async fn receive(&self, channel_ref: &str, max_messages: usize) -> Result<Vec<ReceivedMessage>> {
        if *self.fail_receive.read().await {
            return Err(BusError::Receive("Mock receive failure".to_string()));
        }
        self.inner.receive(channel_ref, max_messages).await
    }

    async fn ack(&self, channel_ref: &str, receipt_handle: &str) -> Result<bool> {
        if *self.fail_ack.read().await {
            return Err(BusError::Ack("Mock ack failure".to_string()));
        }
        self.inner.ack(channel_ref, receipt_handle).await
    }
}
