//! Inbound channel consumer feeding the dispatcher.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, warn};

use super::{DispatchError, Dispatcher};
use crate::bus::{
    spawn_poller, Disposition, MessageHandler, PollerConfig, PollerHandle, ReceivedMessage,
};
use crate::config::DispatcherConfig;

/// Dispatches every message received from the inbound channel.
pub struct InboundConsumer {
    dispatcher: Arc<Dispatcher>,
}

impl InboundConsumer {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }
}

#[async_trait]
impl MessageHandler for InboundConsumer {
    async fn handle(&self, message: ReceivedMessage) -> Disposition {
        match self.dispatcher.process(&message).await {
            Ok(_) => Disposition::Done,
            Err(DispatchError::MalformedEvent(e)) => {
                // Left unacked; the queue's redrive policy decides its fate.
                warn!(
                    message_id = %message.message_id,
                    receive_count = message.receive_count,
                    error = %e,
                    "Malformed inbound event left unacknowledged"
                );
                Disposition::Redeliver
            }
            Err(e) => {
                error!(
                    message_id = %message.message_id,
                    error = %e,
                    "Dispatch failed, message will be redelivered"
                );
                Disposition::Redeliver
            }
        }
    }
}

/// Start polling the configured inbound channel.
pub fn spawn_inbound_consumer(dispatcher: Arc<Dispatcher>, config: &DispatcherConfig) -> PollerHandle {
    let channel = dispatcher.channel().clone();
    spawn_poller(
        channel,
        PollerConfig {
            channel_ref: config.inbound_channel.clone(),
            max_messages: config.max_messages,
            idle_poll: config.idle_poll(),
        },
        Arc::new(InboundConsumer::new(dispatcher)),
    )
}
