//! Background receive loop over a delivery channel.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::BackoffBuilder;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::{DeliveryChannel, ReceivedMessage};
use crate::utils::retry::{receive_backoff, RECEIVE_MAX_DELAY};

/// What a handler did with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Acked, or deliberately dropped.
    Done,
    /// Left unacked for redelivery after the visibility timeout.
    Redeliver,
}

/// Processes messages taken from a channel.
///
/// The handler owns acknowledgement: a message it does not ack is
/// redelivered after the channel's visibility timeout.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: ReceivedMessage) -> Disposition;
}

/// What a poller drains and how fast.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub channel_ref: String,
    pub max_messages: usize,
    /// Sleep after a poll that returned nothing.
    pub idle_poll: Duration,
}

/// Handle to a running poller.
pub struct PollerHandle {
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl PollerHandle {
    /// Signal the poller to stop after the message it is handling.
    pub fn stop(&self) {
        let _ = self.cancel.send(true);
    }

    /// Stop and wait for the loop to exit.
    pub async fn shutdown(self) {
        self.stop();
        if let Err(e) = self.task.await {
            error!(error = %e, "Poller task panicked");
        }
    }
}

/// Spawn a task that polls `config.channel_ref` and feeds every message to
/// `handler`, one at a time, until stopped.
///
/// Once a message is left for redelivery, the rest of its ordering group in
/// the same batch is left unhandled too, so the group is redelivered in send
/// order.
///
/// Receive errors back off exponentially; the delay resets after the next
/// successful receive.
pub fn spawn_poller(
    channel: Arc<dyn DeliveryChannel>,
    config: PollerConfig,
    handler: Arc<dyn MessageHandler>,
) -> PollerHandle {
    let (cancel_tx, mut cancel_rx) = watch::channel(false);

    let task = tokio::spawn(async move {
        info!(channel = %config.channel_ref, "Poller started");
        let mut backoff = receive_backoff().build();

        loop {
            if *cancel_rx.borrow() {
                break;
            }

            let delay = tokio::select! {
                result = channel.receive(&config.channel_ref, config.max_messages) => {
                    match result {
                        Ok(messages) if messages.is_empty() => {
                            backoff = receive_backoff().build();
                            Some(config.idle_poll)
                        }
                        Ok(messages) => {
                            backoff = receive_backoff().build();
                            debug!(
                                channel = %config.channel_ref,
                                count = messages.len(),
                                "Received messages"
                            );
                            handle_batch(handler.as_ref(), messages).await;
                            None
                        }
                        Err(e) => {
                            let delay = backoff.next().unwrap_or(RECEIVE_MAX_DELAY);
                            error!(
                                channel = %config.channel_ref,
                                error = %e,
                                retry_in = ?delay,
                                "Receive failed"
                            );
                            Some(delay)
                        }
                    }
                }
                changed = cancel_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    None
                }
            };

            if let Some(delay) = delay {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    changed = cancel_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }

        info!(channel = %config.channel_ref, "Poller stopped");
    });

    PollerHandle {
        cancel: cancel_tx,
        task,
    }
}

async fn handle_batch(handler: &dyn MessageHandler, messages: Vec<ReceivedMessage>) {
    let mut held: HashSet<String> = HashSet::new();

    for message in messages {
        if let Some(key) = &message.ordering_key {
            if held.contains(key) {
                debug!(
                    message_id = %message.message_id,
                    ordering_key = %key,
                    "Earlier message of group left for redelivery, holding back"
                );
                continue;
            }
        }

        let ordering_key = message.ordering_key.clone();
        if handler.handle(message).await == Disposition::Redeliver {
            if let Some(key) = ordering_key {
                held.insert(key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::bus::{ChannelBusConfig, MockChannel};

    struct AckingHandler {
        channel: Arc<MockChannel>,
        handled: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl MessageHandler for AckingHandler {
        async fn handle(&self, message: ReceivedMessage) -> Disposition {
            self.handled.fetch_add(1, Ordering::SeqCst);
            let _ = self
                .channel
                .ack(&message.channel_ref, &message.receipt_handle)
                .await;
            Disposition::Done
        }
    }

    /// Leaves `fail_once` unacked on its first attempt, acks everything else
    /// and records the bodies in handling order.
    struct FlakyHandler {
        channel: Arc<MockChannel>,
        fail_once: String,
        failed: tokio::sync::Mutex<bool>,
        order: tokio::sync::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl MessageHandler for FlakyHandler {
        async fn handle(&self, message: ReceivedMessage) -> Disposition {
            self.order.lock().await.push(message.body.clone());
            let mut failed = self.failed.lock().await;
            if message.body == self.fail_once && !*failed {
                *failed = true;
                return Disposition::Redeliver;
            }
            let _ = self
                .channel
                .ack(&message.channel_ref, &message.receipt_handle)
                .await;
            Disposition::Done
        }
    }

    fn config() -> PollerConfig {
        PollerConfig {
            channel_ref: "inbound".to_string(),
            max_messages: 10,
            idle_poll: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn test_poller_drains_channel_and_stops() {
        let channel = Arc::new(MockChannel::new());
        for n in 0..3 {
            channel
                .send("inbound", &format!(r#"{{"n":{}}}"#, n), "g")
                .await
                .unwrap();
        }

        let handled = Arc::new(AtomicUsize::new(0));
        let handle = spawn_poller(
            channel.clone(),
            config(),
            Arc::new(AckingHandler {
                channel: channel.clone(),
                handled: handled.clone(),
            }),
        );

        for _ in 0..100 {
            if handled.load(Ordering::SeqCst) == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        handle.shutdown().await;

        assert_eq!(handled.load(Ordering::SeqCst), 3);
        assert_eq!(channel.depth("inbound").await, 0);
    }

    #[tokio::test]
    async fn test_poller_survives_receive_errors() {
        let channel = Arc::new(MockChannel::new());
        channel.set_fail_on_receive(true).await;

        let handled = Arc::new(AtomicUsize::new(0));
        let handle = spawn_poller(
            channel.clone(),
            config(),
            Arc::new(AckingHandler {
                channel: channel.clone(),
                handled: handled.clone(),
            }),
        );
        tokio::time::sleep(Duration::from_millis(20)).await;

        channel.set_fail_on_receive(false).await;
        channel.send("inbound", "{}", "g").await.unwrap();

        for _ in 0..200 {
            if handled.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.shutdown().await;
        assert_eq!(handled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_message_holds_back_its_group() {
        let channel = Arc::new(MockChannel::with_config(ChannelBusConfig {
            visibility_timeout_ms: 50,
            ..ChannelBusConfig::default()
        }));
        for body in ["a0", "a1", "a2"] {
            channel.send("inbound", body, "alice").await.unwrap();
        }
        channel.send("inbound", "b0", "bob").await.unwrap();

        let handler = Arc::new(FlakyHandler {
            channel: channel.clone(),
            fail_once: "a0".to_string(),
            failed: tokio::sync::Mutex::new(false),
            order: tokio::sync::Mutex::new(Vec::new()),
        });
        let handle = spawn_poller(channel.clone(), config(), handler.clone());

        for _ in 0..200 {
            if channel.depth("inbound").await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.shutdown().await;

        let order = handler.order.lock().await.clone();
        assert_eq!(order, vec!["a0", "b0", "a0", "a1", "a2"]);
        assert_eq!(channel.depth("inbound").await, 0);
    }
}
