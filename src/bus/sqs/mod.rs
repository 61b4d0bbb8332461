//! AWS SQS FIFO delivery channel.
//!
//! Channel references are queue URLs; queue ARNs are accepted and converted.
//! The ordering key becomes the `MessageGroupId` and the body fingerprint the
//! `MessageDeduplicationId`, so the broker enforces per-subscriber order and
//! suppresses re-sends of the same event.

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_sqs::types::MessageSystemAttributeName;
use aws_sdk_sqs::Client as SqsClient;
use tracing::{debug, info, warn};

use super::{
    fingerprint, queue_url_from_arn, BusError, DeliveryChannel, ReceivedMessage, Result,
    SqsConfig,
};

/// SQS caps a single receive at ten messages.
const MAX_RECEIVE_BATCH: usize = 10;

/// AWS SQS FIFO delivery channel.
pub struct SqsChannel {
    sqs: SqsClient,
    config: SqsConfig,
}

impl SqsChannel {
    /// Create a new SQS channel.
    pub async fn new(config: SqsConfig) -> Result<Self> {
        let mut aws_config_builder = aws_config::defaults(BehaviorVersion::latest());

        if let Some(ref region) = config.region {
            aws_config_builder =
                aws_config_builder.region(aws_config::Region::new(region.clone()));
        }

        if let Some(ref endpoint) = config.endpoint_url {
            aws_config_builder = aws_config_builder.endpoint_url(endpoint);
        }

        let aws_config = aws_config_builder.load().await;
        let sqs = SqsClient::new(&aws_config);

        info!(
            region = ?config.region,
            endpoint = ?config.endpoint_url,
            "Connected to AWS SQS"
        );

        Ok(Self { sqs, config })
    }

    fn queue_url(channel_ref: &str) -> Result<String> {
        if channel_ref.starts_with("arn:") {
            queue_url_from_arn(channel_ref)
        } else {
            Ok(channel_ref.to_string())
        }
    }
}

#[async_trait]
impl DeliveryChannel for SqsChannel {
    #[tracing::instrument(name = "bus.send", skip_all, fields(channel = %channel_ref))]
    async fn send(&self, channel_ref: &str, body: &str, ordering_key: &str) -> Result<String> {
        let queue_url = Self::queue_url(channel_ref)?;
        let dedup_id = fingerprint(body);

        let output = self
            .sqs
            .send_message()
            .queue_url(&queue_url)
            .message_body(body)
            .message_group_id(ordering_key)
            .message_deduplication_id(&dedup_id)
            .send()
            .await
            .map_err(|e| BusError::Send(format!("Failed to send to SQS: {}", e)))?;

        let message_id = output.message_id().unwrap_or_default().to_string();
        debug!(
            message_id = %message_id,
            ordering_key = %ordering_key,
            dedup_id = %dedup_id,
            "Sent message to SQS"
        );
        Ok(message_id)
    }

    async fn receive(&self, channel_ref: &str, max_messages: usize) -> Result<Vec<ReceivedMessage>> {
        let queue_url = Self::queue_url(channel_ref)?;
        let batch = max_messages.clamp(1, MAX_RECEIVE_BATCH) as i32;

        let output = self
            .sqs
            .receive_message()
            .queue_url(&queue_url)
            .max_number_of_messages(batch)
            .wait_time_seconds(self.config.wait_time_secs)
            .visibility_timeout(self.config.visibility_timeout_secs)
            .message_system_attribute_names(MessageSystemAttributeName::MessageGroupId)
            .message_system_attribute_names(MessageSystemAttributeName::ApproximateReceiveCount)
            .send()
            .await
            .map_err(|e| BusError::Receive(format!("Failed to receive from SQS: {}", e)))?;

        let mut received = Vec::new();
        for message in output.messages() {
            let (Some(body), Some(receipt)) = (message.body(), message.receipt_handle()) else {
                warn!(queue_url = %queue_url, "Skipping SQS message without body or receipt");
                continue;
            };

            let attributes = message.attributes();
            let ordering_key = attributes
                .and_then(|a| a.get(&MessageSystemAttributeName::MessageGroupId))
                .cloned();
            let receive_count = attributes
                .and_then(|a| a.get(&MessageSystemAttributeName::ApproximateReceiveCount))
                .and_then(|v| v.parse().ok())
                .unwrap_or(1);

            received.push(ReceivedMessage {
                channel_ref: channel_ref.to_string(),
                message_id: message.message_id().unwrap_or_default().to_string(),
                body: body.to_string(),
                receipt_handle: receipt.to_string(),
                ordering_key,
                receive_count,
            });
        }

        Ok(received)
    }

    async fn ack(&self, channel_ref: &str, receipt_handle: &str) -> Result<bool> {
        let queue_url = Self::queue_url(channel_ref)?;

        self.sqs
            .delete_message()
            .queue_url(&queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(|e| BusError::Ack(format!("Failed to delete SQS message: {}", e)))?;

        Ok(true)
    }
}
