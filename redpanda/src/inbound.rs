//! Consumer side: the message-event topic as a stream of deliveries.
//!
//! Each consumer task owns one rdkafka consumer and hands out one
//! [`Delivery`] at a time. The next record is only read once the current
//! delivery is settled, which keeps records of a partition in order and makes
//! committing after acknowledgement safe. Run several inbounds in the same
//! consumer group to process partitions in parallel.
//!
//! ```text
//! record ──► Delivery ──► ack ──────────► commit offset, next record
//!               │
//!               └──────► redeliver ─────► backoff, same message again
//!                                         (exhausted: error channel, commit)
//! ```

use crate::codec;
use futures::Stream;
use message_connector_core::{ChannelError, HeaderNames, Message, MessageChannel};
use message_connector_runtime::retry::RetryPolicy;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message as KafkaMessage;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// Processed; the offset may be committed
    Ack,
    /// Not processed; hand the message out again
    Redeliver,
}

/// Settles one [`Delivery`].
///
/// Dropping it without settling counts as [`Settlement::Redeliver`].
#[derive(Debug)]
pub struct Acknowledger {
    settle: oneshot::Sender<Settlement>,
}

impl Acknowledger {
    /// Acknowledge the delivery.
    pub fn ack(self) {
        self.settle_with(Settlement::Ack);
    }

    /// Ask for the message to be delivered again.
    pub fn redeliver(self) {
        self.settle_with(Settlement::Redeliver);
    }

    fn settle_with(self, settlement: Settlement) {
        if self.settle.send(settlement).is_err() {
            tracing::debug!(?settlement, "Consumer task gone before settlement");
        }
    }
}

/// A message handed out by the inbound, awaiting settlement.
#[derive(Debug)]
pub struct Delivery {
    message: Message<Vec<u8>>,
    acknowledger: Acknowledger,
}

impl Delivery {
    /// Create a delivery and the receiver its settlement arrives on.
    #[must_use]
    pub fn new(message: Message<Vec<u8>>) -> (Self, oneshot::Receiver<Settlement>) {
        let (settle, settled) = oneshot::channel();
        (
            Self {
                message,
                acknowledger: Acknowledger { settle },
            },
            settled,
        )
    }

    /// The delivered message.
    #[must_use]
    pub const fn message(&self) -> &Message<Vec<u8>> {
        &self.message
    }

    /// Split into the message and its acknowledger.
    #[must_use]
    pub fn into_parts(self) -> (Message<Vec<u8>>, Acknowledger) {
        (self.message, self.acknowledger)
    }
}

/// Stream of deliveries; transport failures are reported inline.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery, ChannelError>> + Send>>;

/// Consumes the message-event topic with manual commits.
///
/// # Example
///
/// ```no_run
/// use message_connector_redpanda::RedpandaInbound;
/// use futures::StreamExt;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let inbound = RedpandaInbound::builder()
///     .brokers("localhost:9092")
///     .topic("message-events")
///     .consumer_group("message-connector")
///     .build()?;
///
/// let mut deliveries = inbound.subscribe()?;
/// while let Some(delivery) = deliveries.next().await {
///     let (message, ack) = delivery?.into_parts();
///     println!("received {}", message.id());
///     ack.ack();
/// }
/// # Ok(())
/// # }
/// ```
pub struct RedpandaInbound {
    brokers: String,
    topic: String,
    consumer_group: String,
    auto_offset_reset: String,
    redelivery: RetryPolicy,
    error_channel: Option<Arc<dyn MessageChannel>>,
    headers: HeaderNames,
}

impl RedpandaInbound {
    /// Create a new builder for configuring the inbound.
    #[must_use]
    pub fn builder() -> RedpandaInboundBuilder {
        RedpandaInboundBuilder::default()
    }

    /// Topic consumed by this inbound.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Default redelivery policy: 10 attempts, 1s doubling up to 30s.
    #[must_use]
    pub fn default_redelivery() -> RetryPolicy {
        RetryPolicy::builder()
            .max_retries(10)
            .initial_delay(Duration::from_secs(1))
            .max_delay(Duration::from_secs(30))
            .build()
    }

    /// Subscribe and start the consumer task.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::SubscriptionFailed`] if the consumer cannot be
    /// created or subscribed.
    pub fn subscribe(self) -> Result<DeliveryStream, ChannelError> {
        let subscription_failed = |reason: String| ChannelError::SubscriptionFailed {
            sources: vec![self.topic.clone()],
            reason,
        };

        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.brokers)
            .set("group.id", &self.consumer_group)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", &self.auto_offset_reset)
            .set("session.timeout.ms", "6000")
            .set("enable.partition.eof", "false")
            .create()
            .map_err(|e| subscription_failed(format!("Failed to create consumer: {e}")))?;

        consumer
            .subscribe(&[self.topic.as_str()])
            .map_err(|e| subscription_failed(format!("Failed to subscribe: {e}")))?;

        tracing::info!(
            topic = %self.topic,
            consumer_group = %self.consumer_group,
            auto_offset_reset = %self.auto_offset_reset,
            manual_commit = true,
            "Subscribed to message events"
        );

        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(self.consume(consumer, tx));

        let stream = async_stream::stream! {
            let mut rx = rx;
            while let Some(result) = rx.recv().await {
                yield result;
            }
        };
        Ok(Box::pin(stream))
    }

    async fn consume(self, consumer: StreamConsumer, tx: mpsc::Sender<Result<Delivery, ChannelError>>) {
        use futures::StreamExt;

        let mut records = consumer.stream();
        while let Some(next) = records.next().await {
            let record = match next {
                Ok(record) => record,
                Err(e) => {
                    let err = ChannelError::TransportError(format!("Failed to receive message: {e}"));
                    if tx.send(Err(err)).await.is_err() {
                        break;
                    }
                    continue;
                }
            };

            let headers = record.headers().map(codec::header_map).unwrap_or_default();
            let message = codec::inbound_message(
                record.topic(),
                record.partition(),
                record.offset(),
                &headers,
                record.payload(),
            );

            let Some(settlement) = self.settle(&tx, message).await else {
                tracing::debug!("Delivery stream dropped, exiting consumer task");
                break;
            };
            tracing::trace!(
                topic = record.topic(),
                partition = record.partition(),
                offset = record.offset(),
                ?settlement,
                "Record settled"
            );

            if let Err(e) = consumer.commit_message(&record, CommitMode::Async) {
                tracing::warn!(
                    topic = record.topic(),
                    partition = record.partition(),
                    offset = record.offset(),
                    error = %e,
                    "Failed to commit offset (message may be redelivered)"
                );
            }
        }

        tracing::debug!(topic = %self.topic, "Consumer task exiting");
    }

    /// Hand `message` out until it is acknowledged or redeliveries run out.
    ///
    /// Returns `None` once nobody listens to the stream anymore; the record
    /// must then stay uncommitted.
    async fn settle(
        &self,
        tx: &mpsc::Sender<Result<Delivery, ChannelError>>,
        message: Message<Vec<u8>>,
    ) -> Option<Settlement> {
        let mut attempt = 0;
        loop {
            let (delivery, settled) = Delivery::new(message.clone());
            tx.send(Ok(delivery)).await.ok()?;

            if settled.await.unwrap_or(Settlement::Redeliver) == Settlement::Ack {
                return Some(Settlement::Ack);
            }
            if attempt >= self.redelivery.max_retries {
                self.park(message).await;
                return Some(Settlement::Redeliver);
            }

            let delay = self.redelivery.delay_for_attempt(attempt);
            tracing::warn!(
                message_id = %message.id(),
                attempt = attempt + 1,
                delay_ms = delay.as_millis(),
                "Delivery not acknowledged, redelivering"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    async fn park(&self, message: Message<Vec<u8>>) {
        let message_id = message.id();
        let Some(errors) = &self.error_channel else {
            tracing::error!(message_id = %message_id, "Redeliveries exhausted, skipping message");
            return;
        };

        let message = message.with_header(&self.headers.error, "redeliveries exhausted");
        match errors.send(message).await {
            Ok(()) => tracing::error!(message_id = %message_id, "Redeliveries exhausted, message parked"),
            Err(e) => tracing::error!(
                message_id = %message_id,
                error = %e,
                "Redeliveries exhausted and error channel failed, skipping message"
            ),
        }
    }
}

/// Builder for configuring a [`RedpandaInbound`].
#[derive(Default)]
pub struct RedpandaInboundBuilder {
    brokers: Option<String>,
    topic: Option<String>,
    consumer_group: Option<String>,
    auto_offset_reset: Option<String>,
    redelivery: Option<RetryPolicy>,
    error_channel: Option<Arc<dyn MessageChannel>>,
    headers: Option<HeaderNames>,
}

impl RedpandaInboundBuilder {
    /// Set the broker addresses (comma-separated).
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Set the topic to consume.
    ///
    /// Default: `"message-events"`
    #[must_use]
    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    /// Set the consumer group ID.
    ///
    /// Default: `"message-connector"`
    #[must_use]
    pub fn consumer_group(mut self, consumer_group: impl Into<String>) -> Self {
        self.consumer_group = Some(consumer_group.into());
        self
    }

    /// Set where new consumer groups start reading: "earliest" or "latest".
    ///
    /// Default: "earliest", so no event published before the first start is missed
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Set the backoff between redeliveries and how many are attempted.
    #[must_use]
    pub fn redelivery(mut self, policy: RetryPolicy) -> Self {
        self.redelivery = Some(policy);
        self
    }

    /// Park messages whose redeliveries are exhausted on `channel`.
    #[must_use]
    pub fn error_channel(mut self, channel: Arc<dyn MessageChannel>) -> Self {
        self.error_channel = Some(channel);
        self
    }

    /// Set the header names (the error header is written when parking).
    #[must_use]
    pub fn headers(mut self, headers: HeaderNames) -> Self {
        self.headers = Some(headers);
        self
    }

    /// Build the [`RedpandaInbound`].
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::ConnectionFailed`] if brokers are not set.
    pub fn build(self) -> Result<RedpandaInbound, ChannelError> {
        let brokers = self
            .brokers
            .ok_or_else(|| ChannelError::ConnectionFailed("Brokers not configured".to_string()))?;

        Ok(RedpandaInbound {
            brokers,
            topic: self.topic.unwrap_or_else(|| "message-events".to_string()),
            consumer_group: self
                .consumer_group
                .unwrap_or_else(|| "message-connector".to_string()),
            auto_offset_reset: self
                .auto_offset_reset
                .unwrap_or_else(|| "earliest".to_string()),
            redelivery: self.redelivery.unwrap_or_else(RedpandaInbound::default_redelivery),
            error_channel: self.error_channel,
            headers: self.headers.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[tokio::test]
    async fn acknowledger_reports_settlement() {
        let (delivery, settled) = Delivery::new(Message::builder(Vec::new()).build());
        let (_, ack) = delivery.into_parts();
        ack.ack();
        assert_eq!(settled.await.unwrap(), Settlement::Ack);
    }

    #[tokio::test]
    async fn dropped_delivery_is_not_an_ack() {
        let (delivery, settled) = Delivery::new(Message::builder(Vec::new()).build());
        drop(delivery);
        assert!(settled.await.is_err());
    }

    #[test]
    fn builder_requires_brokers() {
        assert!(RedpandaInbound::builder().build().is_err());
        let inbound = RedpandaInbound::builder().brokers("localhost:9092").build().unwrap();
        assert_eq!(inbound.topic(), "message-events");
    }
}
