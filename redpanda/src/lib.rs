//! Redpanda transport for the BPMN message connector.
//!
//! This crate connects the connector flow to a Kafka-compatible broker using
//! rdkafka:
//!
//! - [`RedpandaMessageChannel`] implements [`MessageChannel`]: released
//!   commands (and, optionally, rejected messages) are published with their
//!   headers as Kafka headers
//! - [`RedpandaInbound`] consumes the message-event topic and yields
//!   [`Delivery`] values that must be settled before the offset is committed
//!
//! # Architecture
//!
//! ```text
//! message-events ──► RedpandaInbound ──► Delivery ──► MessageConnectorFlow
//!                        ▲                  │                │
//!                        └── ack / redeliver┘                ▼
//!                                                 RedpandaMessageChannel
//!                                                  (destination topic or
//!                                                   message-commands)
//! ```
//!
//! # Delivery Semantics
//!
//! **At-least-once** with manual offset commits:
//! - An offset is committed only after its delivery was acknowledged
//! - A delivery settled with [`Acknowledger::redeliver`] is handed out again,
//!   with the same message id, after a backoff
//! - Messages without an `id` header get one derived from topic, partition
//!   and offset, so a broker redelivery keeps its identity
//!
//! # Example
//!
//! ```no_run
//! use message_connector_redpanda::RedpandaMessageChannel;
//! use message_connector_core::{Message, MessageChannel};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let channel = RedpandaMessageChannel::builder()
//!     .brokers("localhost:9092")
//!     .default_topic("message-commands")
//!     .build()?;
//!
//! let command = Message::builder(br#"{"name":"order-paid"}"#.to_vec())
//!     .header("destination", "billing.payment-service")
//!     .header("correlationId", "order-paid:42")
//!     .build();
//! channel.send(command).await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod codec;
pub mod inbound;

pub use inbound::{Acknowledger, Delivery, DeliveryStream, RedpandaInbound, RedpandaInboundBuilder, Settlement};

use message_connector_core::{BoxFuture, ChannelError, HeaderNames, Message, MessageChannel};
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use std::time::Duration;

/// Publishes connector messages to Redpanda.
///
/// The topic is taken from the destination header when routing by
/// destination is on (the default), otherwise every message goes to the
/// default topic. The correlation id header is used as record key so that
/// all commands of one conversation land on the same partition.
///
/// # Example
///
/// ```no_run
/// use message_connector_redpanda::RedpandaMessageChannel;
/// use std::time::Duration;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let errors = RedpandaMessageChannel::builder()
///     .brokers("localhost:9092,localhost:9093")
///     .default_topic("message-errors")
///     .route_by_destination(false)
///     .producer_acks("all")
///     .timeout(Duration::from_secs(10))
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct RedpandaMessageChannel {
    producer: FutureProducer,
    default_topic: String,
    route_by_destination: bool,
    timeout: Duration,
    headers: HeaderNames,
}

impl RedpandaMessageChannel {
    /// Create a new builder for configuring the channel.
    #[must_use]
    pub fn builder() -> RedpandaMessageChannelBuilder {
        RedpandaMessageChannelBuilder::default()
    }

    /// Topic of messages without a usable destination.
    #[must_use]
    pub fn default_topic(&self) -> &str {
        &self.default_topic
    }

    /// Topic `message` is published to.
    #[must_use]
    pub fn topic_for(&self, message: &Message<Vec<u8>>) -> String {
        let destination = self
            .route_by_destination
            .then(|| message.headers().get_str(&self.headers.destination))
            .flatten()
            .filter(|destination| !destination.is_empty());
        destination.unwrap_or(&self.default_topic).to_string()
    }
}

/// Builder for configuring a [`RedpandaMessageChannel`].
#[derive(Default)]
pub struct RedpandaMessageChannelBuilder {
    brokers: Option<String>,
    default_topic: Option<String>,
    route_by_destination: Option<bool>,
    producer_acks: Option<String>,
    compression: Option<String>,
    timeout: Option<Duration>,
    headers: Option<HeaderNames>,
}

impl RedpandaMessageChannelBuilder {
    /// Set the broker addresses (comma-separated).
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Set the topic used when no destination applies.
    ///
    /// Default: `"message-commands"`
    #[must_use]
    pub fn default_topic(mut self, topic: impl Into<String>) -> Self {
        self.default_topic = Some(topic.into());
        self
    }

    /// Publish to the topic named by the destination header.
    ///
    /// Default: `true`
    #[must_use]
    pub const fn route_by_destination(mut self, enabled: bool) -> Self {
        self.route_by_destination = Some(enabled);
        self
    }

    /// Set the producer acknowledgment mode: "0", "1" or "all".
    ///
    /// Default: "all"
    #[must_use]
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = Some(acks.into());
        self
    }

    /// Set the compression codec: "none", "gzip", "snappy", "lz4", "zstd".
    ///
    /// Default: "none"
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// Set the producer send timeout.
    ///
    /// Default: 5 seconds
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the header names used for routing and keys.
    #[must_use]
    pub fn headers(mut self, headers: HeaderNames) -> Self {
        self.headers = Some(headers);
        self
    }

    /// Build the [`RedpandaMessageChannel`].
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::ConnectionFailed`] if brokers are not set or
    /// the producer cannot be created.
    pub fn build(self) -> Result<RedpandaMessageChannel, ChannelError> {
        let brokers = self
            .brokers
            .ok_or_else(|| ChannelError::ConnectionFailed("Brokers not configured".to_string()))?;
        let acks = self.producer_acks.as_deref().unwrap_or("all");
        let compression = self.compression.as_deref().unwrap_or("none");
        let timeout = self.timeout.unwrap_or(Duration::from_secs(5));

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", timeout.as_millis().to_string())
            .set("acks", acks)
            .set("compression.type", compression)
            .create()
            .map_err(|e| ChannelError::ConnectionFailed(format!("Failed to create producer: {e}")))?;

        let default_topic = self
            .default_topic
            .unwrap_or_else(|| "message-commands".to_string());

        tracing::info!(
            brokers = %brokers,
            default_topic = %default_topic,
            acks,
            compression,
            "RedpandaMessageChannel created"
        );

        Ok(RedpandaMessageChannel {
            producer,
            default_topic,
            route_by_destination: self.route_by_destination.unwrap_or(true),
            timeout,
            headers: self.headers.unwrap_or_default(),
        })
    }
}

impl MessageChannel for RedpandaMessageChannel {
    fn send(&self, message: Message<Vec<u8>>) -> BoxFuture<'_, Result<(), ChannelError>> {
        Box::pin(async move {
            let topic = self.topic_for(&message);
            let key = message
                .headers()
                .get_str(&self.headers.correlation_id)
                .unwrap_or_default()
                .to_string();

            let record = FutureRecord::to(&topic)
                .payload(message.payload())
                .key(&key)
                .headers(codec::to_kafka_headers(message.headers()));

            let result = self.producer.send(record, Timeout::After(self.timeout)).await;
            match result {
                Ok((partition, offset)) => {
                    tracing::debug!(
                        topic = %topic,
                        partition,
                        offset,
                        message_id = %message.id(),
                        "Message published"
                    );
                    Ok(())
                }
                Err((kafka_error, _)) => {
                    tracing::error!(topic = %topic, error = %kafka_error, "Failed to publish message");
                    Err(ChannelError::SendFailed {
                        destination: topic,
                        reason: kafka_error.to_string(),
                    })
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn redpanda_message_channel_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<RedpandaMessageChannel>();
        assert_sync::<RedpandaMessageChannel>();
    }

    #[test]
    fn build_without_brokers_fails() {
        assert!(matches!(
            RedpandaMessageChannel::builder().build(),
            Err(ChannelError::ConnectionFailed(_))
        ));
    }

    #[test]
    fn topic_follows_destination_header() {
        // Creating a producer does not contact the broker.
        let channel = RedpandaMessageChannel::builder()
            .brokers("localhost:9092")
            .build()
            .unwrap();
        let routed = Message::builder(Vec::new()).header("destination", "billing").build();
        let unrouted = Message::builder(Vec::new()).build();

        assert_eq!(channel.topic_for(&routed), "billing");
        assert_eq!(channel.topic_for(&unrouted), "message-commands");
    }

    #[test]
    fn fixed_topic_ignores_destination() {
        let channel = RedpandaMessageChannel::builder()
            .brokers("localhost:9092")
            .default_topic("message-errors")
            .route_by_destination(false)
            .build()
            .unwrap();
        let routed = Message::builder(Vec::new()).header("destination", "billing").build();

        assert_eq!(channel.topic_for(&routed), "message-errors");
    }
}
