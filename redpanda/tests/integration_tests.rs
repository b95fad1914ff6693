//! Integration tests for the Redpanda transport against a real broker.
//!
//! The broker tests use testcontainers to start Kafka and validate:
//! - Header and id round-trip between channel and inbound
//! - Redelivery of unacknowledged deliveries with the same message id
//! - Parking of messages whose redeliveries are exhausted
//! - A waiting/sent conversation released end to end
//!
//! # Running These Tests
//!
//! Broker tests are marked as `#[ignore]` by default because they require
//! Docker and take 15-60 seconds each to start Kafka.
//!
//! ```bash
//! cargo test -p message-connector-redpanda --test integration_tests -- --ignored
//! ```

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use futures::StreamExt;
use message_connector_core::payload::ReceiveMessagePayload;
use message_connector_core::{Message, MessageChannel};
use message_connector_redpanda::{Delivery, DeliveryStream, RedpandaInbound, RedpandaMessageChannel, Settlement};
use message_connector_runtime::flow::MessageConnectorFlow;
use message_connector_runtime::retry::RetryPolicy;
use message_connector_testing::{EventFactory, RecordingChannel};
use std::sync::Arc;
use std::time::Duration;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::kafka::{KAFKA_PORT, Kafka};

async fn start_kafka() -> (ContainerAsync<Kafka>, String) {
    let kafka = Kafka::default()
        .with_env_var("KAFKA_AUTO_CREATE_TOPICS_ENABLE", "true")
        .start()
        .await
        .expect("Failed to start Kafka container");

    let host = kafka.get_host().await.expect("Failed to get host");
    let port = kafka
        .get_host_port_ipv4(KAFKA_PORT)
        .await
        .expect("Failed to get port");
    let brokers = format!("{host}:{port}");
    ensure_topic_exists(&brokers, "warmup").await;
    (kafka, brokers)
}

/// Publish a warmup record until the broker accepts it, creating the topic.
async fn ensure_topic_exists(brokers: &str, topic: &str) {
    let channel = RedpandaMessageChannel::builder()
        .brokers(brokers)
        .default_topic(topic)
        .route_by_destination(false)
        .build()
        .expect("Failed to create channel");

    for attempt in 1..=60 {
        let warmup = Message::builder(b"warmup".to_vec()).header("warmup", "true").build();
        if channel.send(warmup).await.is_ok() {
            tokio::time::sleep(Duration::from_secs(2)).await;
            return;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(attempt != 60, "Failed to create topic {topic}");
    }
}

fn publisher(brokers: &str, topic: &str) -> RedpandaMessageChannel {
    RedpandaMessageChannel::builder()
        .brokers(brokers)
        .default_topic(topic)
        .route_by_destination(false)
        .build()
        .expect("Failed to create channel")
}

/// Next delivery that is not a warmup record.
async fn next_delivery(deliveries: &mut DeliveryStream) -> Delivery {
    tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            let delivery = deliveries
                .next()
                .await
                .expect("Delivery stream ended")
                .expect("Transport error");
            if delivery.message().headers().contains("warmup") {
                delivery.into_parts().1.ack();
                continue;
            }
            return delivery;
        }
    })
    .await
    .expect("Timeout waiting for delivery")
}

fn fast_redelivery(max_retries: usize) -> RetryPolicy {
    RetryPolicy::builder()
        .max_retries(max_retries)
        .initial_delay(Duration::from_millis(10))
        .max_delay(Duration::from_millis(50))
        .build()
}

#[tokio::test]
async fn acknowledger_settles_its_delivery() {
    let (delivery, settled) = Delivery::new(Message::builder(b"{}".to_vec()).build());
    let (message, ack) = delivery.into_parts();
    assert_eq!(message.payload(), b"{}");

    ack.redeliver();

    assert_eq!(settled.await.unwrap(), Settlement::Redeliver);
}

#[test]
fn inbound_requires_brokers() {
    assert!(RedpandaInbound::builder().topic("message-events").build().is_err());
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn headers_and_id_survive_the_broker() {
    let (_kafka, brokers) = start_kafka().await;
    ensure_topic_exists(&brokers, "round-trip").await;

    let mut deliveries = RedpandaInbound::builder()
        .brokers(&brokers)
        .topic("round-trip")
        .consumer_group("round-trip-test")
        .build()
        .unwrap()
        .subscribe()
        .unwrap();

    let events = EventFactory::default();
    let sent = events.sent("order-paid", Some("42"));
    publisher(&brokers, "round-trip").send(sent.clone()).await.unwrap();

    let (received, ack) = next_delivery(&mut deliveries).await.into_parts();
    ack.ack();

    assert_eq!(received.id(), sent.id());
    assert_eq!(received.payload(), sent.payload());
    assert_eq!(received.headers().get_str("eventType"), Some("MESSAGE_SENT"));
    assert_eq!(
        received.headers().get_str("serviceFullName"),
        sent.headers().get_str("serviceFullName")
    );
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn unacknowledged_delivery_is_handed_out_again() {
    let (_kafka, brokers) = start_kafka().await;
    ensure_topic_exists(&brokers, "redelivery").await;

    let mut deliveries = RedpandaInbound::builder()
        .brokers(&brokers)
        .topic("redelivery")
        .consumer_group("redelivery-test")
        .redelivery(fast_redelivery(3))
        .build()
        .unwrap()
        .subscribe()
        .unwrap();

    let message = Message::builder(b"payload".to_vec()).build();
    publisher(&brokers, "redelivery").send(message.clone()).await.unwrap();

    let (first, ack) = next_delivery(&mut deliveries).await.into_parts();
    ack.redeliver();
    let (second, ack) = next_delivery(&mut deliveries).await.into_parts();
    ack.ack();

    assert_eq!(first.id(), message.id());
    assert_eq!(second.id(), message.id());
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn exhausted_redeliveries_park_the_message() {
    let (_kafka, brokers) = start_kafka().await;
    ensure_topic_exists(&brokers, "parking").await;

    let errors = Arc::new(RecordingChannel::new());
    let error_channel: Arc<dyn MessageChannel> = errors.clone();
    let mut deliveries = RedpandaInbound::builder()
        .brokers(&brokers)
        .topic("parking")
        .consumer_group("parking-test")
        .redelivery(fast_redelivery(1))
        .error_channel(error_channel)
        .build()
        .unwrap()
        .subscribe()
        .unwrap();

    let poison = Message::builder(b"poison".to_vec()).build();
    let follower = Message::builder(b"follower".to_vec()).build();
    let producer = publisher(&brokers, "parking");
    producer.send(poison.clone()).await.unwrap();
    producer.send(follower.clone()).await.unwrap();

    next_delivery(&mut deliveries).await.into_parts().1.redeliver();
    next_delivery(&mut deliveries).await.into_parts().1.redeliver();
    let (next, ack) = next_delivery(&mut deliveries).await.into_parts();
    ack.ack();

    assert_eq!(next.id(), follower.id());
    let parked = errors.sent();
    assert_eq!(parked.len(), 1);
    assert_eq!(parked[0].id(), poison.id());
    assert!(parked[0].headers().contains("errorMessage"));
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn conversation_is_released_through_the_broker() {
    let (_kafka, brokers) = start_kafka().await;
    ensure_topic_exists(&brokers, "message-events").await;

    let output = Arc::new(RecordingChannel::new());
    let output_channel: Arc<dyn MessageChannel> = output.clone();
    let flow = MessageConnectorFlow::builder(output_channel).build();

    let mut deliveries = RedpandaInbound::builder()
        .brokers(&brokers)
        .consumer_group("conversation-test")
        .build()
        .unwrap()
        .subscribe()
        .unwrap();

    let events = EventFactory::default();
    let producer = publisher(&brokers, "message-events");
    producer.send(events.waiting("order-paid", Some("42"), "exec-1")).await.unwrap();
    producer.send(events.sent("order-paid", Some("42"))).await.unwrap();

    for _ in 0..2 {
        let (message, ack) = next_delivery(&mut deliveries).await.into_parts();
        flow.send(message).await.unwrap();
        ack.ack();
    }

    let commands: Vec<ReceiveMessagePayload> = output.payloads();
    assert_eq!(commands.len(), 1);
    assert_eq!(commands[0].execution_id.as_deref(), Some("exec-1"));
}
