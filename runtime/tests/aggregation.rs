//! Integration tests for the message connector flow and aggregator
//!
//! Drives raw message events through a fully assembled flow and checks the
//! commands released to the output channel and the groups left in the store.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use message_connector_core::payload::{ReceiveMessagePayload, StartMessagePayload};
use message_connector_core::{HandlerError, LockError, Message, MessageEventType, MessageGroupStore};
use message_connector_runtime::flow::{FlowError, FlowOutcome};
use message_connector_testing::fixtures::{correlation_key, payload};
use message_connector_testing::{ConnectorHarness, init_tracing};
use std::time::Duration;
use tokio_test::assert_ok;

// ============================================================================
// Filter, enrichment and decoding
// ============================================================================

#[tokio::test]
async fn message_without_event_type_is_discarded() {
    let harness = ConnectorHarness::new();
    let untyped = Message::builder(br#"{"name":"order-paid"}"#.to_vec())
        .header("messageEventName", "order-paid")
        .build();

    let outcome = assert_ok!(harness.send(untyped).await);

    assert_eq!(outcome, FlowOutcome::Discarded);
    assert_eq!(harness.errors.len(), 1);
    assert!(harness.group("order-paid", None).await.is_none());
    assert_eq!(harness.store.message_group_count().await.unwrap(), 0);
}

#[tokio::test]
async fn message_without_name_goes_to_error_channel() {
    let harness = ConnectorHarness::new();
    let nameless = Message::builder(br#"{"name":"order-paid"}"#.to_vec())
        .header("eventType", "MESSAGE_SENT")
        .build();

    let result = harness.send(nameless).await;

    assert!(matches!(result, Err(FlowError::Correlation(_))));
    let parked = harness.errors.peek().expect("parked message");
    assert!(parked.reason.contains("messageEventName"));
    assert!(harness.output.is_empty());
}

#[tokio::test]
async fn malformed_payload_goes_to_error_channel() {
    let harness = ConnectorHarness::new();
    let broken = Message::builder(b"{not json".to_vec())
        .header("eventType", "MESSAGE_SENT")
        .header("messageEventName", "order-paid")
        .build();
    let id = broken.id();

    let result = harness.send(broken).await;

    assert!(matches!(result, Err(FlowError::Decode { message_id, .. }) if message_id == id));
    let parked = harness.errors.peek().expect("parked message");
    assert_eq!(parked.message.id(), id);
    assert_eq!(parked.message.headers().get_str("correlationId"), Some("order-paid"));
}

#[tokio::test]
async fn non_aggregated_event_types_leave_store_untouched() {
    let harness = ConnectorHarness::new();
    let received = harness
        .events
        .event(&MessageEventType::MessageReceived, &payload("order-paid", Some("1")));
    let other = harness.events.event(
        &MessageEventType::Other("MESSAGE_EXPIRED".to_string()),
        &payload("order-paid", Some("1")),
    );

    assert_eq!(harness.send(received).await.unwrap(), FlowOutcome::Handled);
    assert_eq!(harness.send(other).await.unwrap(), FlowOutcome::Handled);

    assert!(harness.group("order-paid", Some("1")).await.is_none());
    assert!(harness.errors.is_empty());
}

// ============================================================================
// Release: receive
// ============================================================================

#[tokio::test]
async fn waiting_then_sent_releases_receive_command() {
    init_tracing();
    let harness = ConnectorHarness::new();

    harness
        .send(harness.events.waiting("order-paid", Some("42"), "exec-1"))
        .await
        .unwrap();
    assert!(harness.output.is_empty());
    assert_eq!(harness.group_event_types("order-paid", Some("42")).await, vec!["MESSAGE_WAITING"]);

    let sent = harness.events.event(
        &MessageEventType::MessageSent,
        &payload("order-paid", Some("42")).with_variable("amount", 120),
    );
    harness.send(sent).await.unwrap();

    let commands: Vec<ReceiveMessagePayload> = harness.output.payloads();
    assert_eq!(commands.len(), 1);
    assert_eq!(commands[0].execution_id.as_deref(), Some("exec-1"));
    assert_eq!(commands[0].correlation_key.as_deref(), Some("42"));
    assert_eq!(commands[0].variables.get("amount"), Some(&serde_json::json!(120)));

    let released = &harness.output.sent()[0];
    assert_eq!(released.headers().get_str("messagePayloadType"), Some("ReceiveMessagePayload"));
    assert_eq!(released.headers().get_str("correlationId"), Some("order-paid:42"));
    assert_eq!(
        released.headers().get_str("destination"),
        Some(message_connector_testing::EventFactory::DEFAULT_SERVICE)
    );

    assert!(harness.group("order-paid", Some("42")).await.is_none());
}

#[tokio::test]
async fn sent_then_waiting_releases_receive_command() {
    let harness = ConnectorHarness::new();

    harness.send(harness.events.sent("order-paid", Some("42"))).await.unwrap();
    assert_eq!(harness.group_event_types("order-paid", Some("42")).await, vec!["MESSAGE_SENT"]);

    harness
        .send(harness.events.waiting("order-paid", Some("42"), "exec-1"))
        .await
        .unwrap();

    assert_eq!(harness.output.len(), 1);
    assert!(harness.group("order-paid", Some("42")).await.is_none());
}

#[tokio::test]
async fn each_waiting_execution_consumes_one_sent_message() {
    let harness = ConnectorHarness::new();

    harness
        .send(harness.events.waiting("order-paid", Some("7"), "exec-1"))
        .await
        .unwrap();
    harness.send(harness.events.sent("order-paid", Some("7"))).await.unwrap();
    harness.send(harness.events.sent("order-paid", Some("7"))).await.unwrap();

    assert_eq!(harness.output.len(), 1);
    assert_eq!(harness.group_event_types("order-paid", Some("7")).await, vec!["MESSAGE_SENT"]);

    harness
        .send(harness.events.waiting("order-paid", Some("7"), "exec-2"))
        .await
        .unwrap();

    let commands: Vec<ReceiveMessagePayload> = harness.output.payloads();
    let executions: Vec<_> = commands.iter().filter_map(|c| c.execution_id.as_deref()).collect();
    assert_eq!(executions, vec!["exec-1", "exec-2"]);
    assert!(harness.group("order-paid", Some("7")).await.is_none());
}

#[tokio::test]
async fn different_correlation_keys_do_not_meet() {
    let harness = ConnectorHarness::new();

    harness
        .send(harness.events.waiting("order-paid", Some("1"), "exec-1"))
        .await
        .unwrap();
    harness.send(harness.events.sent("order-paid", Some("2"))).await.unwrap();

    assert!(harness.output.is_empty());
    assert!(harness.group("order-paid", Some("1")).await.is_some());
    assert!(harness.group("order-paid", Some("2")).await.is_some());
}

// ============================================================================
// Release: start
// ============================================================================

#[tokio::test]
async fn start_registration_releases_start_command_and_stays() {
    let harness = ConnectorHarness::new();

    harness
        .send(harness.events.start_deployed("order-placed", None))
        .await
        .unwrap();
    let sent = harness.events.event(
        &MessageEventType::MessageSent,
        &payload("order-placed", None).with_business_key("bk-9"),
    );
    harness.send(sent).await.unwrap();

    let commands: Vec<StartMessagePayload> = harness.output.payloads();
    assert_eq!(commands.len(), 1);
    assert_eq!(commands[0].name, "order-placed");
    assert_eq!(commands[0].business_key.as_deref(), Some("bk-9"));
    assert_eq!(
        harness.output.sent()[0].headers().get_str("messagePayloadType"),
        Some("StartMessagePayload")
    );
    assert_eq!(
        harness.group_event_types("order-placed", None).await,
        vec!["START_MESSAGE_DEPLOYED"]
    );

    // The registration keeps starting instances.
    harness.send(harness.events.sent("order-placed", None)).await.unwrap();
    assert_eq!(harness.output.len(), 2);
}

#[tokio::test]
async fn pending_sent_messages_are_all_released_by_a_start_registration() {
    let harness = ConnectorHarness::new();

    harness.send(harness.events.sent("order-placed", None)).await.unwrap();
    harness.send(harness.events.sent("order-placed", None)).await.unwrap();
    harness
        .send(harness.events.start_deployed("order-placed", None))
        .await
        .unwrap();

    assert_eq!(harness.output.len(), 2);
    assert_eq!(
        harness.group_event_types("order-placed", None).await,
        vec!["START_MESSAGE_DEPLOYED"]
    );
}

#[tokio::test]
async fn waiting_execution_takes_precedence_over_start_registration() {
    let harness = ConnectorHarness::new();

    harness
        .send(harness.events.start_deployed("order-paid", Some("1")))
        .await
        .unwrap();
    harness
        .send(harness.events.waiting("order-paid", Some("1"), "exec-1"))
        .await
        .unwrap();
    harness.send(harness.events.sent("order-paid", Some("1"))).await.unwrap();

    let commands: Vec<ReceiveMessagePayload> = harness.output.payloads();
    assert_eq!(commands.len(), 1);
    assert_eq!(commands[0].execution_id.as_deref(), Some("exec-1"));
    assert_eq!(
        harness.group_event_types("order-paid", Some("1")).await,
        vec!["START_MESSAGE_DEPLOYED"]
    );
}

// ============================================================================
// Redelivery and dispatch failures
// ============================================================================

#[tokio::test]
async fn duplicate_delivery_dispatches_once() {
    let harness = ConnectorHarness::new();
    let waiting = harness.events.waiting("order-paid", Some("42"), "exec-1");
    let sent = harness.events.sent("order-paid", Some("42"));

    harness.send(waiting.clone()).await.unwrap();
    harness.send(sent.clone()).await.unwrap();
    harness.send(sent).await.unwrap();
    harness.send(waiting).await.unwrap();

    assert_eq!(harness.output.len(), 1);
    assert!(harness.group("order-paid", Some("42")).await.is_none());
}

#[tokio::test]
async fn redelivered_message_is_not_appended_twice_without_idempotent_receiver() {
    let harness = ConnectorHarness::with(|builder| builder.idempotent(false));
    let sent = harness.events.sent("order-paid", Some("42"));

    harness.send(sent.clone()).await.unwrap();
    harness.send(sent).await.unwrap();

    assert_eq!(harness.group("order-paid", Some("42")).await.unwrap().len(), 1);
}

#[tokio::test]
async fn rejected_dispatch_leaves_group_intact_until_redelivery() {
    let harness = ConnectorHarness::new();
    harness
        .send(harness.events.waiting("order-paid", Some("42"), "exec-1"))
        .await
        .unwrap();
    let sent = harness.events.sent("order-paid", Some("42"));

    harness.output.reject_next(1);
    let result = harness.send(sent.clone()).await;

    assert!(matches!(
        result,
        Err(FlowError::Handler(HandlerError::Dispatch(_)))
    ));
    assert!(harness.output.is_empty());
    assert_eq!(harness.output.attempts(), 1);
    assert_eq!(
        harness.group_event_types("order-paid", Some("42")).await,
        vec!["MESSAGE_WAITING", "MESSAGE_SENT"]
    );

    // The broker redelivers the unacknowledged message.
    harness.send(sent).await.unwrap();

    assert_eq!(harness.output.len(), 1);
    assert!(harness.group("order-paid", Some("42")).await.is_none());
}

#[tokio::test]
async fn transient_dispatch_failures_are_retried() {
    let harness = ConnectorHarness::new();
    harness
        .send(harness.events.waiting("order-paid", Some("42"), "exec-1"))
        .await
        .unwrap();

    harness.output.fail_next(2);
    harness.send(harness.events.sent("order-paid", Some("42"))).await.unwrap();

    assert_eq!(harness.output.attempts(), 3);
    assert_eq!(harness.output.len(), 1);
    assert!(harness.group("order-paid", Some("42")).await.is_none());
}

#[tokio::test]
async fn exhausted_retries_surface_dispatch_error() {
    let harness = ConnectorHarness::new();
    harness
        .send(harness.events.waiting("order-paid", Some("42"), "exec-1"))
        .await
        .unwrap();

    harness.output.fail_next(3);
    let result = harness.send(harness.events.sent("order-paid", Some("42"))).await;

    assert!(matches!(result, Err(FlowError::Handler(HandlerError::Dispatch(_)))));
    assert_eq!(harness.output.attempts(), 3);
    assert_eq!(harness.group("order-paid", Some("42")).await.unwrap().len(), 2);
}

#[tokio::test]
async fn released_output_id_depends_only_on_consumed_messages() {
    let events = message_connector_testing::EventFactory::default();
    let waiting = events.waiting("order-paid", Some("42"), "exec-1");
    let sent = events.sent("order-paid", Some("42"));

    let first = ConnectorHarness::new();
    let second = ConnectorHarness::new();
    for harness in [&first, &second] {
        harness.send(waiting.clone()).await.unwrap();
        harness.send(sent.clone()).await.unwrap();
    }

    let first_id = first.output.sent()[0].id();
    assert_eq!(first_id, second.output.sent()[0].id());
    assert_ne!(first_id, waiting.id());
    assert_ne!(first_id, sent.id());
}

// ============================================================================
// Lock timeout
// ============================================================================

#[tokio::test]
async fn busy_lock_with_zero_timeout_reports_unavailable() {
    let harness = ConnectorHarness::with(|builder| builder.lock_timeout(Some(Duration::ZERO)));
    let sent = harness.events.sent("order-paid", Some("42"));
    let lock_key = correlation_key("order-paid", Some("42")).lock_key();

    let result = harness
        .locks
        .lock_interruptibly(&lock_key, || async {
            Ok::<_, LockError>(harness.send(sent.clone()).await)
        })
        .await
        .unwrap();

    assert!(matches!(
        result,
        Err(FlowError::Handler(HandlerError::Lock(LockError::Unavailable { .. })))
    ));
    assert!(harness.group("order-paid", Some("42")).await.is_none());

    // Once the lock is free the redelivery goes through.
    harness.send(sent).await.unwrap();
    assert_eq!(harness.group("order-paid", Some("42")).await.unwrap().len(), 1);
}

#[tokio::test]
async fn busy_lock_with_zero_timeout_bounds_cancellation_too() {
    let harness = ConnectorHarness::with(|builder| builder.lock_timeout(Some(Duration::ZERO)));
    harness.send(harness.events.start_deployed("order-placed", None)).await.unwrap();
    let cancelled = harness.events.cancelled("order-placed", None);
    let lock_key = correlation_key("order-placed", None).lock_key();

    let result = tokio::time::timeout(
        Duration::from_millis(500),
        harness.locks.lock_interruptibly(&lock_key, || async {
            Ok::<_, LockError>(harness.send(cancelled.clone()).await)
        }),
    )
    .await
    .expect("cancellation must not wait for the busy lock")
    .unwrap();

    assert!(matches!(
        result,
        Err(FlowError::Handler(HandlerError::Lock(LockError::Unavailable { .. })))
    ));
    assert_eq!(harness.group("order-placed", None).await.unwrap().len(), 1);

    harness.send(cancelled).await.unwrap();
    assert!(harness.group("order-placed", None).await.is_none());
}
