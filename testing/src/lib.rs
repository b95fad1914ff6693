//! # Message Connector Testing
//!
//! Testing utilities and helpers for the BPMN message connector.
//!
//! This crate provides:
//! - Mock implementations of the connector's collaborators
//! - Builders for inbound message events
//! - A harness wiring a flow to recording channels
//! - Property-based testing strategies
//!
//! ## Example
//!
//! ```ignore
//! use message_connector_testing::ConnectorHarness;
//!
//! #[tokio::test]
//! async fn waiting_execution_receives_message() {
//!     let harness = ConnectorHarness::new();
//!
//!     harness.send(harness.events.waiting("order-paid", Some("42"), "exec-1")).await.unwrap();
//!     harness.send(harness.events.sent("order-paid", Some("42"))).await.unwrap();
//!
//!     assert_eq!(harness.output.len(), 1);
//!     assert!(harness.group("order-paid", Some("42")).await.is_none());
//! }
//! ```

use chrono::{DateTime, Utc};
use message_connector_core::environment::Clock;

pub mod fixtures;
pub mod harness;

/// Mock implementations of the connector's collaborators.
pub mod mocks {
    #![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
    #![allow(clippy::missing_panics_doc)]

    use super::{Clock, DateTime, Utc};
    use message_connector_core::{
        BoxFuture, ChannelError, EngineError, Message, MessageChannel, ProcessEngine, Variables,
    };
    use serde::de::DeserializeOwned;
    use std::collections::{HashSet, VecDeque};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use message_connector_testing::mocks::FixedClock;
    /// use message_connector_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// Panics if the hardcoded timestamp fails to parse, which cannot happen.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }

    /// Output channel that records what it accepted.
    ///
    /// Failures can be scripted: [`RecordingChannel::fail_next`] makes the
    /// next sends fail with a transient transport error,
    /// [`RecordingChannel::reject_next`] with a permanent rejection. Failed
    /// sends are counted in [`RecordingChannel::attempts`] but not recorded.
    #[derive(Debug, Default)]
    pub struct RecordingChannel {
        sent: Mutex<Vec<Message<Vec<u8>>>>,
        failures: Mutex<VecDeque<ChannelError>>,
        attempts: AtomicUsize,
    }

    impl RecordingChannel {
        /// Create a channel accepting every send.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Fail the next `count` sends with a transport error.
        pub fn fail_next(&self, count: usize) {
            let mut failures = self.failures.lock().unwrap();
            for _ in 0..count {
                failures.push_back(ChannelError::TransportError("broker unavailable".to_string()));
            }
        }

        /// Reject the next `count` sends.
        pub fn reject_next(&self, count: usize) {
            let mut failures = self.failures.lock().unwrap();
            for _ in 0..count {
                failures.push_back(ChannelError::Rejected("destination refused".to_string()));
            }
        }

        /// Messages accepted so far, oldest first.
        #[must_use]
        pub fn sent(&self) -> Vec<Message<Vec<u8>>> {
            self.sent.lock().unwrap().clone()
        }

        /// Accepted payloads decoded as `T`.
        #[must_use]
        pub fn payloads<T: DeserializeOwned>(&self) -> Vec<T> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .map(|message| serde_json::from_slice(message.payload()).unwrap())
                .collect()
        }

        /// Number of accepted messages.
        #[must_use]
        pub fn len(&self) -> usize {
            self.sent.lock().unwrap().len()
        }

        /// Check if nothing was accepted.
        #[must_use]
        pub fn is_empty(&self) -> bool {
            self.len() == 0
        }

        /// Number of send calls, failed ones included.
        #[must_use]
        pub fn attempts(&self) -> usize {
            self.attempts.load(Ordering::SeqCst)
        }

        /// Forget accepted messages and scripted failures.
        pub fn clear(&self) {
            self.sent.lock().unwrap().clear();
            self.failures.lock().unwrap().clear();
            self.attempts.store(0, Ordering::SeqCst);
        }
    }

    impl MessageChannel for RecordingChannel {
        fn send(&self, message: Message<Vec<u8>>) -> BoxFuture<'_, Result<(), ChannelError>> {
            Box::pin(async move {
                self.attempts.fetch_add(1, Ordering::SeqCst);
                if let Some(err) = self.failures.lock().unwrap().pop_front() {
                    return Err(err);
                }
                self.sent.lock().unwrap().push(message);
                Ok(())
            })
        }
    }

    /// A process instance started by [`MockProcessEngine::start_by_message`].
    #[derive(Debug, Clone, PartialEq)]
    pub struct StartedInstance {
        /// Generated instance id
        pub instance_id: String,
        /// Message that started the instance
        pub message_name: String,
        /// Business key, if any
        pub business_key: Option<String>,
        /// Start variables
        pub variables: Variables,
    }

    /// In-memory process engine.
    ///
    /// Executions registered with [`MockProcessEngine::wait`] are waiting
    /// until triggered once. Only messages registered with
    /// [`MockProcessEngine::subscribe_start`] can start instances.
    #[derive(Debug, Default)]
    pub struct MockProcessEngine {
        outages: AtomicUsize,
        waiting: Mutex<HashSet<String>>,
        start_subscriptions: Mutex<HashSet<String>>,
        triggered: Mutex<Vec<(String, Variables)>>,
        started: Mutex<Vec<StartedInstance>>,
    }

    impl MockProcessEngine {
        /// Create an engine with no executions and no start subscriptions.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Fail the next `count` trigger or start calls with [`EngineError::Other`].
        pub fn fail_next(&self, count: usize) {
            self.outages.fetch_add(count, Ordering::SeqCst);
        }

        fn outage(&self) -> Result<(), EngineError> {
            let failed = self
                .outages
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok();
            if failed {
                return Err(EngineError::Other("engine unavailable".to_string()));
            }
            Ok(())
        }

        /// Register a waiting execution.
        pub fn wait(&self, execution_id: &str) {
            self.waiting.lock().unwrap().insert(execution_id.to_string());
        }

        /// Register a start subscription for `message_name`.
        pub fn subscribe_start(&self, message_name: &str) {
            self.start_subscriptions
                .lock()
                .unwrap()
                .insert(message_name.to_string());
        }

        /// Executions triggered so far, with their variables.
        #[must_use]
        pub fn triggered(&self) -> Vec<(String, Variables)> {
            self.triggered.lock().unwrap().clone()
        }

        /// Instances started so far.
        #[must_use]
        pub fn started(&self) -> Vec<StartedInstance> {
            self.started.lock().unwrap().clone()
        }
    }

    impl ProcessEngine for MockProcessEngine {
        fn is_waiting<'a>(&'a self, execution_id: &'a str) -> BoxFuture<'a, Result<bool, EngineError>> {
            Box::pin(async move { Ok(self.waiting.lock().unwrap().contains(execution_id)) })
        }

        fn trigger<'a>(
            &'a self,
            execution_id: &'a str,
            variables: Variables,
        ) -> BoxFuture<'a, Result<(), EngineError>> {
            Box::pin(async move {
                self.outage()?;
                if !self.waiting.lock().unwrap().remove(execution_id) {
                    return Err(EngineError::ExecutionNotFound(execution_id.to_string()));
                }
                self.triggered
                    .lock()
                    .unwrap()
                    .push((execution_id.to_string(), variables));
                Ok(())
            })
        }

        fn start_by_message<'a>(
            &'a self,
            message_name: &'a str,
            business_key: Option<&'a str>,
            variables: Variables,
        ) -> BoxFuture<'a, Result<String, EngineError>> {
            Box::pin(async move {
                self.outage()?;
                if !self.start_subscriptions.lock().unwrap().contains(message_name) {
                    return Err(EngineError::NoStartSubscription(message_name.to_string()));
                }
                let mut started = self.started.lock().unwrap();
                let instance_id = format!("instance-{}", started.len() + 1);
                started.push(StartedInstance {
                    instance_id: instance_id.clone(),
                    message_name: message_name.to_string(),
                    business_key: business_key.map(str::to_string),
                    variables,
                });
                Ok(instance_id)
            })
        }
    }
}

/// Property-based testing strategies.
pub mod properties {
    use message_connector_core::MessageEventType;
    use proptest::prelude::*;

    /// Any event type the connector knows, plus an unknown one.
    pub fn event_type() -> impl Strategy<Value = MessageEventType> {
        prop_oneof![
            Just(MessageEventType::StartMessageDeployed),
            Just(MessageEventType::MessageWaiting),
            Just(MessageEventType::MessageSent),
            Just(MessageEventType::MessageReceived),
            Just(MessageEventType::MessageSubscriptionCancelled),
            Just(MessageEventType::Other("MESSAGE_EXPIRED".to_string())),
        ]
    }

    /// Event types that are held in a message group.
    pub fn aggregated_event_type() -> impl Strategy<Value = MessageEventType> {
        prop_oneof![
            Just(MessageEventType::StartMessageDeployed),
            Just(MessageEventType::MessageWaiting),
            Just(MessageEventType::MessageSent),
        ]
    }

    /// A BPMN message name.
    pub fn message_name() -> impl Strategy<Value = String> {
        "[a-z]{1,8}(-[a-z]{1,8})?"
    }

    /// An optional correlation key.
    pub fn correlation_key() -> impl Strategy<Value = Option<String>> {
        proptest::option::of("[A-Za-z0-9]{1,12}")
    }
}

// Re-export commonly used items
pub use fixtures::EventFactory;
pub use harness::ConnectorHarness;
pub use mocks::{FixedClock, MockProcessEngine, RecordingChannel, StartedInstance, test_clock};

/// Install a test subscriber printing `tracing` output of failing tests.
///
/// Safe to call from every test; only the first call installs it.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
