//! A flow wired to in-memory collaborators that tests can inspect.

use crate::fixtures::{EventFactory, correlation_key};
use crate::mocks::RecordingChannel;
use message_connector_core::{Message, MessageChannel, MessageGroup, MessageGroupStore};
use message_connector_runtime::dead_letter::DeadLetterChannel;
use message_connector_runtime::flow::{FlowError, FlowOutcome, MessageConnectorFlow, MessageConnectorFlowBuilder};
use message_connector_runtime::lock::{DefaultLockRegistry, LockTemplate};
use message_connector_runtime::retry::RetryPolicy;
use message_connector_runtime::store::InMemoryMessageGroupStore;
use std::sync::Arc;
use std::time::Duration;

/// A [`MessageConnectorFlow`] plus handles on everything it talks to.
///
/// Dispatch retries use millisecond delays so failure tests stay fast.
pub struct ConnectorHarness {
    /// The flow under test
    pub flow: MessageConnectorFlow,
    /// Output channel receiving released commands
    pub output: Arc<RecordingChannel>,
    /// Error channel receiving rejected messages
    pub errors: Arc<DeadLetterChannel>,
    /// Message group store
    pub store: Arc<InMemoryMessageGroupStore>,
    /// Lock template shared by the aggregator and the advices
    pub locks: LockTemplate,
    /// Event builders matching the flow's header names
    pub events: EventFactory,
}

impl ConnectorHarness {
    /// Harness with the default flow configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with(|builder| builder)
    }

    /// Harness whose flow builder is further customised by `configure`.
    ///
    /// Store, locks and channels are set before `configure` runs; overriding
    /// them detaches the corresponding harness handle.
    #[must_use]
    pub fn with(configure: impl FnOnce(MessageConnectorFlowBuilder) -> MessageConnectorFlowBuilder) -> Self {
        let output = Arc::new(RecordingChannel::new());
        let errors = Arc::new(DeadLetterChannel::new(DeadLetterChannel::DEFAULT_MAX_SIZE));
        let store = Arc::new(InMemoryMessageGroupStore::new());
        let locks = LockTemplate::new(Arc::new(DefaultLockRegistry::new()));
        let events = EventFactory::default();

        let output_channel: Arc<dyn MessageChannel> = output.clone();
        let error_channel: Arc<dyn MessageChannel> = errors.clone();
        let group_store: Arc<dyn MessageGroupStore> = store.clone();

        let builder = MessageConnectorFlow::builder(output_channel)
            .group_store(group_store)
            .lock_template(locks.clone())
            .error_channel(error_channel)
            .retry_policy(
                RetryPolicy::builder()
                    .max_retries(2)
                    .initial_delay(Duration::from_millis(1))
                    .max_delay(Duration::from_millis(5))
                    .build(),
            );

        Self {
            flow: configure(builder).build(),
            output,
            errors,
            store,
            locks,
            events,
        }
    }

    /// Run `message` through the flow.
    ///
    /// # Errors
    ///
    /// Returns whatever the flow returns.
    pub async fn send(&self, message: Message<Vec<u8>>) -> Result<FlowOutcome, FlowError> {
        self.flow.send(message).await
    }

    /// Pending group for message `name` and correlation `key`.
    ///
    /// # Panics
    ///
    /// Panics if the in-memory store fails, which it does not.
    #[allow(clippy::unwrap_used)]
    pub async fn group(&self, name: &str, key: Option<&str>) -> Option<MessageGroup> {
        self.store
            .message_group(&correlation_key(name, key))
            .await
            .unwrap()
    }

    /// Event types of the pending group, oldest first.
    pub async fn group_event_types(&self, name: &str, key: Option<&str>) -> Vec<String> {
        let event_type = &self.events.headers().event_type;
        self.group(name, key)
            .await
            .map(|group| {
                group
                    .messages()
                    .iter()
                    .filter_map(|message| message.headers().get_str(event_type).map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl Default for ConnectorHarness {
    fn default() -> Self {
        Self::new()
    }
}
