//! The message connector flow: filter, enrich, decode, hand off.
//!
//! ```text
//! send(Message<Vec<u8>>)
//!   ├─ filter:  event-type header present?      no ─► error channel, Discarded
//!   ├─ enrich:  correlation id header           missing name ─► error channel, Err(Correlation)
//!   ├─ decode:  JSON ─► MessageEventPayload     malformed ─► error channel, Err(Decode)
//!   └─ handler chain
//!        idempotent receiver ─► subscription-cancelled ─► aggregator
//! ```
//!
//! Messages rejected before the handler chain go to the error channel and,
//! except for filtered ones, the failure is also returned. Failures inside
//! the handler chain are returned as [`FlowError::Handler`] so the transport
//! can withhold its acknowledgement and let the broker redeliver.
//!
//! # Example
//!
//! ```rust
//! use message_connector_runtime::flow::{FlowOutcome, MessageConnectorFlow};
//! use message_connector_runtime::dead_letter::DeadLetterChannel;
//! use message_connector_core::Message;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let commands = Arc::new(DeadLetterChannel::new(10)); // any MessageChannel
//! let flow = MessageConnectorFlow::builder(commands).build();
//!
//! let outcome = flow.send(Message::builder(b"{}".to_vec()).build()).await?;
//! assert_eq!(outcome, FlowOutcome::Discarded);
//! # Ok(())
//! # }
//! ```

use crate::advice::SubscriptionCancelledHandlerAdvice;
use crate::aggregator::MessageConnectorAggregator;
use crate::config::ConnectorConfig;
use crate::dead_letter::DeadLetterChannel;
use crate::idempotent::{IdempotentReceiverAdvice, InMemoryMetadataStore};
use crate::lock::{DefaultLockRegistry, LockTemplate};
use crate::metrics::FlowMetrics;
use crate::retry::RetryPolicy;
use crate::store::InMemoryMessageGroupStore;
use message_connector_core::correlation::MessageEventCorrelationStrategy;
use message_connector_core::{
    ChannelError, CorrelationError, CorrelationKey, CorrelationStrategy, EventMessage, HandleMessageAdvice,
    HandlerChain, HandlerError, HeaderNames, Message, MessageChannel, MessageEventPayload, MessageGroupStore,
    MessageHandler, MetadataStore,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use uuid::Uuid;

/// What happened to a message accepted by [`MessageConnectorFlow::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowOutcome {
    /// No event type; sent to the error channel
    Discarded,
    /// Passed through the handler chain
    Handled,
}

/// Errors returned by the flow.
#[derive(Error, Debug)]
pub enum FlowError {
    /// The payload is not a valid message event
    #[error("Failed to decode message {message_id}: {reason}")]
    Decode {
        /// Id of the undecodable message
        message_id: Uuid,
        /// Decoder error
        reason: String,
    },

    /// The message could not be correlated
    #[error(transparent)]
    Correlation(#[from] CorrelationError),

    /// The handler chain failed
    #[error(transparent)]
    Handler(#[from] HandlerError),

    /// The error channel refused a rejected message
    #[error("Error channel failed: {0}")]
    ErrorChannel(#[source] ChannelError),
}

/// Entry point of the connector.
pub struct MessageConnectorFlow {
    headers: HeaderNames,
    correlation: Arc<dyn CorrelationStrategy>,
    handler: HandlerChain,
    error_channel: Arc<dyn MessageChannel>,
}

impl MessageConnectorFlow {
    /// Start building a flow dispatching released commands to `output`.
    #[must_use]
    pub fn builder(output: Arc<dyn MessageChannel>) -> MessageConnectorFlowBuilder {
        MessageConnectorFlowBuilder::new(output)
    }

    /// Whether `message` carries a non-null event type.
    #[must_use]
    pub fn filter<P>(&self, message: &Message<P>) -> bool {
        message.headers().contains(&self.headers.event_type)
    }

    /// Derive the correlation id of `message` from its headers.
    ///
    /// # Errors
    ///
    /// Returns [`CorrelationError::MissingHeader`] without a message name.
    pub fn derive_correlation_id<P>(&self, message: &Message<P>) -> Result<CorrelationKey, CorrelationError> {
        self.correlation.correlation_key(message.headers())
    }

    /// Decode the JSON payload, keeping id and headers.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::Decode`] if the payload is not a message event.
    pub fn decode(&self, message: &Message<Vec<u8>>) -> Result<EventMessage, FlowError> {
        let payload: MessageEventPayload =
            serde_json::from_slice(message.payload()).map_err(|e| FlowError::Decode {
                message_id: message.id(),
                reason: e.to_string(),
            })?;
        Ok(Message::builder(payload)
            .id(message.id())
            .copy_headers(message.headers())
            .build())
    }

    /// The handler chain behind the decoding stage.
    #[must_use]
    pub const fn handler(&self) -> &HandlerChain {
        &self.handler
    }

    /// Run `message` through the flow.
    ///
    /// # Errors
    ///
    /// - [`FlowError::Correlation`] / [`FlowError::Decode`]: the message was
    ///   also sent to the error channel
    /// - [`FlowError::Handler`]: the handler chain failed
    /// - [`FlowError::ErrorChannel`]: a rejected message could not be parked
    #[tracing::instrument(skip(self, message), fields(message_id = %message.id()), name = "connector_send")]
    pub async fn send(&self, message: Message<Vec<u8>>) -> Result<FlowOutcome, FlowError> {
        FlowMetrics::record_received();

        if !self.filter(&message) {
            FlowMetrics::record_discarded();
            tracing::debug!(header = %self.headers.event_type, "No event type, discarding");
            self.reject(message, None).await?;
            return Ok(FlowOutcome::Discarded);
        }

        let key = match self.derive_correlation_id(&message) {
            Ok(key) => key,
            Err(err) => {
                FlowMetrics::record_correlation_error();
                tracing::warn!(error = %err, "Message cannot be correlated");
                self.reject(message, Some(err.to_string())).await?;
                return Err(err.into());
            }
        };
        let message = message.with_header(&self.headers.correlation_id, key.as_str());

        let decoded = match self.decode(&message) {
            Ok(decoded) => decoded,
            Err(err) => {
                FlowMetrics::record_decode_error();
                tracing::warn!(correlation_id = %key, error = %err, "Message payload cannot be decoded");
                self.reject(message, Some(err.to_string())).await?;
                return Err(err);
            }
        };

        let started = Instant::now();
        let result = self.handler.handle(decoded).await;
        FlowMetrics::record_handled(started.elapsed());

        if let Err(err) = &result {
            tracing::warn!(correlation_id = %key, error = %err, "Message handling failed");
        }
        result?;
        Ok(FlowOutcome::Handled)
    }

    async fn reject(&self, message: Message<Vec<u8>>, reason: Option<String>) -> Result<(), FlowError> {
        let message = match reason {
            Some(reason) => message.with_header(&self.headers.error, reason),
            None => message,
        };
        self.error_channel.send(message).await.map_err(FlowError::ErrorChannel)
    }
}

/// Builder for [`MessageConnectorFlow`].
///
/// Unset collaborators default to in-process implementations: an in-memory
/// group store, a [`DefaultLockRegistry`], and a [`DeadLetterChannel`] as
/// error channel. Idempotency is on by default with an
/// [`InMemoryMetadataStore`].
pub struct MessageConnectorFlowBuilder {
    output: Arc<dyn MessageChannel>,
    headers: HeaderNames,
    store: Option<Arc<dyn MessageGroupStore>>,
    locks: Option<LockTemplate>,
    error_channel: Option<Arc<dyn MessageChannel>>,
    metadata: Option<Arc<dyn MetadataStore>>,
    idempotent: bool,
    retry: RetryPolicy,
    lock_timeout: Option<Duration>,
    dead_letter_size: usize,
    idempotency_capacity: usize,
    advices: Vec<Arc<dyn HandleMessageAdvice>>,
}

impl MessageConnectorFlowBuilder {
    fn new(output: Arc<dyn MessageChannel>) -> Self {
        Self {
            output,
            headers: HeaderNames::default(),
            store: None,
            locks: None,
            error_channel: None,
            metadata: None,
            idempotent: true,
            retry: RetryPolicy::default(),
            lock_timeout: None,
            dead_letter_size: DeadLetterChannel::DEFAULT_MAX_SIZE,
            idempotency_capacity: InMemoryMetadataStore::DEFAULT_CAPACITY,
            advices: Vec::new(),
        }
    }

    /// Apply headers, lock, dispatch, idempotency and dead-letter settings.
    #[must_use]
    pub fn config(mut self, config: &ConnectorConfig) -> Self {
        self.headers = config.headers.clone();
        self.lock_timeout = config.lock.timeout();
        self.retry = config.dispatch.retry_policy();
        self.idempotent = config.idempotency.enabled;
        self.idempotency_capacity = config.idempotency.capacity;
        self.dead_letter_size = config.dead_letter.max_size;
        self
    }

    /// Set the header names.
    #[must_use]
    pub fn headers(mut self, headers: HeaderNames) -> Self {
        self.headers = headers;
        self
    }

    /// Use `store` for message groups.
    #[must_use]
    pub fn group_store(mut self, store: Arc<dyn MessageGroupStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use `locks` for correlation locks.
    #[must_use]
    pub fn lock_template(mut self, locks: LockTemplate) -> Self {
        self.locks = Some(locks);
        self
    }

    /// Send rejected messages to `channel`.
    #[must_use]
    pub fn error_channel(mut self, channel: Arc<dyn MessageChannel>) -> Self {
        self.error_channel = Some(channel);
        self
    }

    /// Claim message ids in `store`; enables idempotency.
    #[must_use]
    pub fn metadata_store(mut self, store: Arc<dyn MetadataStore>) -> Self {
        self.metadata = Some(store);
        self.idempotent = true;
        self
    }

    /// Turn the idempotent receiver on or off.
    #[must_use]
    pub const fn idempotent(mut self, enabled: bool) -> Self {
        self.idempotent = enabled;
        self
    }

    /// Set the dispatch retry policy.
    #[must_use]
    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Bound the wait for correlation locks during aggregation.
    #[must_use]
    pub const fn lock_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Add an advice inside the built-in ones, right around the aggregator.
    #[must_use]
    pub fn advice(mut self, advice: Arc<dyn HandleMessageAdvice>) -> Self {
        self.advices.push(advice);
        self
    }

    /// Assemble the flow.
    #[must_use]
    pub fn build(self) -> MessageConnectorFlow {
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryMessageGroupStore::new()));
        let locks = self
            .locks
            .unwrap_or_else(|| LockTemplate::new(Arc::new(DefaultLockRegistry::new())));
        let error_channel = self.error_channel.unwrap_or_else(|| {
            Arc::new(DeadLetterChannel::new(self.dead_letter_size).with_headers(&self.headers))
        });

        let aggregator = MessageConnectorAggregator::new(
            Arc::clone(&store),
            locks.clone(),
            self.output,
            self.headers.clone(),
        )
        .with_retry_policy(self.retry)
        .with_lock_timeout(self.lock_timeout);

        let mut handler = HandlerChain::new(Arc::new(aggregator));
        if self.idempotent {
            let metadata = self
                .metadata
                .unwrap_or_else(|| Arc::new(InMemoryMetadataStore::new(self.idempotency_capacity)));
            handler = handler.with_advice(Arc::new(IdempotentReceiverAdvice::new(metadata)));
        }
        handler = handler.with_advice(Arc::new(SubscriptionCancelledHandlerAdvice::new(
            store,
            locks,
            self.headers.clone(),
        )
        .with_lock_timeout(self.lock_timeout)));
        for advice in self.advices {
            handler = handler.with_advice(advice);
        }

        tracing::debug!(advices = handler.advice_count(), "Message connector flow assembled");

        MessageConnectorFlow {
            correlation: Arc::new(MessageEventCorrelationStrategy::new(self.headers.clone())),
            headers: self.headers,
            handler,
            error_channel,
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn flow() -> MessageConnectorFlow {
        MessageConnectorFlow::builder(Arc::new(DeadLetterChannel::new(1))).build()
    }

    #[test]
    fn filter_requires_non_null_event_type() {
        let flow = flow();
        let typed = Message::builder(Vec::<u8>::new()).header("eventType", "MESSAGE_SENT").build();
        let null = Message::builder(Vec::<u8>::new())
            .header("eventType", serde_json::Value::Null)
            .build();
        let untyped = Message::builder(Vec::<u8>::new()).build();

        assert!(flow.filter(&typed));
        assert!(!flow.filter(&null));
        assert!(!flow.filter(&untyped));
    }

    #[test]
    fn decode_keeps_identity_and_headers() {
        let flow = flow();
        let raw = Message::builder(br#"{"name":"order-paid","correlationKey":"1"}"#.to_vec())
            .header("eventType", "MESSAGE_SENT")
            .build();

        let decoded = flow.decode(&raw).unwrap();
        assert_eq!(decoded.id(), raw.id());
        assert_eq!(decoded.payload().name, "order-paid");
        assert_eq!(decoded.headers().get_str("eventType"), Some("MESSAGE_SENT"));
    }

    #[test]
    fn decode_reports_malformed_payload() {
        let flow = flow();
        let raw = Message::builder(b"{not json".to_vec()).build();
        assert!(matches!(
            flow.decode(&raw),
            Err(FlowError::Decode { message_id, .. }) if message_id == raw.id()
        ));
    }

    #[test]
    fn correlation_id_combines_name_and_key() {
        let flow = flow();
        let message = Message::builder(Vec::<u8>::new())
            .header("messageEventName", "order-paid")
            .header("messageEventCorrelationKey", "1")
            .build();
        assert_eq!(
            flow.derive_correlation_id(&message).unwrap(),
            CorrelationKey::from("order-paid:1")
        );
    }

    #[test]
    fn builder_installs_both_advices_by_default() {
        assert_eq!(flow().handler().advice_count(), 2);
        let without_idempotency = MessageConnectorFlow::builder(Arc::new(DeadLetterChannel::new(1)))
            .idempotent(false)
            .build();
        assert_eq!(without_idempotency.handler().advice_count(), 1);
    }
}
