//! Locked aggregation of BPMN message events.
//!
//! The aggregator joins the messages of one conversation. A sent message
//! (`MESSAGE_SENT`) is held until something subscribes to it: an execution
//! waiting for the message (`MESSAGE_WAITING`), or a process definition that
//! starts on it (`START_MESSAGE_DEPLOYED`). Either side may arrive first.
//!
//! Everything happens under the lock of the message's correlation key:
//!
//! 1. skip message types that take no part in aggregation
//! 2. append the message, unless its id is already in the group (redelivery)
//! 3. while the [`ReleaseStrategy`] holds, let the [`MessageGroupProcessor`]
//!    build an output, dispatch it, and only then remove what it consumed
//!
//! A dispatch that still fails after retries leaves the group untouched, so a
//! redelivered message completes the release later.

use crate::lock::LockTemplate;
use crate::metrics::AggregatorMetrics;
use crate::retry::{RetryPolicy, is_transient, retry_with_predicate};
use message_connector_core::correlation::HeaderCorrelationStrategy;
use message_connector_core::payload::{MessagePayloadType, ReceiveMessagePayload, StartMessagePayload};
use message_connector_core::{
    BoxFuture, CorrelationKey, CorrelationStrategy, EventMessage, HandlerError, HeaderNames, LockError, Message,
    MessageChannel, MessageEventType, MessageGroup, MessageGroupStore, MessageHandler,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Decides whether a group is complete enough to release.
pub trait ReleaseStrategy: Send + Sync {
    /// Check whether `group` can release an output.
    fn can_release(&self, group: &MessageGroup) -> bool;
}

/// An output built from a group, and the messages it consumes.
#[derive(Debug, Clone)]
pub struct ReleasedOutput {
    /// Message to dispatch
    pub message: Message<Vec<u8>>,
    /// Ids of the group messages to remove once dispatched
    pub consumed: Vec<Uuid>,
}

/// Builds the output of a releasable group.
pub trait MessageGroupProcessor: Send + Sync {
    /// Build the output for `group`, or `None` if nothing can be released.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError::Encode`] if the output cannot be serialised.
    fn process(&self, group: &MessageGroup) -> Result<Option<ReleasedOutput>, HandlerError>;
}

/// Releases when a sent message meets a waiting execution or a start subscription.
#[derive(Debug, Clone, Default)]
pub struct MessageConnectorReleaseStrategy {
    headers: HeaderNames,
}

impl MessageConnectorReleaseStrategy {
    /// Create the strategy reading the event type from `headers`.
    #[must_use]
    pub const fn new(headers: HeaderNames) -> Self {
        Self { headers }
    }
}

impl ReleaseStrategy for MessageConnectorReleaseStrategy {
    fn can_release(&self, group: &MessageGroup) -> bool {
        let header = &self.headers.event_type;
        group.first_of_type(header, &MessageEventType::MessageSent).is_some()
            && (group.first_of_type(header, &MessageEventType::MessageWaiting).is_some()
                || group
                    .first_of_type(header, &MessageEventType::StartMessageDeployed)
                    .is_some())
    }
}

/// Turns a sent message and its subscriber into an engine command.
///
/// - sent + waiting: [`ReceiveMessagePayload`] for the waiting execution;
///   consumes both messages
/// - sent + start subscription: [`StartMessagePayload`]; consumes only the
///   sent message, the subscription stays registered
///
/// Waiting executions take precedence. The oldest message of each type is
/// used first.
#[derive(Debug, Clone, Default)]
pub struct MessageConnectorGroupProcessor {
    headers: HeaderNames,
}

impl MessageConnectorGroupProcessor {
    /// Create the processor reading and writing the given headers.
    #[must_use]
    pub const fn new(headers: HeaderNames) -> Self {
        Self { headers }
    }

    fn output<C: Serialize>(
        &self,
        group: &MessageGroup,
        payload_type: MessagePayloadType,
        command: &C,
        subscriber: &EventMessage,
        consumed: Vec<Uuid>,
    ) -> Result<ReleasedOutput, HandlerError> {
        let body = serde_json::to_vec(command).map_err(|e| HandlerError::Encode(e.to_string()))?;

        // Same inputs, same id: lets receivers drop a re-released output.
        let seed: String = consumed.iter().map(Uuid::to_string).collect();
        let id = Uuid::new_v5(&Uuid::NAMESPACE_OID, seed.as_bytes());

        let destination = subscriber
            .headers()
            .get_str(&self.headers.service_full_name)
            .map(str::to_string);

        let message = Message::builder(body)
            .id(id)
            .header(&self.headers.correlation_id, group.key().as_str())
            .header(&self.headers.payload_type, payload_type.as_str())
            .header(&self.headers.message_name, subscriber.payload().name.clone())
            .header_if_present(&self.headers.destination, destination)
            .build();

        Ok(ReleasedOutput { message, consumed })
    }
}

impl MessageGroupProcessor for MessageConnectorGroupProcessor {
    fn process(&self, group: &MessageGroup) -> Result<Option<ReleasedOutput>, HandlerError> {
        let header = &self.headers.event_type;
        let Some(sent) = group.first_of_type(header, &MessageEventType::MessageSent) else {
            return Ok(None);
        };
        let message = sent.payload();

        if let Some(waiting) = group.first_of_type(header, &MessageEventType::MessageWaiting) {
            let command = ReceiveMessagePayload {
                name: message.name.clone(),
                correlation_key: message.correlation_key.clone(),
                business_key: message.business_key.clone(),
                variables: message.variables.clone(),
                execution_id: waiting.payload().execution_id.clone(),
            };
            return self
                .output(
                    group,
                    MessagePayloadType::ReceiveMessagePayload,
                    &command,
                    waiting,
                    vec![sent.id(), waiting.id()],
                )
                .map(Some);
        }

        if let Some(deployed) = group.first_of_type(header, &MessageEventType::StartMessageDeployed) {
            let command = StartMessagePayload {
                name: message.name.clone(),
                correlation_key: message.correlation_key.clone(),
                business_key: message.business_key.clone(),
                variables: message.variables.clone(),
            };
            return self
                .output(
                    group,
                    MessagePayloadType::StartMessagePayload,
                    &command,
                    deployed,
                    vec![sent.id()],
                )
                .map(Some);
        }

        Ok(None)
    }
}

/// The aggregating [`MessageHandler`] at the core of the connector flow.
pub struct MessageConnectorAggregator {
    store: Arc<dyn MessageGroupStore>,
    locks: LockTemplate,
    output: Arc<dyn MessageChannel>,
    headers: HeaderNames,
    correlation: Arc<dyn CorrelationStrategy>,
    release: Arc<dyn ReleaseStrategy>,
    processor: Arc<dyn MessageGroupProcessor>,
    retry: RetryPolicy,
    lock_timeout: Option<Duration>,
}

impl MessageConnectorAggregator {
    /// Create an aggregator with the default strategy, processor and retry.
    ///
    /// Messages are correlated by the correlation-id header written by the
    /// flow's enrichment stage, and the lock is awaited without timeout.
    #[must_use]
    pub fn new(
        store: Arc<dyn MessageGroupStore>,
        locks: LockTemplate,
        output: Arc<dyn MessageChannel>,
        headers: HeaderNames,
    ) -> Self {
        Self {
            store,
            locks,
            output,
            correlation: Arc::new(HeaderCorrelationStrategy::new(headers.clone())),
            release: Arc::new(MessageConnectorReleaseStrategy::new(headers.clone())),
            processor: Arc::new(MessageConnectorGroupProcessor::new(headers.clone())),
            headers,
            retry: RetryPolicy::default(),
            lock_timeout: None,
        }
    }

    /// Replace the release strategy.
    #[must_use]
    pub fn with_release_strategy(mut self, release: Arc<dyn ReleaseStrategy>) -> Self {
        self.release = release;
        self
    }

    /// Replace the group processor.
    #[must_use]
    pub fn with_group_processor(mut self, processor: Arc<dyn MessageGroupProcessor>) -> Self {
        self.processor = processor;
        self
    }

    /// Replace the correlation strategy.
    #[must_use]
    pub fn with_correlation(mut self, correlation: Arc<dyn CorrelationStrategy>) -> Self {
        self.correlation = correlation;
        self
    }

    /// Set the dispatch retry policy.
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Bound the wait for the correlation lock.
    ///
    /// When the lock is not acquired in time, handling fails with
    /// [`LockError::Unavailable`].
    #[must_use]
    pub const fn with_lock_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.lock_timeout = timeout;
        self
    }

    fn participates(event_type: &MessageEventType) -> bool {
        matches!(
            event_type,
            MessageEventType::StartMessageDeployed | MessageEventType::MessageWaiting | MessageEventType::MessageSent
        )
    }

    async fn aggregate(&self, key: &CorrelationKey, message: EventMessage) -> Result<(), HandlerError> {
        let mut group = match self.store.message_group(key).await? {
            // A redelivery: nothing to append, but a release that failed to
            // dispatch earlier gets another chance below.
            Some(group) if group.contains(message.id()) => {
                tracing::debug!(correlation_id = %key, message_id = %message.id(), "Message already in group");
                group
            }
            _ => {
                let event_type = message
                    .headers()
                    .get_str(&self.headers.event_type)
                    .unwrap_or_default()
                    .to_string();
                let group = self.store.add_message_to_group(key, message).await?;
                AggregatorMetrics::record_aggregated(&event_type);
                tracing::debug!(correlation_id = %key, event_type = %event_type, size = group.len(), "Message added to group");
                group
            }
        };

        while self.release.can_release(&group) {
            let Some(output) = self.processor.process(&group)? else {
                break;
            };
            if output.consumed.is_empty() {
                tracing::warn!(correlation_id = %key, "Group processor consumed nothing, stopping release");
                break;
            }

            let payload_type = output
                .message
                .headers()
                .get_str(&self.headers.payload_type)
                .and_then(MessagePayloadType::parse);
            self.dispatch(key, output.message).await?;
            self.store.remove_messages_from_group(key, &output.consumed).await?;

            if let Some(payload_type) = payload_type {
                AggregatorMetrics::record_released(payload_type.as_str());
            }
            tracing::info!(correlation_id = %key, consumed = output.consumed.len(), "Group released");

            match self.store.message_group(key).await? {
                Some(remaining) => group = remaining,
                None => break,
            }
        }

        Ok(())
    }

    async fn dispatch(&self, key: &CorrelationKey, message: Message<Vec<u8>>) -> Result<(), HandlerError> {
        retry_with_predicate(&self.retry, || self.output.send(message.clone()), is_transient)
            .await
            .map_err(|err| {
                AggregatorMetrics::record_dispatch_failure();
                tracing::error!(correlation_id = %key, error = %err, "Dispatch failed, group left intact");
                HandlerError::Dispatch(err)
            })
    }
}

impl MessageHandler for MessageConnectorAggregator {
    fn handle(&self, message: EventMessage) -> BoxFuture<'_, Result<(), HandlerError>> {
        Box::pin(async move {
            let key = self.correlation.correlation_key(message.headers())?;
            let event_type = MessageEventType::parse(message.headers().get_str(&self.headers.event_type).unwrap_or_default());
            if !Self::participates(&event_type) {
                tracing::debug!(correlation_id = %key, %event_type, "Event type not aggregated");
                return Ok(());
            }

            let lock_key = key.lock_key();
            let operation = || self.aggregate(&key, message);
            match self.lock_timeout {
                None => self.locks.lock_interruptibly(&lock_key, operation).await,
                Some(timeout) => self
                    .locks
                    .try_lock_for(&lock_key, timeout, operation)
                    .await?
                    .ok_or_else(|| HandlerError::Lock(LockError::Unavailable { key: lock_key.clone(), timeout })),
            }
        })
    }
}
