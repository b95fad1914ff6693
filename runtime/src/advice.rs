//! Subscription-cancelled reconciliation.
//!
//! When a process definition is undeployed or replaced, the engine publishes
//! `MESSAGE_SUBSCRIPTION_CANCELLED`. Any start-message registration still
//! pending for that correlation key is stale from then on and must not start
//! a process when the matching message is sent.
//!
//! [`SubscriptionCancelledHandlerAdvice`] removes those registrations before
//! handing the message on. Reading the group and removing the stale messages
//! happen in one critical section under the key's lock, so a message appended
//! concurrently is never lost or wrongly removed.
//!
//! ```text
//! NoGroup ──cancelled──► NoGroup                       (no store access beyond the read)
//! Pending(ms) ──cancelled──► Pending(ms | retained)    (complement removed; deleted if empty)
//! ```

use crate::lock::LockTemplate;
use crate::metrics::AdviceMetrics;
use message_connector_core::correlation::HeaderCorrelationStrategy;
use message_connector_core::{
    BoxFuture, CorrelationStrategy, EventMessage, HandleMessageAdvice, HandlerError, HeaderNames, LockError,
    MessageEventType, MessageGroupStore, Next,
};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Decides which messages of a group survive reconciliation.
///
/// Returns `true` for messages to keep.
pub type MessageListPredicate = Arc<dyn Fn(&EventMessage) -> bool + Send + Sync>;

/// Keep every message whose event type is not `START_MESSAGE_DEPLOYED`.
#[must_use]
pub fn not_start_message_deployed(headers: &HeaderNames) -> MessageListPredicate {
    let event_type_header = headers.event_type.clone();
    Arc::new(move |message: &EventMessage| {
        message.headers().get_str(&event_type_header) != Some(MessageEventType::StartMessageDeployed.as_str())
    })
}

/// Advice that reconciles a group when its subscription is cancelled.
pub struct SubscriptionCancelledHandlerAdvice {
    store: Arc<dyn MessageGroupStore>,
    locks: LockTemplate,
    correlation: Arc<dyn CorrelationStrategy>,
    headers: HeaderNames,
    retain: MessageListPredicate,
    lock_timeout: Option<Duration>,
}

impl SubscriptionCancelledHandlerAdvice {
    /// Create the advice with the default predicate and correlation.
    ///
    /// Messages are correlated by the correlation-id header written by the
    /// flow's enrichment stage.
    #[must_use]
    pub fn new(store: Arc<dyn MessageGroupStore>, locks: LockTemplate, headers: HeaderNames) -> Self {
        Self {
            store,
            locks,
            correlation: Arc::new(HeaderCorrelationStrategy::new(headers.clone())),
            retain: not_start_message_deployed(&headers),
            headers,
            lock_timeout: None,
        }
    }

    /// Replace the retained-subset predicate.
    #[must_use]
    pub fn with_predicate(mut self, retain: MessageListPredicate) -> Self {
        self.retain = retain;
        self
    }

    /// Replace the correlation strategy.
    #[must_use]
    pub fn with_correlation(mut self, correlation: Arc<dyn CorrelationStrategy>) -> Self {
        self.correlation = correlation;
        self
    }

    /// Bound the wait for the correlation lock.
    ///
    /// When the lock is not acquired in time, reconciliation fails with
    /// [`LockError::Unavailable`] and the next handler is not called.
    #[must_use]
    pub const fn with_lock_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.lock_timeout = timeout;
        self
    }

    fn is_cancellation(&self, message: &EventMessage) -> bool {
        message.headers().get_str(&self.headers.event_type)
            == Some(MessageEventType::MessageSubscriptionCancelled.as_str())
    }

    /// Remove the messages rejected by the predicate from the message's group.
    ///
    /// Returns how many messages were removed.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError`] if the message cannot be correlated, the lock
    /// cannot be acquired, or the store fails.
    pub async fn reconcile(&self, message: &EventMessage) -> Result<usize, HandlerError> {
        let key = self.correlation.correlation_key(message.headers())?;
        let lock_key = key.lock_key();

        let operation = || async {
            let Some(group) = self.store.message_group(&key).await? else {
                tracing::debug!(correlation_id = %key, "No pending group for cancelled subscription");
                return Ok(0);
            };

            let stale: Vec<Uuid> = group
                .messages()
                .iter()
                .filter(|candidate| !(self.retain)(*candidate))
                .map(|candidate| candidate.id())
                .collect();

            if stale.is_empty() {
                return Ok(0);
            }

            self.store.remove_messages_from_group(&key, &stale).await?;
            AdviceMetrics::record_subscription_cancelled(stale.len());
            tracing::info!(
                correlation_id = %key,
                removed = stale.len(),
                retained = group.len() - stale.len(),
                "Removed stale start-message registrations"
            );
            Ok::<_, HandlerError>(stale.len())
        };
        match self.lock_timeout {
            None => self.locks.lock_interruptibly(&lock_key, operation).await,
            Some(timeout) => self
                .locks
                .try_lock_for(&lock_key, timeout, operation)
                .await?
                .ok_or_else(|| HandlerError::Lock(LockError::Unavailable { key: lock_key.clone(), timeout })),
        }
    }
}

impl HandleMessageAdvice for SubscriptionCancelledHandlerAdvice {
    fn invoke<'a>(&'a self, message: EventMessage, next: Next<'a>) -> BoxFuture<'a, Result<(), HandlerError>> {
        Box::pin(async move {
            if self.is_cancellation(&message) {
                self.reconcile(&message).await?;
            }
            next.proceed(message).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use message_connector_core::{Message, MessageEventPayload};

    fn typed(event_type: &str) -> EventMessage {
        Message::builder(MessageEventPayload::new("m"))
            .header("eventType", event_type)
            .build()
    }

    #[test]
    fn default_predicate_drops_only_start_registrations() {
        let keep = not_start_message_deployed(&HeaderNames::default());
        assert!(!keep(&typed("START_MESSAGE_DEPLOYED")));
        assert!(keep(&typed("MESSAGE_WAITING")));
        assert!(keep(&typed("OTHER")));
        assert!(keep(&Message::builder(MessageEventPayload::new("m")).build()));
    }

    #[test]
    fn predicate_honours_configured_header() {
        let headers = HeaderNames {
            event_type: "type".to_string(),
            ..HeaderNames::default()
        };
        let keep = not_start_message_deployed(&headers);
        let message = Message::builder(MessageEventPayload::new("m"))
            .header("type", "START_MESSAGE_DEPLOYED")
            .build();
        assert!(!keep(&message));
    }
}
