//! Idempotent receiver: drops redelivered messages.
//!
//! The advice claims each message id in a [`MetadataStore`] before handing
//! the message on. A message whose id is already claimed is a redelivery and
//! is acknowledged without reaching the rest of the chain. If the chain fails,
//! the claim is withdrawn so that a later redelivery is processed again.

use crate::metrics::AdviceMetrics;
use message_connector_core::{
    BoxFuture, Clock, EventMessage, HandleMessageAdvice, HandlerError, MetadataStore, Next, StoreError, SystemClock,
};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

/// Bounded in-memory [`MetadataStore`].
///
/// Once `capacity` entries are held, inserting a new key evicts the oldest
/// one. Size the capacity above the broker's redelivery window.
#[derive(Debug, Clone)]
pub struct InMemoryMetadataStore {
    inner: Arc<Mutex<Entries>>,
    capacity: usize,
}

#[derive(Debug, Default)]
struct Entries {
    values: HashMap<String, String>,
    order: VecDeque<String>,
}

impl Entries {
    fn insert(&mut self, key: &str, value: &str, capacity: usize) {
        if self.values.insert(key.to_string(), value.to_string()).is_none() {
            self.order.push_back(key.to_string());
        }
        while self.order.len() > capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.values.remove(&oldest);
            }
        }
    }

    fn remove(&mut self, key: &str) -> Option<String> {
        let removed = self.values.remove(key)?;
        self.order.retain(|entry| entry != key);
        Some(removed)
    }
}

impl InMemoryMetadataStore {
    /// Default number of remembered keys.
    pub const DEFAULT_CAPACITY: usize = 100_000;

    /// Create a store remembering up to `capacity` keys (at least one).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Entries::default())),
            capacity: capacity.max(1),
        }
    }

    /// Number of stored keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).values.len()
    }

    /// Check if the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryMetadataStore {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

impl MetadataStore for InMemoryMetadataStore {
    fn put_if_absent<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
    ) -> BoxFuture<'a, Result<Option<String>, StoreError>> {
        Box::pin(async move {
            let mut entries = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(existing) = entries.values.get(key) {
                return Ok(Some(existing.clone()));
            }
            entries.insert(key, value, self.capacity);
            Ok(None)
        })
    }

    fn put<'a>(&'a self, key: &'a str, value: &'a str) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            self.inner
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(key, value, self.capacity);
            Ok(())
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<String>, StoreError>> {
        Box::pin(async move {
            Ok(self
                .inner
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .values
                .get(key)
                .cloned())
        })
    }

    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<String>, StoreError>> {
        Box::pin(async move { Ok(self.inner.lock().unwrap_or_else(PoisonError::into_inner).remove(key)) })
    }
}

/// Advice that lets each message id through at most once.
///
/// The claim value is the time the id was first seen.
#[derive(Clone)]
pub struct IdempotentReceiverAdvice {
    store: Arc<dyn MetadataStore>,
    clock: Arc<dyn Clock>,
}

impl IdempotentReceiverAdvice {
    /// Create the advice over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn MetadataStore>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
        }
    }

    /// Stamp claims with `clock`.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

impl HandleMessageAdvice for IdempotentReceiverAdvice {
    fn invoke<'a>(&'a self, message: EventMessage, next: Next<'a>) -> BoxFuture<'a, Result<(), HandlerError>> {
        Box::pin(async move {
            let key = message.id().to_string();
            let claimed_at = self.clock.now().to_rfc3339();

            if let Some(first_seen) = self.store.put_if_absent(&key, &claimed_at).await? {
                AdviceMetrics::record_duplicate();
                tracing::info!(message_id = %key, first_seen = %first_seen, "Duplicate message dropped");
                return Ok(());
            }

            let result = next.proceed(message).await;
            if result.is_err() {
                // Let a redelivery retry what failed this time.
                if let Err(err) = self.store.remove(&key).await {
                    tracing::warn!(message_id = %key, error = %err, "Failed to release idempotency claim");
                }
            }
            result
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use message_connector_core::{HandlerChain, Message, MessageEventPayload, MessageHandler};

    #[tokio::test]
    async fn put_if_absent_returns_existing_value() {
        let store = InMemoryMetadataStore::default();
        assert_eq!(store.put_if_absent("a", "1").await.unwrap(), None);
        assert_eq!(store.put_if_absent("a", "2").await.unwrap(), Some("1".to_string()));
        assert_eq!(store.get("a").await.unwrap(), Some("1".to_string()));
    }

    #[tokio::test]
    async fn oldest_key_is_evicted_at_capacity() {
        let store = InMemoryMetadataStore::new(2);
        store.put("a", "1").await.unwrap();
        store.put("b", "2").await.unwrap();
        store.put("c", "3").await.unwrap();

        assert_eq!(store.len(), 2);
        assert_eq!(store.get("a").await.unwrap(), None);
        assert_eq!(store.get("c").await.unwrap(), Some("3".to_string()));
    }

    #[tokio::test]
    async fn overwrite_does_not_duplicate_order_entry() {
        let store = InMemoryMetadataStore::new(2);
        store.put("a", "1").await.unwrap();
        store.put("a", "2").await.unwrap();
        store.put("b", "3").await.unwrap();

        assert_eq!(store.get("a").await.unwrap(), Some("2".to_string()));
        assert_eq!(store.len(), 2);
    }

    struct StoppedClock(DateTime<Utc>);

    impl Clock for StoppedClock {
        fn now(&self) -> DateTime<Utc> {
            self.0
        }
    }

    struct Accept;

    impl MessageHandler for Accept {
        fn handle(&self, _message: EventMessage) -> BoxFuture<'_, Result<(), HandlerError>> {
            Box::pin(async { Ok(()) })
        }
    }

    #[tokio::test]
    async fn claim_is_stamped_by_injected_clock() {
        let seen = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        let store = Arc::new(InMemoryMetadataStore::default());
        let metadata: Arc<dyn MetadataStore> = store.clone();
        let advice = IdempotentReceiverAdvice::new(metadata).with_clock(Arc::new(StoppedClock(seen)));
        let chain = HandlerChain::new(Arc::new(Accept)).with_advice(Arc::new(advice));
        let message = Message::builder(MessageEventPayload::new("order-paid")).build();

        chain.handle(message.clone()).await.unwrap();
        chain.handle(message.clone()).await.unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(
            store.get(&message.id().to_string()).await.unwrap(),
            Some(seen.to_rfc3339())
        );
    }

    #[tokio::test]
    async fn remove_forgets_key() {
        let store = InMemoryMetadataStore::default();
        store.put("a", "1").await.unwrap();
        assert_eq!(store.remove("a").await.unwrap(), Some("1".to_string()));
        assert!(store.is_empty());
        assert_eq!(store.put_if_absent("a", "2").await.unwrap(), None);
    }
}
