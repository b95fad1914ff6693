//! In-memory message group store.
//!
//! Suitable for single-instance deployments and tests. Groups do not survive
//! a restart; use a persistent [`MessageGroupStore`] when messages must not
//! be lost between deliveries.

use crate::metrics::AggregatorMetrics;
use chrono::{DateTime, Utc};
use message_connector_core::{
    BoxFuture, Clock, CorrelationKey, EventMessage, MessageGroup, MessageGroupStore, StoreError, SystemClock,
};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use uuid::Uuid;

struct StoredGroup {
    messages: Vec<EventMessage>,
    created_at: DateTime<Utc>,
    last_modified: DateTime<Utc>,
}

impl StoredGroup {
    fn snapshot(&self, key: &CorrelationKey) -> MessageGroup {
        MessageGroup::new(key.clone(), self.messages.clone(), self.created_at, self.last_modified)
    }
}

/// Message groups held in a map behind a lock.
///
/// Cloning shares the underlying map.
#[derive(Clone)]
pub struct InMemoryMessageGroupStore {
    groups: Arc<RwLock<HashMap<CorrelationKey, StoredGroup>>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryMessageGroupStore {
    /// Create an empty store stamped by the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty store stamped by `clock`.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            groups: Arc::new(RwLock::new(HashMap::new())),
            clock,
        }
    }

    fn publish_count(groups: &HashMap<CorrelationKey, StoredGroup>) {
        AggregatorMetrics::record_group_count(groups.len());
    }
}

impl Default for InMemoryMessageGroupStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageGroupStore for InMemoryMessageGroupStore {
    fn message_group<'a>(
        &'a self,
        key: &'a CorrelationKey,
    ) -> BoxFuture<'a, Result<Option<MessageGroup>, StoreError>> {
        Box::pin(async move {
            let groups = self.groups.read().unwrap_or_else(PoisonError::into_inner);
            Ok(groups.get(key).map(|group| group.snapshot(key)))
        })
    }

    fn add_message_to_group<'a>(
        &'a self,
        key: &'a CorrelationKey,
        message: EventMessage,
    ) -> BoxFuture<'a, Result<MessageGroup, StoreError>> {
        Box::pin(async move {
            let now = self.clock.now();
            let mut groups = self.groups.write().unwrap_or_else(PoisonError::into_inner);
            let group = groups.entry(key.clone()).or_insert_with(|| StoredGroup {
                messages: Vec::new(),
                created_at: now,
                last_modified: now,
            });
            group.messages.push(message);
            group.last_modified = now;
            let snapshot = group.snapshot(key);

            Self::publish_count(&groups);
            Ok(snapshot)
        })
    }

    fn remove_messages_from_group<'a>(
        &'a self,
        key: &'a CorrelationKey,
        ids: &'a [Uuid],
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            let now = self.clock.now();
            let mut groups = self.groups.write().unwrap_or_else(PoisonError::into_inner);
            let Some(group) = groups.get_mut(key) else {
                return Ok(());
            };

            let before = group.messages.len();
            group.messages.retain(|message| !ids.contains(&message.id()));
            if group.messages.len() != before {
                group.last_modified = now;
            }
            if group.messages.is_empty() {
                groups.remove(key);
                tracing::trace!(group = %key, "Message group emptied and deleted");
            }

            Self::publish_count(&groups);
            Ok(())
        })
    }

    fn remove_message_group<'a>(&'a self, key: &'a CorrelationKey) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            let mut groups = self.groups.write().unwrap_or_else(PoisonError::into_inner);
            groups.remove(key);
            Self::publish_count(&groups);
            Ok(())
        })
    }

    fn message_group_count(&self) -> BoxFuture<'_, Result<usize, StoreError>> {
        Box::pin(async move { Ok(self.groups.read().unwrap_or_else(PoisonError::into_inner).len()) })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use chrono::TimeZone;
    use message_connector_core::{Message, MessageEventPayload};
    use std::sync::Mutex;

    struct SteppingClock {
        now: Mutex<DateTime<Utc>>,
    }

    impl Clock for SteppingClock {
        fn now(&self) -> DateTime<Utc> {
            let mut now = self.now.lock().unwrap();
            *now += chrono::Duration::seconds(1);
            *now
        }
    }

    fn message(name: &str) -> EventMessage {
        Message::builder(MessageEventPayload::new(name)).build()
    }

    #[tokio::test]
    async fn add_creates_then_appends_in_order() {
        let store = InMemoryMessageGroupStore::new();
        let key = CorrelationKey::from("m:k");
        let (first, second) = (message("a"), message("b"));

        store.add_message_to_group(&key, first.clone()).await.unwrap();
        let group = store.add_message_to_group(&key, second.clone()).await.unwrap();

        assert_eq!(group.len(), 2);
        assert_eq!(group.messages()[0].id(), first.id());
        assert_eq!(group.messages()[1].id(), second.id());
        assert_eq!(store.message_group_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn removing_all_messages_deletes_group() {
        let store = InMemoryMessageGroupStore::new();
        let key = CorrelationKey::from("m:k");
        let (first, second) = (message("a"), message("b"));
        store.add_message_to_group(&key, first.clone()).await.unwrap();
        store.add_message_to_group(&key, second.clone()).await.unwrap();

        store.remove_messages_from_group(&key, &[first.id()]).await.unwrap();
        let group = store.message_group(&key).await.unwrap().unwrap();
        assert_eq!(group.len(), 1);
        assert!(group.contains(second.id()));

        store.remove_messages_from_group(&key, &[second.id()]).await.unwrap();
        assert!(store.message_group(&key).await.unwrap().is_none());
        assert_eq!(store.message_group_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unknown_key_and_ids_are_ignored() {
        let store = InMemoryMessageGroupStore::new();
        let key = CorrelationKey::from("m:k");
        store
            .remove_messages_from_group(&key, &[Uuid::new_v4()])
            .await
            .unwrap();
        store.remove_message_group(&key).await.unwrap();
        assert!(store.message_group(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn timestamps_come_from_clock() {
        let start = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let store = InMemoryMessageGroupStore::with_clock(Arc::new(SteppingClock {
            now: Mutex::new(start),
        }));
        let key = CorrelationKey::from("m:k");

        store.add_message_to_group(&key, message("a")).await.unwrap();
        let group = store.add_message_to_group(&key, message("b")).await.unwrap();

        assert_eq!(group.created_at(), start + chrono::Duration::seconds(1));
        assert_eq!(group.last_modified(), start + chrono::Duration::seconds(2));
    }
}
