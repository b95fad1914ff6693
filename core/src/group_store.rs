//! Message group store: pending messages per correlation key.
//!
//! A [`MessageGroup`] accumulates the decoded messages of one conversation
//! until the aggregator releases them or the subscription-cancelled advice
//! discards them.
//!
//! # Ownership
//!
//! Groups are owned by the store. Callers get snapshots; every mutation goes
//! through the store and must happen while holding the lock for the group's
//! correlation key. The store itself does not lock per key.
//!
//! # Lifecycle
//!
//! - created by the first [`MessageGroupStore::add_message_to_group`] for a key
//! - appended to by later messages
//! - drained by [`MessageGroupStore::remove_messages_from_group`]
//! - deleted once empty

use crate::BoxFuture;
use crate::correlation::CorrelationKey;
use crate::handler::EventMessage;
use crate::payload::MessageEventType;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

/// Errors from message group and metadata stores.
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    /// The backing storage could not be reached
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// The stored data could not be read back
    #[error("Corrupted group '{key}': {reason}")]
    Corrupted {
        /// Group key
        key: String,
        /// What went wrong
        reason: String,
    },

    /// Any other failure
    #[error("Store error: {0}")]
    Other(String),
}

/// Snapshot of the messages pending for one correlation key, oldest first.
#[derive(Debug, Clone)]
pub struct MessageGroup {
    key: CorrelationKey,
    messages: Vec<EventMessage>,
    created_at: DateTime<Utc>,
    last_modified: DateTime<Utc>,
}

impl MessageGroup {
    /// Create a group snapshot.
    #[must_use]
    pub const fn new(
        key: CorrelationKey,
        messages: Vec<EventMessage>,
        created_at: DateTime<Utc>,
        last_modified: DateTime<Utc>,
    ) -> Self {
        Self {
            key,
            messages,
            created_at,
            last_modified,
        }
    }

    /// Correlation key of the group.
    #[must_use]
    pub const fn key(&self) -> &CorrelationKey {
        &self.key
    }

    /// Messages in arrival order.
    #[must_use]
    pub fn messages(&self) -> &[EventMessage] {
        &self.messages
    }

    /// Consume the snapshot, returning its messages.
    #[must_use]
    pub fn into_messages(self) -> Vec<EventMessage> {
        self.messages
    }

    /// When the first message was added.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// When the group last changed.
    #[must_use]
    pub const fn last_modified(&self) -> DateTime<Utc> {
        self.last_modified
    }

    /// Number of messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Check if the group holds no messages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Check if a message with this id is already in the group.
    #[must_use]
    pub fn contains(&self, id: Uuid) -> bool {
        self.messages.iter().any(|message| message.id() == id)
    }

    /// Oldest message whose event-type header (named `header`) equals `event_type`.
    #[must_use]
    pub fn first_of_type(&self, header: &str, event_type: &MessageEventType) -> Option<&EventMessage> {
        self.messages
            .iter()
            .find(|message| message.headers().get_str(header) == Some(event_type.as_str()))
    }
}

/// Storage for message groups.
///
/// # Dyn Compatibility
///
/// Uses boxed futures so the store can be shared as `Arc<dyn MessageGroupStore>`.
pub trait MessageGroupStore: Send + Sync {
    /// Get a snapshot of the group for `key`, if any.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the storage cannot be read.
    fn message_group<'a>(
        &'a self,
        key: &'a CorrelationKey,
    ) -> BoxFuture<'a, Result<Option<MessageGroup>, StoreError>>;

    /// Append a message to the group for `key`, creating the group if needed.
    ///
    /// Returns the group after the append.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the storage cannot be written.
    fn add_message_to_group<'a>(
        &'a self,
        key: &'a CorrelationKey,
        message: EventMessage,
    ) -> BoxFuture<'a, Result<MessageGroup, StoreError>>;

    /// Remove the messages with the given ids from the group for `key`.
    ///
    /// Unknown ids are ignored. The group is deleted once it is empty.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the storage cannot be written.
    fn remove_messages_from_group<'a>(
        &'a self,
        key: &'a CorrelationKey,
        ids: &'a [Uuid],
    ) -> BoxFuture<'a, Result<(), StoreError>>;

    /// Delete the group for `key` and all its messages.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the storage cannot be written.
    fn remove_message_group<'a>(&'a self, key: &'a CorrelationKey) -> BoxFuture<'a, Result<(), StoreError>>;

    /// Number of groups currently stored.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the storage cannot be read.
    fn message_group_count(&self) -> BoxFuture<'_, Result<usize, StoreError>>;
}
