//! Message envelope: a header map plus a payload.
//!
//! Messages are transport-agnostic. The inbound side of the connector works on
//! `Message<Vec<u8>>` (raw JSON bytes as delivered by the broker); once decoded,
//! messages become `Message<MessageEventPayload>`.
//!
//! Every message carries an identity. Transports propagate it in the `id`
//! header so that a redelivered message keeps the id of its first delivery.
//!
//! # Example
//!
//! ```
//! use message_connector_core::message::Message;
//!
//! let message = Message::builder(b"{}".to_vec())
//!     .header("eventType", "MESSAGE_SENT")
//!     .header("messageEventName", "order-paid")
//!     .build();
//!
//! assert_eq!(message.headers().get_str("eventType"), Some("MESSAGE_SENT"));
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// Message headers.
///
/// A string-keyed map of JSON values. Lookups do not depend on insertion order.
/// A header whose value is JSON `null` is treated as absent by [`MessageHeaders::contains`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageHeaders(HashMap<String, Value>);

impl MessageHeaders {
    /// Name of the header carrying the message identity on the wire.
    pub const ID: &'static str = "id";

    /// Create an empty header map.
    #[must_use]
    pub fn new() -> Self {
        Self(HashMap::new())
    }

    /// Get a header value.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    /// Get a header value if it is a JSON string.
    #[must_use]
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.0.get(name).and_then(Value::as_str)
    }

    /// Check that a header is present and not `null`.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.0.get(name).is_some_and(|value| !value.is_null())
    }

    /// Insert a header, returning the previous value.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(name.into(), value.into())
    }

    /// Remove a header, returning its value.
    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.0.remove(name)
    }

    /// Iterate over all headers.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Number of headers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if there are no headers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, Value)> for MessageHeaders {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// A message: identity, headers and payload.
#[derive(Clone, Debug, PartialEq)]
pub struct Message<P> {
    id: Uuid,
    headers: MessageHeaders,
    payload: P,
}

impl<P> Message<P> {
    /// Start building a message around `payload`.
    #[must_use]
    pub fn builder(payload: P) -> MessageBuilder<P> {
        MessageBuilder::new(payload)
    }

    /// The message identity.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// The message headers.
    #[must_use]
    pub const fn headers(&self) -> &MessageHeaders {
        &self.headers
    }

    /// The message payload.
    #[must_use]
    pub const fn payload(&self) -> &P {
        &self.payload
    }

    /// Consume the message, returning its payload.
    #[must_use]
    pub fn into_payload(self) -> P {
        self.payload
    }

    /// Return a copy of this message with an extra header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Replace the payload, keeping identity and headers.
    #[must_use]
    pub fn map_payload<Q>(self, f: impl FnOnce(P) -> Q) -> Message<Q> {
        Message {
            id: self.id,
            headers: self.headers,
            payload: f(self.payload),
        }
    }

    /// Fallibly replace the payload, keeping identity and headers.
    ///
    /// # Errors
    ///
    /// Returns whatever error `f` returns.
    pub fn try_map_payload<Q, E>(self, f: impl FnOnce(&P) -> Result<Q, E>) -> Result<Message<Q>, E> {
        let payload = f(&self.payload)?;
        Ok(Message {
            id: self.id,
            headers: self.headers,
            payload,
        })
    }
}

/// Builder for [`Message`].
///
/// If no id is set explicitly, the builder takes it from a valid `id` header
/// and otherwise generates a random one.
#[derive(Debug)]
pub struct MessageBuilder<P> {
    id: Option<Uuid>,
    headers: MessageHeaders,
    payload: P,
}

impl<P> MessageBuilder<P> {
    fn new(payload: P) -> Self {
        Self {
            id: None,
            headers: MessageHeaders::new(),
            payload,
        }
    }

    /// Set the message id.
    #[must_use]
    pub const fn id(mut self, id: Uuid) -> Self {
        self.id = Some(id);
        self
    }

    /// Set a header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set a header only when `value` is `Some`.
    #[must_use]
    pub fn header_if_present(self, name: impl Into<String>, value: Option<impl Into<Value>>) -> Self {
        match value {
            Some(value) => self.header(name, value),
            None => self,
        }
    }

    /// Copy all headers from an existing map, overwriting duplicates.
    #[must_use]
    pub fn copy_headers(mut self, headers: &MessageHeaders) -> Self {
        for (name, value) in headers.iter() {
            self.headers.insert(name.clone(), value.clone());
        }
        self
    }

    /// Build the message.
    #[must_use]
    pub fn build(mut self) -> Message<P> {
        let id = self
            .id
            .or_else(|| {
                self.headers
                    .get_str(MessageHeaders::ID)
                    .and_then(|raw| Uuid::parse_str(raw).ok())
            })
            .unwrap_or_else(Uuid::new_v4);
        // The id lives in its own field; keep the header in sync for transports.
        self.headers.insert(MessageHeaders::ID, id.to_string());

        Message {
            id,
            headers: self.headers,
            payload: self.payload,
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use serde_json::json;

    #[test]
    fn builder_generates_id_when_absent() {
        let first = Message::builder(()).build();
        let second = Message::builder(()).build();
        assert_ne!(first.id(), second.id());
        assert_eq!(
            first.headers().get_str(MessageHeaders::ID),
            Some(first.id().to_string().as_str())
        );
    }

    #[test]
    fn builder_reuses_id_header() {
        let id = Uuid::new_v4();
        let message = Message::builder(()).header("id", id.to_string()).build();
        assert_eq!(message.id(), id);
    }

    #[test]
    fn null_header_is_not_contained() {
        let message = Message::builder(())
            .header("eventType", Value::Null)
            .header("other", json!(1))
            .build();
        assert!(!message.headers().contains("eventType"));
        assert!(message.headers().contains("other"));
        assert!(!message.headers().contains("missing"));
    }

    #[test]
    fn map_payload_keeps_identity() {
        let message = Message::builder(b"42".to_vec()).header("k", "v").build();
        let id = message.id();
        let mapped = message
            .try_map_payload(|bytes| serde_json::from_slice::<u32>(bytes))
            .unwrap();
        assert_eq!(mapped.id(), id);
        assert_eq!(*mapped.payload(), 42);
        assert_eq!(mapped.headers().get_str("k"), Some("v"));
    }
}
