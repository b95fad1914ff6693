//! Correlation: mapping a message to the conversation it belongs to.
//!
//! A [`CorrelationKey`] identifies one logical conversation, for example every
//! event about the message `order-paid` with correlation key `order-42`. It is
//! both the identity of the message group in the store and the identity of the
//! lock that serialises work on that group.
//!
//! Derivation is a pure function of the message headers, so a redelivered
//! message always lands in the same group.

use crate::headers::HeaderNames;
use crate::message::MessageHeaders;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Errors deriving a correlation key.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CorrelationError {
    /// A header needed for correlation is missing or not a string
    #[error("Missing correlation header '{0}'")]
    MissingHeader(String),
}

/// Identity of a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationKey(String);

impl CorrelationKey {
    /// Wrap a raw key.
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Raw key.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Key used to obtain the lock for this conversation.
    ///
    /// A key that already is a UUID is used as-is; any other key is mapped to a
    /// name-based (v5) UUID, so lock keys have a fixed shape whatever the
    /// message names look like.
    #[must_use]
    pub fn lock_key(&self) -> String {
        Uuid::parse_str(&self.0)
            .unwrap_or_else(|_| Uuid::new_v5(&Uuid::NAMESPACE_OID, self.0.as_bytes()))
            .to_string()
    }
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CorrelationKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

/// Strategy deriving the correlation key of a message from its headers.
pub trait CorrelationStrategy: Send + Sync {
    /// Derive the correlation key.
    ///
    /// # Errors
    ///
    /// Returns [`CorrelationError::MissingHeader`] when the headers do not
    /// identify a conversation.
    fn correlation_key(&self, headers: &MessageHeaders) -> Result<CorrelationKey, CorrelationError>;
}

/// Derives the key from the BPMN message name and correlation key headers.
///
/// The key is `"{name}:{correlationKey}"`, or just `"{name}"` for messages
/// without a correlation key. Used by the enrichment stage.
#[derive(Debug, Clone, Default)]
pub struct MessageEventCorrelationStrategy {
    headers: HeaderNames,
}

impl MessageEventCorrelationStrategy {
    /// Create a strategy reading the given header names.
    #[must_use]
    pub const fn new(headers: HeaderNames) -> Self {
        Self { headers }
    }
}

impl CorrelationStrategy for MessageEventCorrelationStrategy {
    fn correlation_key(&self, headers: &MessageHeaders) -> Result<CorrelationKey, CorrelationError> {
        let name = headers
            .get_str(&self.headers.message_name)
            .ok_or_else(|| CorrelationError::MissingHeader(self.headers.message_name.clone()))?;

        Ok(match headers.get_str(&self.headers.correlation_key) {
            Some(key) => CorrelationKey::new(format!("{name}:{key}")),
            None => CorrelationKey::new(name),
        })
    }
}

/// Reads the key from the correlation-id header written during enrichment.
#[derive(Debug, Clone, Default)]
pub struct HeaderCorrelationStrategy {
    headers: HeaderNames,
}

impl HeaderCorrelationStrategy {
    /// Create a strategy reading the given header names.
    #[must_use]
    pub const fn new(headers: HeaderNames) -> Self {
        Self { headers }
    }
}

impl CorrelationStrategy for HeaderCorrelationStrategy {
    fn correlation_key(&self, headers: &MessageHeaders) -> Result<CorrelationKey, CorrelationError> {
        headers
            .get_str(&self.headers.correlation_id)
            .map(CorrelationKey::from)
            .ok_or_else(|| CorrelationError::MissingHeader(self.headers.correlation_id.clone()))
    }
}
