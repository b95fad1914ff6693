//! Decoded BPMN message events and the commands the connector emits.
//!
//! Payloads travel as JSON with camelCase field names, matching what the
//! process engines publish.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Variables attached to a message event.
pub type Variables = Map<String, Value>;

/// BPMN message event type, carried in the event-type header.
///
/// Unknown values are preserved in [`MessageEventType::Other`] so that the
/// header round-trips unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageEventType {
    /// A start event subscribed to a message was deployed.
    StartMessageDeployed,
    /// An intermediate catch event is waiting for a message.
    MessageWaiting,
    /// A throw event sent a message.
    MessageSent,
    /// A waiting execution received its message.
    MessageReceived,
    /// A message subscription is no longer listening.
    MessageSubscriptionCancelled,
    /// Any other event type.
    Other(String),
}

impl MessageEventType {
    /// Wire representation of the event type.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::StartMessageDeployed => "START_MESSAGE_DEPLOYED",
            Self::MessageWaiting => "MESSAGE_WAITING",
            Self::MessageSent => "MESSAGE_SENT",
            Self::MessageReceived => "MESSAGE_RECEIVED",
            Self::MessageSubscriptionCancelled => "MESSAGE_SUBSCRIPTION_CANCELLED",
            Self::Other(other) => other,
        }
    }

    /// Parse the wire representation. Never fails; unknown values become `Other`.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        match raw {
            "START_MESSAGE_DEPLOYED" => Self::StartMessageDeployed,
            "MESSAGE_WAITING" => Self::MessageWaiting,
            "MESSAGE_SENT" => Self::MessageSent,
            "MESSAGE_RECEIVED" => Self::MessageReceived,
            "MESSAGE_SUBSCRIPTION_CANCELLED" => Self::MessageSubscriptionCancelled,
            other => Self::Other(other.to_string()),
        }
    }
}

impl From<String> for MessageEventType {
    fn from(raw: String) -> Self {
        Self::parse(&raw)
    }
}

impl From<MessageEventType> for String {
    fn from(event_type: MessageEventType) -> Self {
        event_type.as_str().to_string()
    }
}

impl From<MessageEventType> for Value {
    fn from(event_type: MessageEventType) -> Self {
        Value::String(event_type.into())
    }
}

impl fmt::Display for MessageEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded BPMN message event.
///
/// Immutable once constructed; the `with_*` methods are builders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEventPayload {
    /// Payload identity assigned by the producer.
    #[serde(default)]
    pub id: Option<String>,
    /// BPMN message name.
    pub name: String,
    /// BPMN correlation key.
    #[serde(default)]
    pub correlation_key: Option<String>,
    /// Business key of the process instance.
    #[serde(default)]
    pub business_key: Option<String>,
    /// Message variables.
    #[serde(default)]
    pub variables: Variables,
    /// Execution waiting for the message (set on `MESSAGE_WAITING`).
    #[serde(default)]
    pub execution_id: Option<String>,
}

impl MessageEventPayload {
    /// Create a payload for the message `name`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            correlation_key: None,
            business_key: None,
            variables: Variables::new(),
            execution_id: None,
        }
    }

    /// Set the payload id.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set the correlation key.
    #[must_use]
    pub fn with_correlation_key(mut self, key: impl Into<String>) -> Self {
        self.correlation_key = Some(key.into());
        self
    }

    /// Set the business key.
    #[must_use]
    pub fn with_business_key(mut self, key: impl Into<String>) -> Self {
        self.business_key = Some(key.into());
        self
    }

    /// Set the waiting execution.
    #[must_use]
    pub fn with_execution_id(mut self, execution_id: impl Into<String>) -> Self {
        self.execution_id = Some(execution_id.into());
        self
    }

    /// Add a variable.
    #[must_use]
    pub fn with_variable(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }
}

/// Kind of command carried by an output message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessagePayloadType {
    /// Deliver a message to a waiting execution.
    ReceiveMessagePayload,
    /// Start a process instance by message.
    StartMessagePayload,
}

impl MessagePayloadType {
    /// Wire representation, written to the payload-type header.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ReceiveMessagePayload => "ReceiveMessagePayload",
            Self::StartMessagePayload => "StartMessagePayload",
        }
    }

    /// Parse the wire representation.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "ReceiveMessagePayload" => Some(Self::ReceiveMessagePayload),
            "StartMessagePayload" => Some(Self::StartMessagePayload),
            _ => None,
        }
    }
}

/// Command delivering a sent message to a waiting execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiveMessagePayload {
    /// BPMN message name.
    pub name: String,
    /// BPMN correlation key.
    #[serde(default)]
    pub correlation_key: Option<String>,
    /// Business key of the sending process.
    #[serde(default)]
    pub business_key: Option<String>,
    /// Variables carried by the sent message.
    #[serde(default)]
    pub variables: Variables,
    /// Execution to resume.
    #[serde(default)]
    pub execution_id: Option<String>,
}

/// Command starting a process instance from a sent message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartMessagePayload {
    /// BPMN message name.
    pub name: String,
    /// BPMN correlation key.
    #[serde(default)]
    pub correlation_key: Option<String>,
    /// Business key for the new process instance.
    #[serde(default)]
    pub business_key: Option<String>,
    /// Variables carried by the sent message.
    #[serde(default)]
    pub variables: Variables,
}
