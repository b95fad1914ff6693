//! Message channel abstraction for everything the connector sends.
//!
//! The connector sends to two kinds of channel:
//!
//! - the **output channel**, receiving the commands produced when a message
//!   group is released (`ReceiveMessagePayload`, `StartMessagePayload`)
//! - the **error channel**, receiving messages that were discarded by the
//!   filter or could not be correlated or decoded
//!
//! # Delivery Semantics
//!
//! - **At-least-once**: a send that returns `Ok` has been accepted by the
//!   channel; a send that fails may still have been delivered
//! - **Idempotency**: receivers must tolerate duplicates
//! - **Acknowledged removal**: the aggregator only removes released messages
//!   from their group after the output channel acknowledged the send
//!
//! # Implementations
//!
//! - `DeadLetterChannel` (runtime) - bounded in-memory error channel
//! - `EngineTriggerChannel` (runtime) - resumes executions on a process engine
//! - `RedpandaMessageChannel` (redpanda) - Kafka-compatible transport
//!
//! # Example
//!
//! ```rust,ignore
//! use message_connector_core::{Message, MessageChannel};
//!
//! async fn forward(channel: &dyn MessageChannel) -> Result<(), ChannelError> {
//!     let message = Message::builder(br#"{"name":"order-paid"}"#.to_vec())
//!         .header("destination", "billing")
//!         .build();
//!     channel.send(message).await
//! }
//! ```

use crate::BoxFuture;
use crate::message::Message;
use thiserror::Error;

/// Errors that can occur sending to or receiving from a channel.
#[derive(Error, Debug, Clone)]
pub enum ChannelError {
    /// Failed to connect to the transport
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to send a message
    #[error("Send failed for destination '{destination}': {reason}")]
    SendFailed {
        /// The destination that failed
        destination: String,
        /// The reason for failure
        reason: String,
    },

    /// The receiver accepted the message but refused to act on it
    #[error("Message rejected: {0}")]
    Rejected(String),

    /// Failed to encode or decode a message
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// Failed to subscribe to a source
    #[error("Subscription failed for {sources:?}: {reason}")]
    SubscriptionFailed {
        /// The sources that failed to subscribe
        sources: Vec<String>,
        /// The reason for failure
        reason: String,
    },

    /// Network or transport error
    #[error("Transport error: {0}")]
    TransportError(String),
}

/// A destination messages can be sent to.
///
/// Payloads are raw bytes; senders serialise before sending and receivers
/// decode by looking at the headers.
///
/// # Dyn Compatibility
///
/// Returns an explicit boxed future so that channels can be shared as
/// `Arc<dyn MessageChannel>` between the flow and the aggregator.
pub trait MessageChannel: Send + Sync {
    /// Send a message.
    ///
    /// # Errors
    ///
    /// Returns a [`ChannelError`] if the channel did not accept the message.
    fn send(&self, message: Message<Vec<u8>>) -> BoxFuture<'_, Result<(), ChannelError>>;
}
