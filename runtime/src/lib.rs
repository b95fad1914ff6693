//! # Message Connector Runtime
//!
//! Runtime implementation of the BPMN message connector.
//!
//! This crate assembles the traits of `message-connector-core` into a working
//! pipeline and provides in-process implementations of its collaborators.
//!
//! ## Core Components
//!
//! - **Flow**: filter, enrich, decode and hand off, see [`flow`]
//! - **Lock template**: per-key critical sections with timeouts and
//!   interruption, see [`lock`]
//! - **Aggregator**: joins sent messages with their subscribers under the
//!   correlation lock, see [`aggregator`]
//! - **Advices**: idempotent receiver ([`idempotent`]) and
//!   subscription-cancelled reconciliation ([`advice`])
//! - **Channels**: dead-letter error channel ([`dead_letter`]) and the
//!   engine-side command consumer ([`dispatch`])
//!
//! ## Example
//!
//! ```rust
//! use message_connector_runtime::config::ConnectorConfig;
//! use message_connector_runtime::dead_letter::DeadLetterChannel;
//! use message_connector_runtime::flow::MessageConnectorFlow;
//! use message_connector_core::{HeaderNames, Message, MessageEventPayload};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ConnectorConfig::default();
//! let commands = Arc::new(DeadLetterChannel::new(100)); // stands in for a broker topic
//! let flow = MessageConnectorFlow::builder(commands.clone()).config(&config).build();
//!
//! let headers = HeaderNames::default();
//! let sent = MessageEventPayload::new("order-paid").with_correlation_key("42");
//! let message = headers
//!     .append_event_headers(Message::builder(serde_json::to_vec(&sent)?), &sent)
//!     .header(&headers.event_type, "MESSAGE_SENT")
//!     .build();
//!
//! flow.send(message).await?;
//! assert!(commands.is_empty()); // held until a subscriber shows up
//! # Ok(())
//! # }
//! ```

pub mod advice;
pub mod aggregator;
pub mod config;
pub mod dead_letter;
pub mod dispatch;
pub mod flow;
pub mod idempotent;
pub mod lock;
pub mod metrics;
pub mod retry;
pub mod store;

pub use advice::{MessageListPredicate, SubscriptionCancelledHandlerAdvice};
pub use aggregator::{
    MessageConnectorAggregator, MessageConnectorGroupProcessor, MessageConnectorReleaseStrategy,
    MessageGroupProcessor, ReleaseStrategy, ReleasedOutput,
};
pub use config::{ConfigError, ConnectorConfig};
pub use dead_letter::{DeadLetter, DeadLetterChannel};
pub use dispatch::EngineTriggerChannel;
pub use flow::{FlowError, FlowOutcome, MessageConnectorFlow, MessageConnectorFlowBuilder};
pub use idempotent::{IdempotentReceiverAdvice, InMemoryMetadataStore};
pub use lock::{DefaultLockRegistry, InterruptSignal, LockTemplate};
pub use retry::RetryPolicy;
pub use store::InMemoryMessageGroupStore;
