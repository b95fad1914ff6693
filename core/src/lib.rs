//! # Message Connector Core
//!
//! Core traits and types for the BPMN message connector.
//!
//! The connector joins asynchronous BPMN message events published by process
//! engines (a message subscription is deployed or waiting, a message is sent,
//! a subscription is cancelled) and dispatches the joined result back to the
//! engine that is waiting for it.
//!
//! This crate holds the vocabulary shared by every other crate:
//!
//! - **Message**: header map plus payload, see [`message`]
//! - **Payloads**: decoded BPMN message events and output commands, see [`payload`]
//! - **Correlation**: how a message maps to its conversation, see [`correlation`]
//! - **Collaborators**: traits for the lock registry, message group store,
//!   metadata store, output channels, and the process engine
//! - **Handlers**: the handler / advice chain that wraps aggregation, see [`handler`]
//!
//! ## Architecture
//!
//! ```text
//! inbound ─► filter ─► enrich ─► decode ─► advice chain ─► aggregator ─► channel
//!              │         │         │                           │
//!              └─────────┴─────────┴──► error channel          └─► group store
//!                                                                  (under key lock)
//! ```
//!
//! Implementations live in `message-connector-runtime` (in-memory stores,
//! lock template, flow) and `message-connector-redpanda` (transport).

use std::future::Future;
use std::pin::Pin;

pub mod channel;
pub mod correlation;
pub mod engine;
pub mod environment;
pub mod group_store;
pub mod handler;
pub mod headers;
pub mod lock;
pub mod message;
pub mod metadata;
pub mod payload;

/// Boxed, sendable future returned by the dyn-compatible collaborator traits.
///
/// Traits in this crate return `BoxFuture` instead of using `async fn` so they
/// can be held as `Arc<dyn Trait>` by the runtime.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

// Re-export commonly used types
pub use channel::{ChannelError, MessageChannel};
pub use correlation::{CorrelationError, CorrelationKey, CorrelationStrategy};
pub use engine::{EngineError, ProcessEngine};
pub use environment::{Clock, SystemClock};
pub use group_store::{MessageGroup, MessageGroupStore, StoreError};
pub use handler::{EventMessage, HandleMessageAdvice, HandlerChain, HandlerError, MessageHandler, Next};
pub use headers::HeaderNames;
pub use lock::{LockError, LockGuard, LockRegistry, RegistryLock};
pub use message::{Message, MessageBuilder, MessageHeaders};
pub use metadata::MetadataStore;
pub use payload::{MessageEventPayload, MessageEventType, Variables};
