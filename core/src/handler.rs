//! Message handlers and the advice chain around them.
//!
//! The core handler (the aggregator) is wrapped by an ordered list of
//! [`HandleMessageAdvice`]s. Each advice receives the message and a [`Next`]
//! continuation; it may act before and after calling [`Next::proceed`], or not
//! call it at all to short-circuit the chain.
//!
//! ```text
//! HandlerChain::handle(message)
//!   └─► advice[0].invoke(message, next)
//!         └─► next.proceed(message) ─► advice[1].invoke(message, next)
//!                                        └─► next.proceed(message) ─► handler.handle(message)
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! let chain = HandlerChain::new(Arc::new(aggregator))
//!     .with_advice(Arc::new(idempotent_receiver))
//!     .with_advice(Arc::new(subscription_cancelled));
//!
//! chain.handle(message).await?;
//! ```

use crate::BoxFuture;
use crate::channel::ChannelError;
use crate::correlation::CorrelationError;
use crate::group_store::StoreError;
use crate::lock::LockError;
use crate::message::Message;
use crate::payload::MessageEventPayload;
use std::sync::Arc;
use thiserror::Error;

/// A decoded message event.
pub type EventMessage = Message<MessageEventPayload>;

/// Errors raised while handling a decoded message.
#[derive(Error, Debug)]
pub enum HandlerError {
    /// Lock acquisition failed or was interrupted
    #[error(transparent)]
    Lock(#[from] LockError),

    /// The message group store failed
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The message could not be correlated
    #[error(transparent)]
    Correlation(#[from] CorrelationError),

    /// The released output could not be dispatched; the group was left intact
    #[error("Dispatch failed: {0}")]
    Dispatch(#[source] ChannelError),

    /// The released output could not be serialised
    #[error("Failed to encode output: {0}")]
    Encode(String),
}

/// The innermost handler of a chain.
pub trait MessageHandler: Send + Sync {
    /// Handle a decoded message.
    ///
    /// # Errors
    ///
    /// Returns a [`HandlerError`] if the message could not be handled.
    fn handle(&self, message: EventMessage) -> BoxFuture<'_, Result<(), HandlerError>>;
}

/// Interceptor wrapped around a [`MessageHandler`].
pub trait HandleMessageAdvice: Send + Sync {
    /// Intercept `message`; call `next.proceed(message)` to continue the chain.
    ///
    /// # Errors
    ///
    /// Returns a [`HandlerError`] raised by the advice or by the rest of the chain.
    fn invoke<'a>(&'a self, message: EventMessage, next: Next<'a>)
    -> BoxFuture<'a, Result<(), HandlerError>>;
}

/// Continuation handed to an advice: the remaining advices plus the handler.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    advices: &'a [Arc<dyn HandleMessageAdvice>],
    handler: &'a dyn MessageHandler,
}

impl<'a> Next<'a> {
    /// Continue with the next advice, or the handler when none is left.
    pub fn proceed(self, message: EventMessage) -> BoxFuture<'a, Result<(), HandlerError>> {
        match self.advices.split_first() {
            Some((advice, rest)) => advice.invoke(
                message,
                Next {
                    advices: rest,
                    handler: self.handler,
                },
            ),
            None => self.handler.handle(message),
        }
    }
}

/// A handler wrapped by an ordered list of advices, outermost first.
#[derive(Clone)]
pub struct HandlerChain {
    advices: Vec<Arc<dyn HandleMessageAdvice>>,
    handler: Arc<dyn MessageHandler>,
}

impl HandlerChain {
    /// Create a chain around `handler` with no advice.
    #[must_use]
    pub fn new(handler: Arc<dyn MessageHandler>) -> Self {
        Self {
            advices: Vec::new(),
            handler,
        }
    }

    /// Add an advice inside the ones already added.
    #[must_use]
    pub fn with_advice(mut self, advice: Arc<dyn HandleMessageAdvice>) -> Self {
        self.advices.push(advice);
        self
    }

    /// Number of advices in the chain.
    #[must_use]
    pub fn advice_count(&self) -> usize {
        self.advices.len()
    }
}

impl MessageHandler for HandlerChain {
    fn handle(&self, message: EventMessage) -> BoxFuture<'_, Result<(), HandlerError>> {
        Next {
            advices: &self.advices,
            handler: self.handler.as_ref(),
        }
        .proceed(message)
    }
}
