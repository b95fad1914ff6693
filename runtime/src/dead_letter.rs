//! Error channel backed by a bounded dead-letter queue.
//!
//! Messages the flow cannot process (no event type, no correlation, payload
//! that does not decode) are sent here instead of being dropped. The queue is
//! a bounded FIFO: when full, the oldest entry makes room for the newest.
//!
//! # Example
//!
//! ```rust
//! use message_connector_runtime::dead_letter::DeadLetterChannel;
//! use message_connector_core::{Message, MessageChannel};
//!
//! # async fn example() -> Result<(), message_connector_core::ChannelError> {
//! let dead_letters = DeadLetterChannel::new(100);
//! dead_letters.send(Message::builder(b"not json".to_vec()).build()).await?;
//!
//! assert_eq!(dead_letters.len(), 1);
//! for entry in dead_letters.drain() {
//!     println!("{}: {}", entry.failed_at, entry.reason);
//! }
//! # Ok(())
//! # }
//! ```

use crate::metrics::DeadLetterMetrics;
use chrono::{DateTime, Utc};
use message_connector_core::{
    BoxFuture, ChannelError, Clock, HeaderNames, Message, MessageChannel, SystemClock,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

/// A message that could not be processed.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    /// The message as it was received
    pub message: Message<Vec<u8>>,
    /// Why it failed, taken from the error header when present
    pub reason: String,
    /// When it reached the queue
    pub failed_at: DateTime<Utc>,
}

/// Bounded in-memory error channel.
///
/// Cloning shares the queue.
#[derive(Clone)]
pub struct DeadLetterChannel {
    queue: Arc<Mutex<VecDeque<DeadLetter>>>,
    max_size: usize,
    error_header: String,
    clock: Arc<dyn Clock>,
}

impl DeadLetterChannel {
    /// Default capacity.
    pub const DEFAULT_MAX_SIZE: usize = 1000;

    /// Create a queue holding at most `max_size` messages (at least one).
    #[must_use]
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: Arc::new(Mutex::new(VecDeque::new())),
            max_size: max_size.max(1),
            error_header: HeaderNames::default().error,
            clock: Arc::new(SystemClock),
        }
    }

    /// Read failure reasons from the error header named in `headers`.
    #[must_use]
    pub fn with_headers(mut self, headers: &HeaderNames) -> Self {
        self.error_header.clone_from(&headers.error);
        self
    }

    /// Stamp entries with `clock`.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Add a message, dropping the oldest entry when full.
    pub fn push(&self, message: Message<Vec<u8>>) {
        let reason = message
            .headers()
            .get_str(&self.error_header)
            .unwrap_or("discarded")
            .to_string();
        let entry = DeadLetter {
            message,
            reason,
            failed_at: self.clock.now(),
        };

        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        if queue.len() >= self.max_size {
            queue.pop_front();
            DeadLetterMetrics::record_dropped();
            tracing::warn!(max_size = self.max_size, "Dead-letter queue full, dropping oldest entry");
        }

        tracing::warn!(
            message_id = %entry.message.id(),
            reason = %entry.reason,
            queue_size = queue.len() + 1,
            "Message sent to dead-letter queue"
        );
        queue.push_back(entry);
        DeadLetterMetrics::record_size(queue.len());
    }

    /// Number of queued messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Check if the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Oldest queued entry.
    #[must_use]
    pub fn peek(&self) -> Option<DeadLetter> {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .front()
            .cloned()
    }

    /// Remove and return every entry, oldest first.
    pub fn drain(&self) -> Vec<DeadLetter> {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        let entries: Vec<_> = queue.drain(..).collect();
        DeadLetterMetrics::record_size(0);
        tracing::info!(count = entries.len(), "Drained dead-letter queue");
        entries
    }

    /// Maximum number of queued messages.
    #[must_use]
    pub const fn max_size(&self) -> usize {
        self.max_size
    }
}

impl Default for DeadLetterChannel {
    fn default() -> Self {
        Self::new(Self::DEFAULT_MAX_SIZE)
    }
}

impl MessageChannel for DeadLetterChannel {
    fn send(&self, message: Message<Vec<u8>>) -> BoxFuture<'_, Result<(), ChannelError>> {
        self.push(message);
        Box::pin(async { Ok(()) })
    }
}
