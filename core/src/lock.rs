//! Lock registry abstraction.
//!
//! A [`LockRegistry`] hands out one exclusive lock per key. Holding the lock
//! for a correlation key is what allows a task to read and mutate the message
//! group of that key.
//!
//! Locks are released by dropping the [`LockGuard`], so release happens on
//! every exit path: normal return, early return through `?`, and unwinding.
//!
//! Registries may be process-local (an async mutex per key) or distributed
//! (a lock service or a database row). Timeouts and interruption are layered
//! on top by the runtime's `LockTemplate`, so implementations only provide a
//! waiting and a non-waiting acquisition.

use crate::BoxFuture;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors acquiring a lock.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    /// The wait for the lock was interrupted
    #[error("Interrupted while waiting for lock '{key}'")]
    Interrupted {
        /// Lock key
        key: String,
    },

    /// The lock could not be acquired within the allowed time
    #[error("Lock '{key}' unavailable after {timeout:?}")]
    Unavailable {
        /// Lock key
        key: String,
        /// How long the caller waited
        timeout: Duration,
    },

    /// The registry itself failed (e.g. a remote lock service)
    #[error("Lock registry error for '{key}': {reason}")]
    Registry {
        /// Lock key
        key: String,
        /// The reason for failure
        reason: String,
    },
}

/// Proof of holding a lock. Dropping it releases the lock.
pub struct LockGuard {
    key: String,
    _held: Box<dyn Any + Send + Sync>,
}

impl LockGuard {
    /// Wrap whatever value keeps the underlying lock held.
    ///
    /// The lock must be released when `held` is dropped.
    #[must_use]
    pub fn new(key: impl Into<String>, held: impl Any + Send + Sync) -> Self {
        Self {
            key: key.into(),
            _held: Box::new(held),
        }
    }

    /// Key of the held lock.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard").field("key", &self.key).finish()
    }
}

/// An exclusive lock for one key.
pub trait RegistryLock: Send + Sync {
    /// Key this lock protects.
    fn key(&self) -> &str;

    /// Wait until the lock is acquired.
    ///
    /// Dropping the returned future before it completes abandons the wait
    /// without acquiring the lock.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Registry`] if the registry fails.
    fn lock(&self) -> BoxFuture<'_, Result<LockGuard, LockError>>;

    /// Acquire the lock only if it is free right now.
    ///
    /// Resolves to `None` without waiting for the holder when the lock is taken.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Registry`] if the registry fails.
    fn try_lock(&self) -> BoxFuture<'_, Result<Option<LockGuard>, LockError>>;
}

/// Source of per-key locks.
pub trait LockRegistry: Send + Sync {
    /// Obtain the lock for `key`.
    ///
    /// Every call with the same key must return a handle to the same lock.
    fn obtain(&self, key: &str) -> Arc<dyn RegistryLock>;
}
