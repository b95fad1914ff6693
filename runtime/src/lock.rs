//! Lock template: scoped critical sections per key.
//!
//! [`LockTemplate`] obtains the lock for a key from a [`LockRegistry`], runs an
//! async operation while holding it, and releases it on every exit path. It
//! offers the three acquisition modes the connector needs:
//!
//! - [`LockTemplate::lock_interruptibly`] waits as long as it takes, unless the
//!   template's [`InterruptSignal`] is raised
//! - [`LockTemplate::try_lock`] never waits
//! - [`LockTemplate::try_lock_for`] waits up to a timeout
//!
//! A skipped operation (lock not acquired in time) is `Ok(None)`, distinct
//! from a failure.
//!
//! # Example
//!
//! ```rust
//! use message_connector_runtime::lock::{DefaultLockRegistry, LockTemplate};
//! use message_connector_core::LockError;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), LockError> {
//! let template = LockTemplate::new(Arc::new(DefaultLockRegistry::new()));
//!
//! let value = template
//!     .lock_interruptibly("order-paid:42", || async { Ok::<_, LockError>(42) })
//!     .await?;
//! assert_eq!(value, 42);
//! # Ok(())
//! # }
//! ```

use crate::metrics::LockMetrics;
use message_connector_core::{BoxFuture, LockError, LockGuard, LockRegistry, RegistryLock};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Interrupt signal for tasks waiting on a lock.
///
/// Raising the signal fails every pending and future interruptible wait with
/// [`LockError::Interrupted`]. The signal stays raised until its owner calls
/// [`InterruptSignal::clear`]; a failed wait never lowers it.
#[derive(Debug, Clone)]
pub struct InterruptSignal {
    sender: Arc<watch::Sender<bool>>,
}

impl InterruptSignal {
    /// Create a lowered signal.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _receiver) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Raise the signal.
    pub fn interrupt(&self) {
        self.sender.send_replace(true);
    }

    /// Lower the signal.
    pub fn clear(&self) {
        self.sender.send_replace(false);
    }

    /// Check whether the signal is raised.
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        *self.sender.borrow()
    }

    /// Resolve once the signal is raised.
    async fn raised(&self) {
        let mut receiver = self.sender.subscribe();
        // The sender is owned by `self`, so the channel cannot close while we wait.
        let _ = receiver.wait_for(|interrupted| *interrupted).await;
    }
}

impl Default for InterruptSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs operations inside per-key critical sections.
///
/// Two operations on the same key never run concurrently; operations on
/// different keys never wait for each other (given a registry that hands out
/// one lock per key, such as [`DefaultLockRegistry`]).
///
/// Errors returned by the operation are propagated after the lock is released.
#[derive(Clone)]
pub struct LockTemplate {
    registry: Arc<dyn LockRegistry>,
    interrupt: InterruptSignal,
}

impl LockTemplate {
    /// Create a template with its own interrupt signal.
    #[must_use]
    pub fn new(registry: Arc<dyn LockRegistry>) -> Self {
        Self::with_interrupt(registry, InterruptSignal::new())
    }

    /// Create a template sharing an existing interrupt signal.
    #[must_use]
    pub const fn with_interrupt(registry: Arc<dyn LockRegistry>, interrupt: InterruptSignal) -> Self {
        Self { registry, interrupt }
    }

    /// The signal interrupting this template's waits.
    #[must_use]
    pub const fn interrupt_signal(&self) -> &InterruptSignal {
        &self.interrupt
    }

    /// Wait for the lock on `key`, then run `operation` while holding it.
    ///
    /// # Errors
    ///
    /// - [`LockError::Interrupted`] if the interrupt signal is raised before or
    ///   while waiting; `operation` does not run
    /// - [`LockError::Registry`] if the registry fails
    /// - any error returned by `operation`, after the lock is released
    pub async fn lock_interruptibly<F, Fut, T, E>(&self, key: &str, operation: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<LockError>,
    {
        let lock = self.registry.obtain(key);
        let guard = match self.acquire(lock.as_ref(), None).await? {
            Some(guard) => guard,
            // Unbounded waits only end by acquiring or failing.
            None => {
                return Err(LockError::Unavailable {
                    key: key.to_string(),
                    timeout: Duration::MAX,
                }
                .into());
            }
        };

        let result = operation().await;
        drop(guard);
        result
    }

    /// Run `operation` if the lock on `key` is free right now.
    ///
    /// Returns `Ok(None)` without running `operation` if the lock is held.
    ///
    /// # Errors
    ///
    /// - [`LockError::Registry`] if the registry fails
    /// - any error returned by `operation`, after the lock is released
    pub async fn try_lock<F, Fut, T, E>(&self, key: &str, operation: F) -> Result<Option<T>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<LockError>,
    {
        let lock = self.registry.obtain(key);
        let Some(guard) = lock.try_lock().await? else {
            LockMetrics::record_unavailable();
            tracing::debug!(key, "Lock held elsewhere, operation skipped");
            return Ok(None);
        };

        LockMetrics::record_acquired(Duration::ZERO);
        let result = operation().await;
        drop(guard);
        result.map(Some)
    }

    /// Wait up to `timeout` for the lock on `key`, then run `operation`.
    ///
    /// Returns `Ok(None)` without running `operation` if the lock was not
    /// acquired in time. A zero timeout never waits.
    ///
    /// # Errors
    ///
    /// - [`LockError::Interrupted`] if the interrupt signal is raised before or
    ///   while waiting
    /// - [`LockError::Registry`] if the registry fails
    /// - any error returned by `operation`, after the lock is released
    pub async fn try_lock_for<F, Fut, T, E>(
        &self,
        key: &str,
        timeout: Duration,
        operation: F,
    ) -> Result<Option<T>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<LockError>,
    {
        let lock = self.registry.obtain(key);
        let Some(guard) = self.acquire(lock.as_ref(), Some(timeout)).await? else {
            LockMetrics::record_unavailable();
            tracing::debug!(key, timeout_ms = timeout.as_millis(), "Lock not acquired in time, operation skipped");
            return Ok(None);
        };

        let result = operation().await;
        drop(guard);
        result.map(Some)
    }

    /// Acquire `lock`, waiting up to `timeout` (forever when `None`).
    async fn acquire(
        &self,
        lock: &dyn RegistryLock,
        timeout: Option<Duration>,
    ) -> Result<Option<LockGuard>, LockError> {
        let interrupted = || {
            LockMetrics::record_interrupted();
            tracing::warn!(key = lock.key(), "Interrupted while waiting for lock");
            LockError::Interrupted {
                key: lock.key().to_string(),
            }
        };

        if self.interrupt.is_interrupted() {
            return Err(interrupted());
        }

        let started = Instant::now();
        if let Some(guard) = lock.try_lock().await? {
            LockMetrics::record_acquired(started.elapsed());
            return Ok(Some(guard));
        }

        let wait = async {
            match timeout {
                Some(timeout) => tokio::time::timeout(timeout, lock.lock()).await.ok().transpose(),
                None => lock.lock().await.map(Some),
            }
        };

        let acquired = tokio::select! {
            biased;
            () = self.interrupt.raised() => return Err(interrupted()),
            acquired = wait => acquired?,
        };

        if acquired.is_some() {
            LockMetrics::record_acquired(started.elapsed());
            tracing::trace!(key = lock.key(), waited_ms = started.elapsed().as_millis(), "Lock acquired");
        }
        Ok(acquired)
    }
}

/// Process-local registry: one async mutex per key, created on first use.
///
/// Locks are never evicted; the table grows with the number of distinct keys
/// seen since start-up.
#[derive(Debug, Default)]
pub struct DefaultLockRegistry {
    locks: Mutex<HashMap<String, Arc<LocalLock>>>,
}

impl DefaultLockRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of locks created so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Check if no lock was created yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl LockRegistry for DefaultLockRegistry {
    fn obtain(&self, key: &str) -> Arc<dyn RegistryLock> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        let lock = locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(LocalLock::new(key)));
        Arc::clone(lock) as Arc<dyn RegistryLock>
    }
}

#[derive(Debug)]
struct LocalLock {
    key: String,
    mutex: Arc<tokio::sync::Mutex<()>>,
}

impl LocalLock {
    fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            mutex: Arc::new(tokio::sync::Mutex::new(())),
        }
    }
}

impl RegistryLock for LocalLock {
    fn key(&self) -> &str {
        &self.key
    }

    fn lock(&self) -> BoxFuture<'_, Result<LockGuard, LockError>> {
        Box::pin(async move {
            let held = Arc::clone(&self.mutex).lock_owned().await;
            Ok(LockGuard::new(self.key.clone(), held))
        })
    }

    fn try_lock(&self) -> BoxFuture<'_, Result<Option<LockGuard>, LockError>> {
        let acquired = Arc::clone(&self.mutex)
            .try_lock_owned()
            .ok()
            .map(|held| LockGuard::new(self.key.clone(), held));
        Box::pin(async move { Ok(acquired) })
    }
}
