//! Advisory-lock registry.
//!
//! Each key maps to a 64-bit `PostgreSQL` advisory lock taken with
//! `pg_try_advisory_xact_lock` inside a transaction the guard keeps open.
//! Dropping the guard drops the transaction, which rolls back and releases
//! the advisory lock, also when the holder's process dies and its
//! connection closes.
//!
//! Waiters in the same process queue on a local mutex first, so only one
//! task per instance polls the database for a given key.

use crate::store::store_error;
use message_connector_core::{BoxFuture, LockError, LockGuard, LockRegistry, RegistryLock};
use sqlx::{PgPool, Postgres, Transaction};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

/// Pause between attempts on a lock held by another instance.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Lock registry backed by `PostgreSQL` advisory locks.
///
/// Locks are exclusive across every connector instance sharing the database.
/// Each held lock pins one pooled connection until it is released.
pub struct PostgresLockRegistry {
    pool: PgPool,
    poll_interval: Duration,
    locks: Mutex<HashMap<String, Arc<AdvisoryLock>>>,
}

impl PostgresLockRegistry {
    /// Create a registry on `pool`.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            poll_interval: DEFAULT_POLL_INTERVAL,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Set the pause between attempts on a lock held elsewhere.
    #[must_use]
    pub const fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

impl LockRegistry for PostgresLockRegistry {
    fn obtain(&self, key: &str) -> Arc<dyn RegistryLock> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        let lock = locks.entry(key.to_string()).or_insert_with(|| {
            Arc::new(AdvisoryLock {
                key: key.to_string(),
                id: advisory_id(key),
                pool: self.pool.clone(),
                poll_interval: self.poll_interval,
                local: Arc::new(tokio::sync::Mutex::new(())),
            })
        });
        Arc::clone(lock) as Arc<dyn RegistryLock>
    }
}

/// 64-bit advisory lock id for a lock key.
///
/// UUID keys fold their two halves; other keys go through a name-based UUID first.
#[must_use]
pub fn advisory_id(key: &str) -> i64 {
    let uuid = Uuid::parse_str(key).unwrap_or_else(|_| Uuid::new_v5(&Uuid::NAMESPACE_OID, key.as_bytes()));
    let (high, low) = uuid.as_u64_pair();
    i64::from_ne_bytes((high ^ low).to_ne_bytes())
}

/// Open transaction holding an advisory lock.
///
/// Kept behind a mutex only so the guard is `Sync`; it is never contended.
struct AdvisoryHold {
    _transaction: Mutex<Transaction<'static, Postgres>>,
}

struct AdvisoryLock {
    key: String,
    id: i64,
    pool: PgPool,
    poll_interval: Duration,
    local: Arc<tokio::sync::Mutex<()>>,
}

impl AdvisoryLock {
    /// One attempt at the advisory lock; the transaction is rolled back on failure.
    async fn try_advisory(&self) -> Result<Option<AdvisoryHold>, LockError> {
        let mut transaction = self.pool.begin().await.map_err(|e| self.registry_error(e))?;
        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_xact_lock($1)")
            .bind(self.id)
            .fetch_one(&mut *transaction)
            .await
            .map_err(|e| self.registry_error(e))?;

        if acquired {
            Ok(Some(AdvisoryHold {
                _transaction: Mutex::new(transaction),
            }))
        } else {
            Ok(None)
        }
    }

    fn guard(&self, local: OwnedMutexGuard<()>, hold: AdvisoryHold) -> LockGuard {
        LockGuard::new(self.key.clone(), (local, hold))
    }

    fn registry_error(&self, error: sqlx::Error) -> LockError {
        LockError::Registry {
            key: self.key.clone(),
            reason: store_error(error).to_string(),
        }
    }
}

impl RegistryLock for AdvisoryLock {
    fn key(&self) -> &str {
        &self.key
    }

    fn lock(&self) -> BoxFuture<'_, Result<LockGuard, LockError>> {
        Box::pin(async move {
            let local = Arc::clone(&self.local).lock_owned().await;
            loop {
                if let Some(hold) = self.try_advisory().await? {
                    return Ok(self.guard(local, hold));
                }
                tracing::trace!(key = %self.key, "Advisory lock held by another instance, waiting");
                tokio::time::sleep(self.poll_interval).await;
            }
        })
    }

    fn try_lock(&self) -> BoxFuture<'_, Result<Option<LockGuard>, LockError>> {
        Box::pin(async move {
            let Ok(local) = Arc::clone(&self.local).try_lock_owned() else {
                return Ok(None);
            };
            Ok(self.try_advisory().await?.map(|hold| self.guard(local, hold)))
        })
    }
}
