//! Message groups in `PostgreSQL`.
//!
//! One row per group in `message_groups` and one row per pending message in
//! `message_group_messages`. Messages keep their arrival order through an
//! identity column, and deleting a group cascades to its messages.

use chrono::{DateTime, Utc};
use message_connector_core::{
    BoxFuture, Clock, CorrelationKey, EventMessage, Message, MessageEventPayload, MessageGroup, MessageGroupStore,
    MessageHeaders, StoreError, SystemClock,
};
use message_connector_runtime::metrics::AggregatorMetrics;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgExecutor, PgPool, Row};
use std::sync::Arc;
use uuid::Uuid;

const SCHEMA: [&str; 3] = [
    r"
    CREATE TABLE IF NOT EXISTS message_groups (
        group_key TEXT PRIMARY KEY,
        created_at TIMESTAMPTZ NOT NULL,
        last_modified TIMESTAMPTZ NOT NULL
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS message_group_messages (
        position BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
        group_key TEXT NOT NULL REFERENCES message_groups (group_key) ON DELETE CASCADE,
        message_id UUID NOT NULL,
        headers JSONB NOT NULL,
        payload JSONB NOT NULL
    )
    ",
    "CREATE INDEX IF NOT EXISTS idx_message_group_messages_key ON message_group_messages (group_key, position)",
];

/// Message groups persisted in `PostgreSQL`.
///
/// Like every group store it does not lock per key: callers mutate a group
/// only while holding its correlation lock, which for multi-instance
/// deployments means a [`crate::PostgresLockRegistry`] on the same database.
///
/// Cloning shares the connection pool.
#[derive(Clone)]
pub struct PostgresMessageGroupStore {
    pool: PgPool,
    clock: Arc<dyn Clock>,
}

impl PostgresMessageGroupStore {
    /// Create a store on an existing pool, stamped by the system clock.
    #[must_use]
    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            clock: Arc::new(SystemClock),
        }
    }

    /// Stamp group times with `clock` instead of the system clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Create the tables if they do not exist yet.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if a statement fails.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(store_error)?;
        }
        tracing::debug!("Message group schema ready");
        Ok(())
    }

    async fn load<'e>(executor: impl PgExecutor<'e>, key: &CorrelationKey) -> Result<Option<MessageGroup>, StoreError> {
        let rows = sqlx::query(
            r"
            SELECT g.created_at, g.last_modified, m.message_id, m.headers, m.payload
            FROM message_groups g
            LEFT JOIN message_group_messages m ON m.group_key = g.group_key
            WHERE g.group_key = $1
            ORDER BY m.position ASC
            ",
        )
        .bind(key.as_str())
        .fetch_all(executor)
        .await
        .map_err(store_error)?;

        let Some(first) = rows.first() else {
            return Ok(None);
        };
        let created_at: DateTime<Utc> = first.try_get("created_at").map_err(|e| corrupted(key, &e))?;
        let last_modified: DateTime<Utc> = first.try_get("last_modified").map_err(|e| corrupted(key, &e))?;

        let mut messages = Vec::with_capacity(rows.len());
        for row in &rows {
            if let Some(message) = row_to_message(row).map_err(|e| corrupted(key, &e))? {
                messages.push(message);
            }
        }

        Ok(Some(MessageGroup::new(key.clone(), messages, created_at, last_modified)))
    }

    async fn publish_count(&self) {
        if let Ok(count) = self.count().await {
            AggregatorMetrics::record_group_count(count);
        }
    }

    async fn count(&self) -> Result<usize, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM message_groups")
            .fetch_one(&self.pool)
            .await
            .map_err(store_error)?;
        usize::try_from(count).map_err(|e| StoreError::Other(e.to_string()))
    }
}

impl MessageGroupStore for PostgresMessageGroupStore {
    fn message_group<'a>(
        &'a self,
        key: &'a CorrelationKey,
    ) -> BoxFuture<'a, Result<Option<MessageGroup>, StoreError>> {
        Box::pin(async move { Self::load(&self.pool, key).await })
    }

    fn add_message_to_group<'a>(
        &'a self,
        key: &'a CorrelationKey,
        message: EventMessage,
    ) -> BoxFuture<'a, Result<MessageGroup, StoreError>> {
        Box::pin(async move {
            let now = self.clock.now();
            let mut tx = self.pool.begin().await.map_err(store_error)?;

            sqlx::query(
                r"
                INSERT INTO message_groups (group_key, created_at, last_modified)
                VALUES ($1, $2, $2)
                ON CONFLICT (group_key) DO UPDATE SET last_modified = EXCLUDED.last_modified
                ",
            )
            .bind(key.as_str())
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(store_error)?;

            sqlx::query(
                r"
                INSERT INTO message_group_messages (group_key, message_id, headers, payload)
                VALUES ($1, $2, $3, $4)
                ",
            )
            .bind(key.as_str())
            .bind(message.id())
            .bind(Json(message.headers()))
            .bind(Json(message.payload()))
            .execute(&mut *tx)
            .await
            .map_err(store_error)?;

            let group = Self::load(&mut *tx, key).await?.ok_or_else(|| StoreError::Corrupted {
                key: key.to_string(),
                reason: "group vanished inside its own transaction".to_string(),
            })?;
            tx.commit().await.map_err(store_error)?;

            tracing::trace!(group = %key, message_id = %message.id(), size = group.len(), "Message stored");
            self.publish_count().await;
            Ok(group)
        })
    }

    fn remove_messages_from_group<'a>(
        &'a self,
        key: &'a CorrelationKey,
        ids: &'a [Uuid],
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            let now = self.clock.now();
            let mut tx = self.pool.begin().await.map_err(store_error)?;

            let removed = sqlx::query("DELETE FROM message_group_messages WHERE group_key = $1 AND message_id = ANY($2)")
                .bind(key.as_str())
                .bind(ids)
                .execute(&mut *tx)
                .await
                .map_err(store_error)?
                .rows_affected();

            if removed > 0 {
                sqlx::query("UPDATE message_groups SET last_modified = $2 WHERE group_key = $1")
                    .bind(key.as_str())
                    .bind(now)
                    .execute(&mut *tx)
                    .await
                    .map_err(store_error)?;
            }

            let deleted = sqlx::query(
                r"
                DELETE FROM message_groups g
                WHERE g.group_key = $1
                  AND NOT EXISTS (SELECT 1 FROM message_group_messages m WHERE m.group_key = g.group_key)
                ",
            )
            .bind(key.as_str())
            .execute(&mut *tx)
            .await
            .map_err(store_error)?
            .rows_affected();

            tx.commit().await.map_err(store_error)?;

            if deleted > 0 {
                tracing::trace!(group = %key, "Message group emptied and deleted");
            }
            self.publish_count().await;
            Ok(())
        })
    }

    fn remove_message_group<'a>(&'a self, key: &'a CorrelationKey) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            sqlx::query("DELETE FROM message_groups WHERE group_key = $1")
                .bind(key.as_str())
                .execute(&self.pool)
                .await
                .map_err(store_error)?;
            self.publish_count().await;
            Ok(())
        })
    }

    fn message_group_count(&self) -> BoxFuture<'_, Result<usize, StoreError>> {
        Box::pin(self.count())
    }
}

/// Rebuild one message from a joined row; `None` for a group without messages.
fn row_to_message(row: &PgRow) -> Result<Option<EventMessage>, sqlx::Error> {
    let Some(id) = row.try_get::<Option<Uuid>, _>("message_id")? else {
        return Ok(None);
    };
    let Json(headers) = row.try_get::<Json<MessageHeaders>, _>("headers")?;
    let Json(payload) = row.try_get::<Json<MessageEventPayload>, _>("payload")?;

    Ok(Some(Message::builder(payload).copy_headers(&headers).id(id).build()))
}

fn corrupted(key: &CorrelationKey, error: &sqlx::Error) -> StoreError {
    StoreError::Corrupted {
        key: key.to_string(),
        reason: error.to_string(),
    }
}

/// Map a database error onto the store's error kinds.
pub(crate) fn store_error(error: sqlx::Error) -> StoreError {
    match error {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Tls(_) => {
            StoreError::Unavailable(error.to_string())
        }
        other => StoreError::Other(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_failures_are_unavailable() {
        assert!(matches!(store_error(sqlx::Error::PoolTimedOut), StoreError::Unavailable(_)));
        assert!(matches!(store_error(sqlx::Error::PoolClosed), StoreError::Unavailable(_)));
        assert!(matches!(store_error(sqlx::Error::RowNotFound), StoreError::Other(_)));
    }

    #[test]
    fn schema_creates_groups_before_messages() {
        assert!(SCHEMA[0].contains("message_groups ("));
        assert!(SCHEMA[1].contains("REFERENCES message_groups"));
    }
}
