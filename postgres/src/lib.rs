//! `PostgreSQL` storage for the BPMN message connector.
//!
//! Keeps pending message groups and per-key locks in a database shared by
//! every connector instance, so that:
//!
//! - pending messages survive a restart of the connector
//! - several instances can consume the same topic without two of them
//!   mutating one conversation at the same time
//!
//! [`PostgresMessageGroupStore`] implements `MessageGroupStore` on two tables.
//! [`PostgresLockRegistry`] implements `LockRegistry` with transaction-scoped
//! advisory locks.
//!
//! # Example
//!
//! ```ignore
//! use message_connector_postgres::{PostgresLockRegistry, PostgresMessageGroupStore, connect};
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let pool = connect("postgres://localhost/connector", 10).await?;
//!     let store = PostgresMessageGroupStore::from_pool(pool.clone());
//!     store.migrate().await?;
//!     let locks = PostgresLockRegistry::new(pool);
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod lock;
pub mod store;

pub use lock::PostgresLockRegistry;
pub use store::PostgresMessageGroupStore;

use message_connector_core::StoreError;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Open a connection pool.
///
/// # Errors
///
/// Returns [`StoreError::Unavailable`] if the database cannot be reached.
pub async fn connect(url: &str, max_connections: u32) -> Result<PgPool, StoreError> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(url)
        .await
        .map_err(|e| StoreError::Unavailable(e.to_string()))?;

    tracing::info!(max_connections, "Connected to PostgreSQL");
    Ok(pool)
}
