//! Storage interfaces and implementations.
//!
//! Two independent stores take part in the pipeline:
//! - [`OutboxStore`]: the write side's outbox table (relational)
//! - [`ReadModelStore`]: the denormalized activity collection (read side)

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use tracing::info;

use crate::config::{OutboxStorageConfig, OutboxStorageType, ReadModelStorageConfig, ReadModelStorageType};
use crate::model::{ActivityPatch, ActivityReadModel, NewOutboxEvent, OutboxEvent};

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(any(feature = "sqlite", feature = "postgres"))]
pub mod schema;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::{InMemoryOutboxStore, InMemoryReadModelStore};
#[cfg(feature = "postgres")]
pub use postgres::PostgresOutboxStore;
#[cfg(feature = "sqlite")]
pub use sqlite::{SqliteOutboxStore, SqliteReadModelStore};

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Outbox event not found: id={0}")]
    OutboxEventNotFound(i64),

    #[error("Read model not found: id={0}")]
    ReadModelNotFound(String),

    #[error("Invalid timestamp '{value}': {message}")]
    InvalidTimestamp { value: String, message: String },

    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[cfg(any(feature = "sqlite", feature = "postgres"))]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Interface to the transactional outbox.
///
/// Implementations:
/// - `SqliteOutboxStore`: SQLite (standalone)
/// - `PostgresOutboxStore`: PostgreSQL
/// - `InMemoryOutboxStore`: in-memory, with failure injection for tests
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Append a new, unpublished row. Returns the stored row.
    async fn append(&self, event: NewOutboxEvent) -> Result<OutboxEvent>;

    /// Fetch up to `limit` unpublished rows, oldest first.
    ///
    /// Ordered by `created_at ASC, id ASC` so rows sharing a timestamp still
    /// come back in a stable order.
    async fn fetch_unpublished(&self, limit: usize) -> Result<Vec<OutboxEvent>>;

    /// Flip `published` and stamp `published_at`.
    async fn mark_published(&self, id: i64, published_at: DateTime<Utc>) -> Result<()>;
}

/// Interface to the activity read model.
///
/// Only the projector writes through this trait. Readers use `get`/`list`.
#[async_trait]
pub trait ReadModelStore: Send + Sync {
    /// Write the full record, replacing any existing one with the same id.
    async fn upsert(&self, record: &ActivityReadModel) -> Result<()>;

    /// Apply a field-level patch and increment `version` atomically.
    ///
    /// Returns the new version, or `ReadModelNotFound` if there is no record.
    async fn patch(&self, id: &str, patch: &ActivityPatch) -> Result<i64>;

    /// Remove a record. Returns whether it existed.
    async fn delete(&self, id: &str) -> Result<bool>;

    async fn get(&self, id: &str) -> Result<Option<ActivityReadModel>>;

    /// Most recently created records first.
    async fn list(&self, limit: usize) -> Result<Vec<ActivityReadModel>>;

    /// Cheapest possible round trip, used by the health probe.
    async fn ping(&self) -> Result<()>;
}

/// Timestamp text format used by text-typed columns.
///
/// Fixed precision with a `Z` suffix, so lexical order matches time order.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| StorageError::InvalidTimestamp {
            value: value.to_string(),
            message: e.to_string(),
        })
}

/// Initialize the outbox store based on configuration.
pub async fn init_outbox_store(
    config: &OutboxStorageConfig,
) -> std::result::Result<Arc<dyn OutboxStore>, Box<dyn std::error::Error + Send + Sync>> {
    match config.storage_type {
        OutboxStorageType::Memory => {
            info!(storage_type = "memory", "Outbox store initialized");
            Ok(Arc::new(InMemoryOutboxStore::new()))
        }
        OutboxStorageType::Sqlite => {
            #[cfg(feature = "sqlite")]
            {
                let pool = sqlite::connect(&config.sqlite.path).await?;
                let store = SqliteOutboxStore::new(pool);
                store.init().await?;
                info!(storage_type = "sqlite", path = %config.sqlite.path, "Outbox store initialized");
                Ok(Arc::new(store))
            }

            #[cfg(not(feature = "sqlite"))]
            {
                Err("SQLite support requires the 'sqlite' feature. Rebuild with --features sqlite".into())
            }
        }
        OutboxStorageType::Postgres => {
            #[cfg(feature = "postgres")]
            {
                let pool = sqlx::PgPool::connect(&config.postgres.uri).await?;
                let store = PostgresOutboxStore::new(pool);
                store.init().await?;
                info!(storage_type = "postgres", "Outbox store initialized");
                Ok(Arc::new(store))
            }

            #[cfg(not(feature = "postgres"))]
            {
                Err("PostgreSQL support requires the 'postgres' feature. Rebuild with --features postgres".into())
            }
        }
    }
}

/// Initialize the read-model store based on configuration.
pub async fn init_read_model_store(
    config: &ReadModelStorageConfig,
) -> std::result::Result<Arc<dyn ReadModelStore>, Box<dyn std::error::Error + Send + Sync>> {
    match config.storage_type {
        ReadModelStorageType::Memory => {
            info!(storage_type = "memory", "Read model store initialized");
            Ok(Arc::new(InMemoryReadModelStore::new()))
        }
        ReadModelStorageType::Sqlite => {
            #[cfg(feature = "sqlite")]
            {
                let pool = sqlite::connect(&config.sqlite.path).await?;
                let store = SqliteReadModelStore::new(pool);
                store.init().await?;
                info!(storage_type = "sqlite", path = %config.sqlite.path, "Read model store initialized");
                Ok(Arc::new(store))
            }

            #[cfg(not(feature = "sqlite"))]
            {
                Err("SQLite support requires the 'sqlite' feature. Rebuild with --features sqlite".into())
            }
        }
    }
}
