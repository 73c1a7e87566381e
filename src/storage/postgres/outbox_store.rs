//! PostgreSQL OutboxStore implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_query::{ColumnDef, Expr, Index, Order, PostgresQueryBuilder, Query, Table};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Row};
use tracing::info;

use crate::model::{NewOutboxEvent, OutboxEvent};
use crate::storage::schema::{OutboxEvents, OUTBOX_UNPUBLISHED_INDEX};
use crate::storage::{OutboxStore, Result, StorageError};

/// PostgreSQL implementation of OutboxStore.
pub struct PostgresOutboxStore {
    pool: PgPool,
}

impl PostgresOutboxStore {
    /// Create a new PostgreSQL outbox store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Initialize the outbox table schema.
    pub async fn init(&self) -> Result<()> {
        let create_table = Table::create()
            .table(OutboxEvents::Table)
            .if_not_exists()
            .col(
                ColumnDef::new(OutboxEvents::Id)
                    .big_integer()
                    .not_null()
                    .auto_increment()
                    .primary_key(),
            )
            .col(ColumnDef::new(OutboxEvents::EventType).text().not_null())
            .col(ColumnDef::new(OutboxEvents::AggregateId).text().not_null())
            .col(ColumnDef::new(OutboxEvents::EventData).text().not_null())
            .col(
                ColumnDef::new(OutboxEvents::Published)
                    .boolean()
                    .not_null()
                    .default(false),
            )
            .col(
                ColumnDef::new(OutboxEvents::CreatedAt)
                    .timestamp_with_time_zone()
                    .not_null()
                    .default(Expr::current_timestamp()),
            )
            .col(
                ColumnDef::new(OutboxEvents::PublishedAt)
                    .timestamp_with_time_zone()
                    .null(),
            )
            .to_string(PostgresQueryBuilder);

        sqlx::query(&create_table).execute(&self.pool).await?;

        let create_index = Index::create()
            .if_not_exists()
            .name(OUTBOX_UNPUBLISHED_INDEX)
            .table(OutboxEvents::Table)
            .col(OutboxEvents::Published)
            .col(OutboxEvents::CreatedAt)
            .to_string(PostgresQueryBuilder);

        sqlx::query(&create_index).execute(&self.pool).await?;

        info!("Outbox table initialized (PostgreSQL)");
        Ok(())
    }

    /// Append a row on a caller-owned connection.
    ///
    /// Pass the connection of an open transaction to commit the row together
    /// with the data mutation it describes.
    pub async fn append_in_tx(
        conn: &mut PgConnection,
        event: &NewOutboxEvent,
    ) -> Result<OutboxEvent> {
        let row = sqlx::query(
            "INSERT INTO outbox_events (event_type, aggregate_id, event_data, published) \
             VALUES ($1, $2, $3, FALSE) \
             RETURNING id, event_type, aggregate_id, event_data, published, created_at, published_at",
        )
        .bind(&event.event_type)
        .bind(&event.aggregate_id)
        .bind(&event.event_data)
        .fetch_one(&mut *conn)
        .await?;

        row_to_event(&row)
    }
}

fn row_to_event(row: &PgRow) -> Result<OutboxEvent> {
    Ok(OutboxEvent {
        id: row.try_get("id")?,
        event_type: row.try_get("event_type")?,
        aggregate_id: row.try_get("aggregate_id")?,
        event_data: row.try_get("event_data")?,
        published: row.try_get("published")?,
        created_at: row.try_get("created_at")?,
        published_at: row.try_get("published_at")?,
    })
}

#[async_trait]
impl OutboxStore for PostgresOutboxStore {
    async fn append(&self, event: NewOutboxEvent) -> Result<OutboxEvent> {
        let mut conn = self.pool.acquire().await?;
        Self::append_in_tx(&mut conn, &event).await
    }

    async fn fetch_unpublished(&self, limit: usize) -> Result<Vec<OutboxEvent>> {
        let select = Query::select()
            .columns([
                OutboxEvents::Id,
                OutboxEvents::EventType,
                OutboxEvents::AggregateId,
                OutboxEvents::EventData,
                OutboxEvents::Published,
                OutboxEvents::CreatedAt,
                OutboxEvents::PublishedAt,
            ])
            .from(OutboxEvents::Table)
            .and_where(Expr::col(OutboxEvents::Published).eq(false))
            .order_by(OutboxEvents::CreatedAt, Order::Asc)
            .order_by(OutboxEvents::Id, Order::Asc)
            .limit(limit as u64)
            .to_string(PostgresQueryBuilder);

        let rows = sqlx::query(&select).fetch_all(&self.pool).await?;
        rows.iter().map(row_to_event).collect()
    }

    async fn mark_published(&self, id: i64, published_at: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            "UPDATE outbox_events SET published = TRUE, published_at = $1 WHERE id = $2",
        )
        .bind(published_at)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::OutboxEventNotFound(id));
        }
        Ok(())
    }
}
