//! SQLite OutboxStore implementation.

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use sea_query::{ColumnDef, Expr, Index, Order, Query, SqliteQueryBuilder, Table};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use tracing::info;

use crate::model::{NewOutboxEvent, OutboxEvent};
use crate::storage::schema::{OutboxEvents, OUTBOX_UNPUBLISHED_INDEX};
use crate::storage::{format_timestamp, parse_timestamp, OutboxStore, Result, StorageError};

/// SQLite implementation of OutboxStore.
pub struct SqliteOutboxStore {
    pool: SqlitePool,
}

impl SqliteOutboxStore {
    /// Create a new SQLite outbox store.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Initialize the outbox table schema.
    pub async fn init(&self) -> Result<()> {
        let create_table = Table::create()
            .table(OutboxEvents::Table)
            .if_not_exists()
            .col(
                ColumnDef::new(OutboxEvents::Id)
                    .integer()
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
            .col(ColumnDef::new(OutboxEvents::CreatedAt).text().not_null())
            .col(ColumnDef::new(OutboxEvents::PublishedAt).text().null())
            .to_string(SqliteQueryBuilder);

        sqlx::query(&create_table).execute(&self.pool).await?;

        let create_index = Index::create()
            .if_not_exists()
            .name(OUTBOX_UNPUBLISHED_INDEX)
            .table(OutboxEvents::Table)
            .col(OutboxEvents::Published)
            .col(OutboxEvents::CreatedAt)
            .to_string(SqliteQueryBuilder);

        sqlx::query(&create_index).execute(&self.pool).await?;

        info!("Outbox table initialized (SQLite)");
        Ok(())
    }

    /// Append a row on a caller-owned connection.
    ///
    /// Producers call this inside the transaction that performs their data
    /// mutation, so the row commits or rolls back with it.
    pub async fn append_in_tx(
        conn: &mut SqliteConnection,
        event: &NewOutboxEvent,
    ) -> Result<OutboxEvent> {
        // Stored text carries microseconds; keep the returned row identical.
        let created_at = Utc::now().trunc_subsecs(6);

        let insert = Query::insert()
            .into_table(OutboxEvents::Table)
            .columns([
                OutboxEvents::EventType,
                OutboxEvents::AggregateId,
                OutboxEvents::EventData,
                OutboxEvents::Published,
                OutboxEvents::CreatedAt,
            ])
            .values_panic([
                event.event_type.clone().into(),
                event.aggregate_id.clone().into(),
                event.event_data.clone().into(),
                false.into(),
                format_timestamp(created_at).into(),
            ])
            .to_string(SqliteQueryBuilder);

        let result = sqlx::query(&insert).execute(&mut *conn).await?;

        Ok(OutboxEvent {
            id: result.last_insert_rowid(),
            event_type: event.event_type.clone(),
            aggregate_id: event.aggregate_id.clone(),
            event_data: event.event_data.clone(),
            published: false,
            created_at,
            published_at: None,
        })
    }
}

fn row_to_event(row: &SqliteRow) -> Result<OutboxEvent> {
    let created_at: String = row.get("created_at");
    let published_at: Option<String> = row.get("published_at");

    Ok(OutboxEvent {
        id: row.get("id"),
        event_type: row.get("event_type"),
        aggregate_id: row.get("aggregate_id"),
        event_data: row.get("event_data"),
        published: row.get("published"),
        created_at: parse_timestamp(&created_at)?,
        published_at: published_at.as_deref().map(parse_timestamp).transpose()?,
    })
}

#[async_trait]
impl OutboxStore for SqliteOutboxStore {
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
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&select).fetch_all(&self.pool).await?;
        rows.iter().map(row_to_event).collect()
    }

    async fn mark_published(&self, id: i64, published_at: DateTime<Utc>) -> Result<()> {
        let update = Query::update()
            .table(OutboxEvents::Table)
            .value(OutboxEvents::Published, true)
            .value(OutboxEvents::PublishedAt, format_timestamp(published_at))
            .and_where(Expr::col(OutboxEvents::Id).eq(id))
            .to_string(SqliteQueryBuilder);

        let result = sqlx::query(&update).execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::OutboxEventNotFound(id));
        }
        Ok(())
    }
}
