//! SQLite ReadModelStore implementation.

use async_trait::async_trait;
use sea_query::{ColumnDef, Expr, OnConflict, Order, Query, SqliteQueryBuilder, Table};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::info;

use crate::model::{ActivityPatch, ActivityReadModel};
use crate::storage::schema::ActivityReadModels;
use crate::storage::{format_timestamp, parse_timestamp, ReadModelStore, Result, StorageError};

const COLUMNS: [ActivityReadModels; 10] = [
    ActivityReadModels::Id,
    ActivityReadModels::UrgencyId,
    ActivityReadModels::EmployeeId,
    ActivityReadModels::Description,
    ActivityReadModels::CreatedAt,
    ActivityReadModels::EmployeeName,
    ActivityReadModels::UrgencyTitle,
    ActivityReadModels::UrgencyLevel,
    ActivityReadModels::SyncedAt,
    ActivityReadModels::Version,
];

/// SQLite implementation of ReadModelStore.
pub struct SqliteReadModelStore {
    pool: SqlitePool,
}

impl SqliteReadModelStore {
    /// Create a new SQLite read-model store.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Initialize the read-model table schema.
    pub async fn init(&self) -> Result<()> {
        let create_table = Table::create()
            .table(ActivityReadModels::Table)
            .if_not_exists()
            .col(
                ColumnDef::new(ActivityReadModels::Id)
                    .text()
                    .not_null()
                    .primary_key(),
            )
            .col(ColumnDef::new(ActivityReadModels::UrgencyId).big_integer().not_null())
            .col(ColumnDef::new(ActivityReadModels::EmployeeId).big_integer().not_null())
            .col(ColumnDef::new(ActivityReadModels::Description).text().not_null())
            .col(ColumnDef::new(ActivityReadModels::CreatedAt).text().not_null())
            .col(ColumnDef::new(ActivityReadModels::EmployeeName).text().not_null())
            .col(ColumnDef::new(ActivityReadModels::UrgencyTitle).text().not_null())
            .col(ColumnDef::new(ActivityReadModels::UrgencyLevel).text().not_null())
            .col(ColumnDef::new(ActivityReadModels::SyncedAt).text().not_null())
            .col(ColumnDef::new(ActivityReadModels::Version).big_integer().not_null())
            .to_string(SqliteQueryBuilder);

        sqlx::query(&create_table).execute(&self.pool).await?;

        info!("Activity read-model table initialized (SQLite)");
        Ok(())
    }
}

fn row_to_record(row: &SqliteRow) -> Result<ActivityReadModel> {
    let created_at: String = row.get("created_at");
    let synced_at: String = row.get("synced_at");
    let urgency_id: i64 = row.get("urgency_id");
    let employee_id: i64 = row.get("employee_id");

    Ok(ActivityReadModel {
        id: row.get("id"),
        urgency_id: urgency_id as u64,
        employee_id: employee_id as u64,
        description: row.get("description"),
        created_at: parse_timestamp(&created_at)?,
        employee_name: row.get("employee_name"),
        urgency_title: row.get("urgency_title"),
        urgency_level: row.get("urgency_level"),
        synced_at: parse_timestamp(&synced_at)?,
        version: row.get("version"),
    })
}

#[async_trait]
impl ReadModelStore for SqliteReadModelStore {
    async fn upsert(&self, record: &ActivityReadModel) -> Result<()> {
        let insert = Query::insert()
            .into_table(ActivityReadModels::Table)
            .columns(COLUMNS)
            .values_panic([
                record.id.clone().into(),
                (record.urgency_id as i64).into(),
                (record.employee_id as i64).into(),
                record.description.clone().into(),
                format_timestamp(record.created_at).into(),
                record.employee_name.clone().into(),
                record.urgency_title.clone().into(),
                record.urgency_level.clone().into(),
                format_timestamp(record.synced_at).into(),
                record.version.into(),
            ])
            .on_conflict(
                OnConflict::column(ActivityReadModels::Id)
                    .update_columns([
                        ActivityReadModels::UrgencyId,
                        ActivityReadModels::EmployeeId,
                        ActivityReadModels::Description,
                        ActivityReadModels::CreatedAt,
                        ActivityReadModels::EmployeeName,
                        ActivityReadModels::UrgencyTitle,
                        ActivityReadModels::UrgencyLevel,
                        ActivityReadModels::SyncedAt,
                        ActivityReadModels::Version,
                    ])
                    .to_owned(),
            )
            .to_string(SqliteQueryBuilder);

        sqlx::query(&insert).execute(&self.pool).await?;
        Ok(())
    }

    async fn patch(&self, id: &str, patch: &ActivityPatch) -> Result<i64> {
        // Single statement: the increment and the field writes are atomic.
        let update = Query::update()
            .table(ActivityReadModels::Table)
            .value(ActivityReadModels::Description, patch.description.clone())
            .value(ActivityReadModels::EmployeeName, patch.employee_name.clone())
            .value(ActivityReadModels::UrgencyTitle, patch.urgency_title.clone())
            .value(ActivityReadModels::UrgencyLevel, patch.urgency_level.clone())
            .value(ActivityReadModels::SyncedAt, format_timestamp(patch.synced_at))
            .value(
                ActivityReadModels::Version,
                Expr::col(ActivityReadModels::Version).add(1),
            )
            .and_where(Expr::col(ActivityReadModels::Id).eq(id))
            .returning_col(ActivityReadModels::Version)
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&update).fetch_optional(&self.pool).await?;
        match row {
            Some(row) => Ok(row.get("version")),
            None => Err(StorageError::ReadModelNotFound(id.to_string())),
        }
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let delete = Query::delete()
            .from_table(ActivityReadModels::Table)
            .and_where(Expr::col(ActivityReadModels::Id).eq(id))
            .to_string(SqliteQueryBuilder);

        let result = sqlx::query(&delete).execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get(&self, id: &str) -> Result<Option<ActivityReadModel>> {
        let select = Query::select()
            .columns(COLUMNS)
            .from(ActivityReadModels::Table)
            .and_where(Expr::col(ActivityReadModels::Id).eq(id))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&select).fetch_optional(&self.pool).await?;
        row.as_ref().map(row_to_record).transpose()
    }

    async fn list(&self, limit: usize) -> Result<Vec<ActivityReadModel>> {
        let select = Query::select()
            .columns(COLUMNS)
            .from(ActivityReadModels::Table)
            .order_by(ActivityReadModels::CreatedAt, Order::Desc)
            .order_by(ActivityReadModels::Id, Order::Asc)
            .limit(limit as u64)
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&select).fetch_all(&self.pool).await?;
        rows.iter().map(row_to_record).collect()
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
