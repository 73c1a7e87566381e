//! Database schema definitions using sea-query.
//!
//! These define the table and column identifiers for type-safe query building.

use sea_query::Iden;

/// Outbox table schema.
#[derive(Iden)]
pub enum OutboxEvents {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "event_type"]
    EventType,
    #[iden = "aggregate_id"]
    AggregateId,
    #[iden = "event_data"]
    EventData,
    #[iden = "published"]
    Published,
    #[iden = "created_at"]
    CreatedAt,
    #[iden = "published_at"]
    PublishedAt,
}

/// Activity read-model table schema.
#[derive(Iden)]
pub enum ActivityReadModels {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "urgency_id"]
    UrgencyId,
    #[iden = "employee_id"]
    EmployeeId,
    #[iden = "description"]
    Description,
    #[iden = "created_at"]
    CreatedAt,
    #[iden = "employee_name"]
    EmployeeName,
    #[iden = "urgency_title"]
    UrgencyTitle,
    #[iden = "urgency_level"]
    UrgencyLevel,
    #[iden = "synced_at"]
    SyncedAt,
    #[iden = "version"]
    Version,
}

/// Index backing the publisher's polling query.
pub const OUTBOX_UNPUBLISHED_INDEX: &str = "idx_outbox_events_published_created_at";
