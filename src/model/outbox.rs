//! Outbox rows and the transport envelope built from them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::DomainEvent;

/// Prefix of the string aggregate identity stored in the outbox.
pub const AGGREGATE_ID_PREFIX: &str = "activity-";

/// A pending (or already published) domain event in the outbox table.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxEvent {
    pub id: i64,
    pub event_type: String,
    pub aggregate_id: String,
    /// Serialized [`DomainEvent`] (JSON text).
    pub event_data: String,
    pub published: bool,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
}

impl OutboxEvent {
    /// Build the message body published for this row.
    pub fn envelope(&self) -> OutboxEnvelope {
        OutboxEnvelope {
            id: self.id,
            event_type: self.event_type.clone(),
            aggregate_id: self.aggregate_id.clone(),
            event_data: self.event_data.clone(),
            created_at: self.created_at,
        }
    }
}

/// Row to be appended by a producer. `id` and timestamps are assigned on insert.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOutboxEvent {
    pub event_type: String,
    pub aggregate_id: String,
    pub event_data: String,
}

impl NewOutboxEvent {
    /// Outbox row for an activity mutation.
    pub fn for_activity(event: &DomainEvent) -> Result<Self, serde_json::Error> {
        Ok(Self {
            event_type: event.event_type.outbox_name(),
            aggregate_id: format!("{}{}", AGGREGATE_ID_PREFIX, event.aggregate_id),
            event_data: serde_json::to_string(event)?,
        })
    }
}

/// Message body for a published outbox row.
///
/// `event_data` stays the row's JSON text, so on the wire it is a quoted
/// string inside the envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxEnvelope {
    pub id: i64,
    pub event_type: String,
    pub aggregate_id: String,
    pub event_data: String,
    pub created_at: DateTime<Utc>,
}
