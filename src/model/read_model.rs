//! Denormalized activity read record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::DomainEvent;

/// Read-store record keyed by the string form of the activity id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityReadModel {
    pub id: String,
    pub urgency_id: u64,
    pub employee_id: u64,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub employee_name: String,
    pub urgency_title: String,
    pub urgency_level: String,
    pub synced_at: DateTime<Utc>,
    pub version: i64,
}

impl ActivityReadModel {
    /// Full record for a create. Starts at version 1.
    pub fn from_event(event: &DomainEvent, now: DateTime<Utc>) -> Self {
        Self {
            id: event.read_key(),
            urgency_id: event.urgency_id,
            employee_id: event.employee_id,
            description: event.description.clone(),
            created_at: event.created_at.unwrap_or(now),
            employee_name: event.employee_name.clone(),
            urgency_title: event.urgency_title.clone(),
            urgency_level: event.urgency_level.clone(),
            synced_at: now,
            version: 1,
        }
    }

    /// Apply a patch in place, bumping the version.
    pub fn apply_patch(&mut self, patch: &ActivityPatch) {
        self.description = patch.description.clone();
        self.employee_name = patch.employee_name.clone();
        self.urgency_title = patch.urgency_title.clone();
        self.urgency_level = patch.urgency_level.clone();
        self.synced_at = patch.synced_at;
        self.version += 1;
    }
}

/// Field-level update written by an UPDATE apply.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityPatch {
    pub description: String,
    pub employee_name: String,
    pub urgency_title: String,
    pub urgency_level: String,
    pub synced_at: DateTime<Utc>,
}

impl ActivityPatch {
    pub fn from_event(event: &DomainEvent, now: DateTime<Utc>) -> Self {
        Self {
            description: event.description.clone(),
            employee_name: event.employee_name.clone(),
            urgency_title: event.urgency_title.clone(),
            urgency_level: event.urgency_level.clone(),
            synced_at: now,
        }
    }
}
