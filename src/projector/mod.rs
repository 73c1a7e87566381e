//! Read-model apply.
//!
//! Turns one normalized event into one type-specific write against the read
//! store:
//!
//! | Type     | Write                                                |
//! |----------|------------------------------------------------------|
//! | `CREATE` | full record, `version = 1`, overwrite on duplicates  |
//! | `UPDATE` | field-level patch, `version` incremented atomically  |
//! | `DELETE` | remove; a missing record is not an error             |
//! | other    | rejected with [`ApplyError::UnknownEventType`]       |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use crate::model::{ActivityPatch, ActivityReadModel, DomainEvent, EventType};
use crate::storage::{ReadModelStore, StorageError};

/// Errors surfaced by an apply.
#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),

    #[error("Read store error: {0}")]
    Storage(#[from] StorageError),

    /// A fault inside the apply, caught at the shard worker boundary.
    #[error("Apply panicked: {0}")]
    Panicked(String),
}

/// What an apply did to the read store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Created,
    Updated { version: i64 },
    Deleted { existed: bool },
}

/// Seam between the dispatcher's shard workers and the read store.
#[async_trait]
pub trait Applier: Send + Sync {
    async fn apply(&self, event: &DomainEvent) -> Result<ApplyOutcome, ApplyError>;
}

/// Applies activity events to the activity read model.
pub struct ActivityProjector {
    store: Arc<dyn ReadModelStore>,
}

impl ActivityProjector {
    pub fn new(store: Arc<dyn ReadModelStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn ReadModelStore> {
        &self.store
    }
}

#[async_trait]
impl Applier for ActivityProjector {
    #[tracing::instrument(
        name = "projector.apply",
        skip_all,
        fields(aggregate_id = event.aggregate_id, event_type = %event.event_type)
    )]
    async fn apply(&self, event: &DomainEvent) -> Result<ApplyOutcome, ApplyError> {
        let now = Utc::now();
        let key = event.read_key();

        match &event.event_type {
            EventType::Create => {
                let record = ActivityReadModel::from_event(event, now);
                self.store.upsert(&record).await?;
                debug!(id = %key, "Read model created");
                Ok(ApplyOutcome::Created)
            }
            EventType::Update => {
                let patch = ActivityPatch::from_event(event, now);
                let version = self.store.patch(&key, &patch).await?;
                debug!(id = %key, version, "Read model updated");
                Ok(ApplyOutcome::Updated { version })
            }
            EventType::Delete => {
                let existed = self.store.delete(&key).await?;
                debug!(id = %key, existed, "Read model deleted");
                Ok(ApplyOutcome::Deleted { existed })
            }
            EventType::Unknown(raw) => Err(ApplyError::UnknownEventType(raw.clone())),
        }
    }
}
