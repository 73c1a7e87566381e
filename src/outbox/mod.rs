//! Outbox publisher.
//!
//! Drains unpublished outbox rows into the event topic. Each cycle:
//!
//! 1. Fetch up to `batch_size` unpublished rows, oldest first.
//! 2. Return early when there are none.
//! 3. Open one topic handle for the cycle and release it at the end.
//! 4. Per row: publish, then mark published. A failure at either step is
//!    logged and leaves the row for a later cycle; the batch continues.
//!
//! A row that was published but could not be marked is published again next
//! cycle. Delivery is at-least-once and consumers must tolerate duplicates.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bus::{BusError, EventBus, OutboundMessage, TopicHandle, AGGREGATE_ID_ATTR, EVENT_TYPE_ATTR};
use crate::model::OutboxEvent;
use crate::storage::{OutboxStore, StorageError};

/// Publisher loop settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    /// Seconds between cycles. Default: 10.
    pub poll_interval_secs: u64,
    /// Rows fetched per cycle. Default: 100.
    pub batch_size: usize,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 10,
            batch_size: 100,
        }
    }
}

impl PublisherConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// Errors that end a cycle before any row is attempted.
#[derive(Debug, thiserror::Error)]
pub enum OutboxError {
    #[error("Failed to fetch unpublished rows: {0}")]
    Fetch(#[from] StorageError),

    #[error("Failed to open topic: {0}")]
    OpenTopic(#[from] BusError),
}

/// What one cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub fetched: usize,
    pub published: usize,
    pub publish_failed: usize,
    /// Published, but still marked unpublished; will be sent again.
    pub mark_failed: usize,
}

enum RowOutcome {
    Published,
    PublishFailed,
    MarkFailed,
}

/// Moves outbox rows onto the event topic.
pub struct OutboxPublisher {
    store: Arc<dyn OutboxStore>,
    bus: Arc<dyn EventBus>,
    config: PublisherConfig,
}

impl OutboxPublisher {
    pub fn new(store: Arc<dyn OutboxStore>, bus: Arc<dyn EventBus>, config: PublisherConfig) -> Self {
        Self { store, bus, config }
    }

    pub fn config(&self) -> &PublisherConfig {
        &self.config
    }

    /// Run one cycle.
    #[tracing::instrument(name = "outbox.publish_pending", skip_all)]
    pub async fn publish_pending(&self) -> Result<CycleReport, OutboxError> {
        let rows = self.store.fetch_unpublished(self.config.batch_size).await?;
        let mut report = CycleReport {
            fetched: rows.len(),
            ..Default::default()
        };
        if rows.is_empty() {
            debug!("No unpublished outbox rows");
            return Ok(report);
        }

        let topic = self.bus.open_topic().await?;
        for row in &rows {
            match self.publish_row(topic.as_ref(), row).await {
                RowOutcome::Published => report.published += 1,
                RowOutcome::PublishFailed => report.publish_failed += 1,
                RowOutcome::MarkFailed => report.mark_failed += 1,
            }
        }
        topic.shutdown().await;

        info!(
            fetched = report.fetched,
            published = report.published,
            publish_failed = report.publish_failed,
            mark_failed = report.mark_failed,
            "Outbox cycle complete"
        );
        Ok(report)
    }

    async fn publish_row(&self, topic: &dyn TopicHandle, row: &OutboxEvent) -> RowOutcome {
        let data = match serde_json::to_vec(&row.envelope()) {
            Ok(data) => data,
            Err(e) => {
                error!(event_id = row.id, error = %e, "Failed to serialize outbox row");
                return RowOutcome::PublishFailed;
            }
        };

        let message = OutboundMessage {
            data,
            attributes: HashMap::from([
                (EVENT_TYPE_ATTR.to_string(), row.event_type.clone()),
                (AGGREGATE_ID_ATTR.to_string(), row.aggregate_id.clone()),
            ]),
            ordering_key: Some(row.aggregate_id.clone()),
        };

        let message_id = match topic.publish(message).await {
            Ok(message_id) => message_id,
            Err(e) => {
                warn!(
                    event_id = row.id,
                    aggregate_id = %row.aggregate_id,
                    error = %e,
                    "Publish failed, row stays unpublished"
                );
                return RowOutcome::PublishFailed;
            }
        };

        if let Err(e) = self.store.mark_published(row.id, Utc::now()).await {
            error!(
                event_id = row.id,
                message_id = %message_id,
                error = %e,
                "Published but failed to mark row, it will be published again"
            );
            return RowOutcome::MarkFailed;
        }

        debug!(
            event_id = row.id,
            aggregate_id = %row.aggregate_id,
            event_type = %row.event_type,
            message_id = %message_id,
            "Outbox row published"
        );
        RowOutcome::Published
    }
}

// ============================================================================
// Background Task
// ============================================================================

/// Handle to a running publisher task.
pub struct PublisherTaskHandle {
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl PublisherTaskHandle {
    /// Signal the publisher task to stop after its current cycle.
    pub fn stop(&self) {
        let _ = self.cancel.send(true);
    }

    /// Wait for the task to exit.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            error!(error = %e, "Outbox publisher task ended abnormally");
        }
    }
}

/// Spawn a task running one cycle every `interval`.
///
/// The first cycle runs one interval after start. Cycle errors are logged and
/// the loop continues.
pub fn spawn_publisher_task(publisher: Arc<OutboxPublisher>, interval: Duration) -> PublisherTaskHandle {
    let (cancel_tx, mut cancel_rx) = watch::channel(false);

    let task = tokio::spawn(async move {
        info!(interval_ms = interval.as_millis() as u64, "Outbox publisher task started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = publisher.publish_pending().await {
                        error!(error = %e, "Outbox cycle failed");
                    }
                }
                changed = cancel_rx.changed() => {
                    if changed.is_err() || *cancel_rx.borrow() {
                        info!("Outbox publisher task stopped");
                        break;
                    }
                }
            }
        }
    });

    PublisherTaskHandle {
        cancel: cancel_tx,
        task,
    }
}
