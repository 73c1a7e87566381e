//! In-memory OutboxStore implementation.

use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::model::{NewOutboxEvent, OutboxEvent};
use crate::storage::{OutboxStore, Result, StorageError};

/// Outbox rows held in a vector, ids assigned from a counter.
#[derive(Default)]
pub struct InMemoryOutboxStore {
    rows: RwLock<Vec<OutboxEvent>>,
    next_id: AtomicI64,
    fail_on_fetch: RwLock<bool>,
    fail_on_mark: RwLock<HashSet<i64>>,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append with an explicit creation time.
    pub async fn append_at(&self, event: NewOutboxEvent, created_at: DateTime<Utc>) -> OutboxEvent {
        let row = OutboxEvent {
            id: self.next_id.fetch_add(1, Ordering::SeqCst) + 1,
            event_type: event.event_type,
            aggregate_id: event.aggregate_id,
            event_data: event.event_data,
            published: false,
            created_at,
            published_at: None,
        };
        self.rows.write().await.push(row.clone());
        row
    }

    pub async fn set_fail_on_fetch(&self, fail: bool) {
        *self.fail_on_fetch.write().await = fail;
    }

    /// Make `mark_published` fail for the given row.
    pub async fn fail_mark_for(&self, id: i64) {
        self.fail_on_mark.write().await.insert(id);
    }

    pub async fn rows(&self) -> Vec<OutboxEvent> {
        self.rows.read().await.clone()
    }

    pub async fn get(&self, id: i64) -> Option<OutboxEvent> {
        self.rows.read().await.iter().find(|r| r.id == id).cloned()
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn append(&self, event: NewOutboxEvent) -> Result<OutboxEvent> {
        Ok(self.append_at(event, Utc::now()).await)
    }

    async fn fetch_unpublished(&self, limit: usize) -> Result<Vec<OutboxEvent>> {
        if *self.fail_on_fetch.read().await {
            return Err(StorageError::Unavailable("outbox fetch disabled".to_string()));
        }
        let mut pending: Vec<OutboxEvent> = self
            .rows
            .read()
            .await
            .iter()
            .filter(|r| !r.published)
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        pending.truncate(limit);
        Ok(pending)
    }

    async fn mark_published(&self, id: i64, published_at: DateTime<Utc>) -> Result<()> {
        if self.fail_on_mark.read().await.contains(&id) {
            return Err(StorageError::Unavailable(format!("mark_published disabled for {id}")));
        }
        let mut rows = self.rows.write().await;
        let row = rows
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or(StorageError::OutboxEventNotFound(id))?;
        row.published = true;
        row.published_at = Some(published_at);
        Ok(())
    }
}
