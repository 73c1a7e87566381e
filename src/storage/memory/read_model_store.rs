//! In-memory ReadModelStore implementation.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::model::{ActivityPatch, ActivityReadModel};
use crate::storage::{ReadModelStore, Result, StorageError};

/// Activity read records keyed by id.
#[derive(Default)]
pub struct InMemoryReadModelStore {
    records: RwLock<HashMap<String, ActivityReadModel>>,
    fail_on_ping: RwLock<bool>,
}

impl InMemoryReadModelStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_fail_on_ping(&self, fail: bool) {
        *self.fail_on_ping.write().await = fail;
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl ReadModelStore for InMemoryReadModelStore {
    async fn upsert(&self, record: &ActivityReadModel) -> Result<()> {
        self.records
            .write()
            .await
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn patch(&self, id: &str, patch: &ActivityPatch) -> Result<i64> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(id)
            .ok_or_else(|| StorageError::ReadModelNotFound(id.to_string()))?;
        record.apply_patch(patch);
        Ok(record.version)
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        Ok(self.records.write().await.remove(id).is_some())
    }

    async fn get(&self, id: &str) -> Result<Option<ActivityReadModel>> {
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn list(&self, limit: usize) -> Result<Vec<ActivityReadModel>> {
        let mut records: Vec<ActivityReadModel> =
            self.records.read().await.values().cloned().collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        records.truncate(limit);
        Ok(records)
    }

    async fn ping(&self) -> Result<()> {
        if *self.fail_on_ping.read().await {
            return Err(StorageError::Unavailable("ping disabled".to_string()));
        }
        Ok(())
    }
}
