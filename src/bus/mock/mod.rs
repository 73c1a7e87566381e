//! Mock event bus implementation for testing.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    BusError, EventBus, MessageHandler, OutboundMessage, Result, TopicHandle, AGGREGATE_ID_ATTR,
};

#[derive(Default)]
struct MockState {
    published: RwLock<Vec<OutboundMessage>>,
    fail_on_publish: RwLock<bool>,
    fail_for_aggregates: RwLock<HashSet<String>>,
    fail_on_open: RwLock<bool>,
    topics_opened: AtomicUsize,
    topics_released: AtomicUsize,
}

/// Mock event bus for testing.
#[derive(Default)]
pub struct MockEventBus {
    state: Arc<MockState>,
}

impl MockEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_fail_on_publish(&self, fail: bool) {
        *self.state.fail_on_publish.write().await = fail;
    }

    /// Fail publishes whose `aggregateId` attribute is `aggregate_id`.
    pub async fn fail_publish_for(&self, aggregate_id: impl Into<String>) {
        self.state
            .fail_for_aggregates
            .write()
            .await
            .insert(aggregate_id.into());
    }

    pub async fn set_fail_on_open(&self, fail: bool) {
        *self.state.fail_on_open.write().await = fail;
    }

    pub async fn published_count(&self) -> usize {
        self.state.published.read().await.len()
    }

    pub async fn take_published(&self) -> Vec<OutboundMessage> {
        std::mem::take(&mut *self.state.published.write().await)
    }

    pub fn topics_opened(&self) -> usize {
        self.state.topics_opened.load(Ordering::SeqCst)
    }

    pub fn topics_released(&self) -> usize {
        self.state.topics_released.load(Ordering::SeqCst)
    }
}

struct MockTopic {
    state: Arc<MockState>,
}

#[async_trait]
impl TopicHandle for MockTopic {
    async fn publish(&self, message: OutboundMessage) -> Result<String> {
        if *self.state.fail_on_publish.read().await {
            return Err(BusError::Connection("Mock publish failure".to_string()));
        }
        if let Some(aggregate_id) = message.attributes.get(AGGREGATE_ID_ATTR) {
            if self.state.fail_for_aggregates.read().await.contains(aggregate_id) {
                return Err(BusError::Publish(format!(
                    "Mock publish failure for {aggregate_id}"
                )));
            }
        }
        self.state.published.write().await.push(message);
        Ok(Uuid::new_v4().to_string())
    }

    async fn shutdown(&self) {
        self.state.topics_released.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl EventBus for MockEventBus {
    async fn open_topic(&self) -> Result<Box<dyn TopicHandle>> {
        if *self.state.fail_on_open.read().await {
            return Err(BusError::Connection("Mock topic unavailable".to_string()));
        }
        self.state.topics_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockTopic {
            state: self.state.clone(),
        }))
    }

    async fn subscribe(&self, _handler: Arc<dyn MessageHandler>) -> Result<()> {
        Err(BusError::SubscribeNotSupported)
    }
}
