//! Message transport between the outbox publisher and the read-side consumer.
//!
//! This module contains:
//! - `EventBus` trait: topic handles for publishing, one subscription for consuming
//! - `TopicHandle` trait: a publisher opened per outbox cycle
//! - `MessageHandler` trait: subscription callback, `Ok` acks and `Err` nacks
//! - `DeliveryContext`: per-delivery cancellation signal
//! - Bus configuration types
//! - Implementations: in-process channel, Google Pub/Sub, Mock

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::watch;
use tracing::info;

// Implementation modules
#[cfg(feature = "channel")]
pub mod channel;
pub mod mock;
#[cfg(any(feature = "channel", feature = "pubsub"))]
mod ordering;
#[cfg(feature = "pubsub")]
pub mod pubsub;

// Re-exports
#[cfg(feature = "channel")]
pub use channel::ChannelEventBus;
pub use mock::MockEventBus;
#[cfg(feature = "pubsub")]
pub use pubsub::PubSubEventBus;

/// Attribute carrying the outbox row's event type.
pub const EVENT_TYPE_ATTR: &str = "eventType";
/// Attribute carrying the outbox row's aggregate id (`activity-<id>`).
pub const AGGREGATE_ID_ATTR: &str = "aggregateId";

// ============================================================================
// Traits
// ============================================================================

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Handler failed: {message}")]
    HandlerFailed { message: String },

    #[error("Subscribe not supported for this bus type")]
    SubscribeNotSupported,
}

/// Message handed to a topic for publishing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutboundMessage {
    pub data: Vec<u8>,
    pub attributes: HashMap<String, String>,
    /// Transports that support ordered delivery keep messages with the same
    /// key in publish order.
    pub ordering_key: Option<String>,
}

/// Message delivered to a subscription handler.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Transport-assigned message id.
    pub id: String,
    pub data: Vec<u8>,
    pub attributes: HashMap<String, String>,
    /// Publisher's ordering key. Deliveries sharing a key reach the handler
    /// one at a time, in publish order.
    pub ordering_key: Option<String>,
    /// 1 on first delivery.
    pub delivery_attempt: u32,
    pub publish_time: Option<DateTime<Utc>>,
}

/// Cancellation signal travelling with one delivery.
///
/// A background context is never cancelled.
#[derive(Debug, Clone, Default)]
pub struct DeliveryContext {
    cancel: Option<watch::Receiver<bool>>,
}

/// Owner side of a [`DeliveryContext`].
#[derive(Debug)]
pub struct CancelHandle {
    sender: watch::Sender<bool>,
}

impl DeliveryContext {
    pub fn background() -> Self {
        Self { cancel: None }
    }

    /// A context plus the handle that cancels it (and all its clones).
    pub fn with_cancel() -> (Self, CancelHandle) {
        let (sender, receiver) = watch::channel(false);
        (
            Self {
                cancel: Some(receiver),
            },
            CancelHandle { sender },
        )
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Resolves once the context is cancelled.
    ///
    /// Pending forever for background contexts and for contexts whose handle
    /// was dropped without cancelling.
    pub async fn cancelled(&self) {
        let Some(rx) = &self.cancel else {
            return std::future::pending().await;
        };
        let mut rx = rx.clone();
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }
}

/// Subscription callback.
///
/// Returning `Ok` acknowledges the message; returning `Err` nacks it and the
/// transport redelivers it later.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(
        &self,
        ctx: DeliveryContext,
        message: InboundMessage,
    ) -> std::result::Result<(), BusError>;
}

/// A publisher bound to the configured topic.
///
/// The outbox publisher opens one per cycle and shuts it down when the cycle
/// ends, whatever the outcome.
#[async_trait]
pub trait TopicHandle: Send + Sync {
    /// Publish and wait for the transport's acknowledgment.
    ///
    /// Returns the transport-assigned message id.
    async fn publish(&self, message: OutboundMessage) -> Result<String>;

    /// Flush and release the handle's resources.
    async fn shutdown(&self);
}

/// Interface for the activity event topic and its subscription.
///
/// Implementations:
/// - `ChannelEventBus`: in-process, for standalone mode and tests
/// - `PubSubEventBus`: Google Pub/Sub
/// - `MockEventBus`: records published messages, injects failures
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Open a publisher for the topic.
    async fn open_topic(&self) -> Result<Box<dyn TopicHandle>>;

    /// Register the subscription callback.
    async fn subscribe(&self, handler: Arc<dyn MessageHandler>) -> Result<()>;

    /// Start delivering messages to the registered handler.
    async fn start_consuming(&self) -> Result<()> {
        Ok(())
    }

    /// Stop delivering and cancel in-flight delivery contexts.
    async fn shutdown(&self) {}
}

// ============================================================================
// Configuration
// ============================================================================

/// Messaging type discriminator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessagingType {
    /// In-process channel (no external broker).
    #[default]
    Channel,
    /// Google Pub/Sub.
    Pubsub,
}

/// Messaging configuration (discriminated union).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// Messaging type discriminator.
    #[serde(rename = "type")]
    pub messaging_type: MessagingType,
    /// Pub/Sub-specific configuration.
    pub pubsub: PubSubBusConfig,
    /// Subscriber flow control, shared by all transports.
    pub subscription: SubscriptionSettings,
}

/// Pub/Sub-specific configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PubSubBusConfig {
    /// GCP project ID.
    pub project_id: String,
    /// Topic the outbox publisher writes to.
    pub topic: String,
    /// Subscription the read-side consumer pulls from.
    pub subscription: String,
}

impl Default for PubSubBusConfig {
    fn default() -> Self {
        Self {
            project_id: String::new(),
            topic: "activity-events".to_string(),
            subscription: "activity-read-sync".to_string(),
        }
    }
}

/// Subscriber flow control.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SubscriptionSettings {
    /// Upper bound on deliveries handed to the handler and not yet acked.
    pub max_outstanding_messages: usize,
    /// Upper bound on payload bytes handed to the handler and not yet acked.
    pub max_outstanding_bytes: usize,
    /// Number of concurrent pull loops.
    pub num_workers: usize,
    /// In-process transport only: deliveries before a message is dead-lettered.
    pub max_delivery_attempts: u32,
    /// In-process transport only: delay before a nacked message is redelivered.
    pub redelivery_delay_ms: u64,
}

impl Default for SubscriptionSettings {
    fn default() -> Self {
        Self {
            max_outstanding_messages: 1000,
            max_outstanding_bytes: 1_000_000_000,
            num_workers: 10,
            max_delivery_attempts: 5,
            redelivery_delay_ms: 1000,
        }
    }
}

impl SubscriptionSettings {
    /// Byte permits a single message holds, clamped so one oversized message
    /// can still be delivered on its own.
    pub(crate) fn byte_permits(&self, len: usize) -> u32 {
        len.clamp(1, self.max_outstanding_bytes.max(1))
            .min(u32::MAX as usize) as u32
    }

    /// Total byte permits, capped at what a semaphore can hand out at once.
    pub(crate) fn total_byte_permits(&self) -> usize {
        self.max_outstanding_bytes.clamp(1, u32::MAX as usize)
    }
}

// ============================================================================
// Factory
// ============================================================================

/// Initialize event bus based on configuration.
///
/// Returns the appropriate EventBus implementation based on messaging_type.
/// Requires the corresponding feature to be enabled:
/// - Channel: `--features channel` (included in default)
/// - Pub/Sub: `--features pubsub`
pub async fn init_event_bus(
    config: &MessagingConfig,
) -> std::result::Result<Arc<dyn EventBus>, Box<dyn std::error::Error + Send + Sync>> {
    match config.messaging_type {
        MessagingType::Channel => {
            #[cfg(feature = "channel")]
            {
                let bus = ChannelEventBus::new(config.subscription.clone());
                info!(messaging_type = "channel", "Event bus initialized");
                Ok(Arc::new(bus))
            }

            #[cfg(not(feature = "channel"))]
            {
                Err("Channel bus requires the 'channel' feature. Rebuild with --features channel".into())
            }
        }
        MessagingType::Pubsub => {
            #[cfg(feature = "pubsub")]
            {
                let bus =
                    PubSubEventBus::new(config.pubsub.clone(), config.subscription.clone()).await?;
                info!(messaging_type = "pubsub", "Event bus initialized");
                Ok(Arc::new(bus))
            }

            #[cfg(not(feature = "pubsub"))]
            {
                Err("Pub/Sub support requires the 'pubsub' feature. Rebuild with --features pubsub".into())
            }
        }
    }
}
