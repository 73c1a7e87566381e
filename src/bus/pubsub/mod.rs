//! Google Pub/Sub event bus implementation.
//!
//! One topic carries all activity events; the read side consumes it through a
//! single subscription. Messages are published with the outbox aggregate id as
//! ordering key; received messages sharing a key are handled one at a time, in
//! the order the pulls returned them.
//!
//! # Authentication
//!
//! Uses ADC (Application Default Credentials):
//! - Set `GOOGLE_APPLICATION_CREDENTIALS` to a service account JSON path
//! - Or `GOOGLE_APPLICATION_CREDENTIALS_JSON` with the JSON content
//! - For local testing: set `PUBSUB_EMULATOR_HOST` to the emulator address

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::BackoffBuilder;
use chrono::DateTime;
use futures::FutureExt;
use google_cloud_googleapis::pubsub::v1::PubsubMessage;
use google_cloud_pubsub::client::{Client, ClientConfig};
use google_cloud_pubsub::publisher::Publisher;
use google_cloud_pubsub::subscriber::ReceivedMessage;
use google_cloud_pubsub::subscription::SubscriptionConfig;
use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore};
use tracing::{debug, error, info, Instrument};

use super::{
    BusError, CancelHandle, DeliveryContext, EventBus, InboundMessage, MessageHandler,
    OutboundMessage, PubSubBusConfig, Result, SubscriptionSettings, TopicHandle,
};
use super::ordering::OrderedLanes;
use crate::utils::retry::pull_backoff;

/// Messages requested per pull.
const PULL_BATCH: i32 = 10;

/// Google Pub/Sub event bus implementation.
pub struct PubSubEventBus {
    client: Client,
    config: PubSubBusConfig,
    settings: SubscriptionSettings,
    handler: RwLock<Option<Arc<dyn MessageHandler>>>,
    consuming: RwLock<bool>,
    context: DeliveryContext,
    cancel: CancelHandle,
}

impl PubSubEventBus {
    /// Create a new Pub/Sub event bus.
    ///
    /// Uses Application Default Credentials (ADC) for authentication.
    /// Set GOOGLE_APPLICATION_CREDENTIALS or PUBSUB_EMULATOR_HOST for testing.
    pub async fn new(config: PubSubBusConfig, settings: SubscriptionSettings) -> Result<Self> {
        let mut client_config = ClientConfig::default().with_auth().await.map_err(|e| {
            BusError::Connection(format!("Failed to configure Pub/Sub auth: {}", e))
        })?;
        if !config.project_id.is_empty() {
            client_config.project_id = Some(config.project_id.clone());
        }

        let client = Client::new(client_config)
            .await
            .map_err(|e| BusError::Connection(format!("Failed to create Pub/Sub client: {}", e)))?;

        info!(
            project_id = %config.project_id,
            topic = %config.topic,
            subscription = %config.subscription,
            "Connected to Google Pub/Sub"
        );

        let (context, cancel) = DeliveryContext::with_cancel();
        Ok(Self {
            client,
            config,
            settings,
            handler: RwLock::new(None),
            consuming: RwLock::new(false),
            context,
            cancel,
        })
    }

    /// Create the subscription on first use.
    async fn ensure_subscription(&self) -> Result<()> {
        let subscription = self.client.subscription(&self.config.subscription);

        if !subscription.exists(None).await.map_err(|e| {
            BusError::Subscribe(format!("Failed to check subscription existence: {}", e))
        })? {
            let topic = self.client.topic(&self.config.topic);
            let sub_config = SubscriptionConfig {
                enable_message_ordering: true,
                ..Default::default()
            };

            subscription
                .create(topic.fully_qualified_name(), sub_config, None)
                .await
                .map_err(|e| {
                    BusError::Subscribe(format!(
                        "Failed to create subscription {}: {}",
                        self.config.subscription, e
                    ))
                })?;

            info!(
                subscription = %self.config.subscription,
                topic = %self.config.topic,
                "Created Pub/Sub subscription"
            );
        }
        Ok(())
    }
}

/// Publisher opened for one outbox cycle.
struct PubSubTopic {
    publisher: Publisher,
}

#[async_trait]
impl TopicHandle for PubSubTopic {
    async fn publish(&self, message: OutboundMessage) -> Result<String> {
        let message = PubsubMessage {
            data: message.data,
            attributes: message.attributes,
            ordering_key: message.ordering_key.unwrap_or_default(),
            ..Default::default()
        };

        let awaiter = self.publisher.publish(message).await;
        let id = awaiter
            .get()
            .await
            .map_err(|e| BusError::Publish(format!("Failed to publish to Pub/Sub: {}", e)))?;

        debug!(message_id = %id, "Published message to Pub/Sub");
        Ok(id)
    }

    async fn shutdown(&self) {
        // Clones share the publisher's workers; shutting one down flushes them.
        let mut publisher = self.publisher.clone();
        publisher.shutdown().await;
    }
}

fn to_inbound(message: &ReceivedMessage) -> InboundMessage {
    let inner = &message.message;
    InboundMessage {
        id: inner.message_id.clone(),
        data: inner.data.clone(),
        attributes: inner.attributes.clone(),
        ordering_key: Some(inner.ordering_key.clone()).filter(|key| !key.is_empty()),
        delivery_attempt: message
            .delivery_attempt()
            .map(|n| n as u32)
            .unwrap_or(1),
        publish_time: inner
            .publish_time
            .as_ref()
            .and_then(|ts| DateTime::from_timestamp(ts.seconds, ts.nanos.max(0) as u32)),
    }
}

async fn handle_received(
    handler: Arc<dyn MessageHandler>,
    ctx: DeliveryContext,
    message: ReceivedMessage,
    permits: (OwnedSemaphorePermit, OwnedSemaphorePermit),
) {
    let inbound = to_inbound(&message);
    let consume_span = tracing::info_span!("bus.consume", message_id = %inbound.id);

    let result = handler.handle(ctx, inbound).instrument(consume_span).await;
    let outcome = match result {
        Ok(()) => message.ack().await,
        Err(e) => {
            error!(message_id = %message.message.message_id, error = %e, "Handler failed, nacking");
            message.nack().await
        }
    };
    if let Err(e) = outcome {
        error!(error = %e, "Failed to ack/nack Pub/Sub message");
    }
    drop(permits);
}

/// Everything one pull loop needs; cloned per worker.
#[derive(Clone)]
struct PullLoop {
    client: Client,
    subscription_name: String,
    handler: Arc<dyn MessageHandler>,
    settings: SubscriptionSettings,
    messages: Arc<Semaphore>,
    bytes: Arc<Semaphore>,
    lanes: OrderedLanes,
    ctx: DeliveryContext,
}

impl PullLoop {
    async fn run(self, worker: usize) {
        let subscription = self.client.subscription(&self.subscription_name);
        let backoff_builder = pull_backoff();
        let mut backoff_iter = backoff_builder.build();

        info!(worker, subscription = %self.subscription_name, "Starting Pub/Sub pull loop");

        loop {
            let pulled = tokio::select! {
                biased;
                _ = self.ctx.cancelled() => break,
                pulled = subscription.pull(PULL_BATCH, None) => pulled,
            };

            match pulled {
                Ok(received) => {
                    // Reset backoff on successful pull
                    backoff_iter = backoff_builder.build();

                    for message in received {
                        let Some(permits) = self.acquire(message.message.data.len()).await else {
                            return;
                        };
                        let key = Some(message.message.ordering_key.clone())
                            .filter(|key| !key.is_empty());
                        let delivery = handle_received(
                            self.handler.clone(),
                            self.ctx.clone(),
                            message,
                            permits,
                        );
                        self.lanes.submit(key, delivery.boxed());
                    }
                }
                Err(e) => {
                    let delay = backoff_iter.next().unwrap_or(Duration::from_secs(30));
                    error!(
                        error = %e,
                        backoff_ms = %delay.as_millis(),
                        "Failed to pull messages from Pub/Sub, retrying after backoff"
                    );
                    tokio::select! {
                        _ = self.ctx.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        debug!(worker, "Pub/Sub pull loop stopped");
    }

    /// Flow control: one message permit plus one permit per payload byte.
    async fn acquire(&self, len: usize) -> Option<(OwnedSemaphorePermit, OwnedSemaphorePermit)> {
        let message_permit = self.messages.clone().acquire_owned().await.ok()?;
        let byte_permit = self
            .bytes
            .clone()
            .acquire_many_owned(self.settings.byte_permits(len))
            .await
            .ok()?;
        Some((message_permit, byte_permit))
    }
}

#[async_trait]
impl EventBus for PubSubEventBus {
    async fn open_topic(&self) -> Result<Box<dyn TopicHandle>> {
        let topic = self.client.topic(&self.config.topic);

        if !topic
            .exists(None)
            .await
            .map_err(|e| BusError::Publish(format!("Failed to check topic existence: {}", e)))?
        {
            topic.create(None, None).await.map_err(|e| {
                BusError::Publish(format!("Failed to create topic {}: {}", self.config.topic, e))
            })?;
            info!(topic = %self.config.topic, "Created Pub/Sub topic");
        }

        Ok(Box::new(PubSubTopic {
            publisher: topic.new_publisher(None),
        }))
    }

    async fn subscribe(&self, handler: Arc<dyn MessageHandler>) -> Result<()> {
        let mut slot = self.handler.write().await;
        if slot.is_some() {
            return Err(BusError::Subscribe(
                "Pub/Sub subscription already has a handler".to_string(),
            ));
        }
        *slot = Some(handler);
        Ok(())
    }

    async fn start_consuming(&self) -> Result<()> {
        let handler = self
            .handler
            .read()
            .await
            .clone()
            .ok_or_else(|| BusError::Subscribe("no handler subscribed".to_string()))?;

        {
            let mut consuming = self.consuming.write().await;
            if *consuming {
                return Ok(());
            }
            *consuming = true;
        }

        self.ensure_subscription().await?;

        let pull = PullLoop {
            client: self.client.clone(),
            subscription_name: self.config.subscription.clone(),
            handler,
            settings: self.settings.clone(),
            messages: Arc::new(Semaphore::new(self.settings.max_outstanding_messages.max(1))),
            bytes: Arc::new(Semaphore::new(self.settings.total_byte_permits())),
            lanes: OrderedLanes::new(),
            ctx: self.context.clone(),
        };
        let workers = self.settings.num_workers.max(1);

        for worker in 0..workers {
            tokio::spawn(pull.clone().run(worker));
        }

        info!(
            subscription = %self.config.subscription,
            workers,
            max_outstanding_messages = self.settings.max_outstanding_messages,
            max_outstanding_bytes = self.settings.max_outstanding_bytes,
            "Started Pub/Sub consumers"
        );

        Ok(())
    }

    async fn shutdown(&self) {
        self.cancel.cancel();
        info!(subscription = %self.config.subscription, "Pub/Sub consumers stopping");
    }
}
