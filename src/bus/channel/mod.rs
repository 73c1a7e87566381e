//! In-memory channel-based event bus for standalone mode.
//!
//! A bounded tokio mpsc queue stands in for both the topic and its single
//! subscription. Delivery follows broker semantics: a handler `Ok` acks, an
//! `Err` nacks and the message is redelivered after a delay with its attempt
//! counter incremented, and a message that exhausts its attempts is
//! dead-lettered (logged and dropped).
//!
//! Messages that share an ordering key reach the handler one at a time, in
//! publish order. A nacked message goes to the back of the queue; later
//! messages for its key are not held back.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use tokio::sync::{mpsc, Mutex, OwnedSemaphorePermit, RwLock, Semaphore};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{
    BusError, CancelHandle, DeliveryContext, EventBus, InboundMessage, MessageHandler,
    OutboundMessage, Result, SubscriptionSettings, TopicHandle,
};
use super::ordering::OrderedLanes;

/// Queue capacity; publishers wait when it is full.
const CHANNEL_CAPACITY: usize = 1024;

/// Delivery counters, mainly for tests and shutdown logs.
#[derive(Debug, Default)]
pub struct DeliveryStats {
    acked: AtomicU64,
    nacked: AtomicU64,
    dead_lettered: AtomicU64,
}

impl DeliveryStats {
    pub fn acked(&self) -> u64 {
        self.acked.load(Ordering::SeqCst)
    }

    pub fn nacked(&self) -> u64 {
        self.nacked.load(Ordering::SeqCst)
    }

    pub fn dead_lettered(&self) -> u64 {
        self.dead_lettered.load(Ordering::SeqCst)
    }
}

/// State shared by the pull loops and delivery tasks.
struct Subscription {
    sender: mpsc::Sender<InboundMessage>,
    receiver: Mutex<mpsc::Receiver<InboundMessage>>,
    settings: SubscriptionSettings,
    context: DeliveryContext,
    messages: Arc<Semaphore>,
    bytes: Arc<Semaphore>,
    stats: Arc<DeliveryStats>,
    lanes: OrderedLanes,
}

/// In-memory event bus using a tokio mpsc channel.
pub struct ChannelEventBus {
    subscription: Arc<Subscription>,
    handler: RwLock<Option<Arc<dyn MessageHandler>>>,
    consuming: RwLock<bool>,
    cancel: CancelHandle,
}

impl ChannelEventBus {
    /// Create a new channel event bus.
    pub fn new(settings: SubscriptionSettings) -> Self {
        let (sender, receiver) = mpsc::channel(CHANNEL_CAPACITY);
        let (context, cancel) = DeliveryContext::with_cancel();

        info!(
            num_workers = settings.num_workers,
            max_outstanding_messages = settings.max_outstanding_messages,
            "Channel event bus initialized"
        );

        Self {
            subscription: Arc::new(Subscription {
                sender,
                receiver: Mutex::new(receiver),
                messages: Arc::new(Semaphore::new(settings.max_outstanding_messages.max(1))),
                bytes: Arc::new(Semaphore::new(settings.total_byte_permits())),
                settings,
                context,
                stats: Arc::new(DeliveryStats::default()),
                lanes: OrderedLanes::new(),
            }),
            handler: RwLock::new(None),
            consuming: RwLock::new(false),
            cancel,
        }
    }

    pub fn stats(&self) -> Arc<DeliveryStats> {
        self.subscription.stats.clone()
    }
}

/// Publisher side of the channel.
struct ChannelTopic {
    sender: mpsc::Sender<InboundMessage>,
    open: AtomicBool,
}

#[async_trait]
impl TopicHandle for ChannelTopic {
    async fn publish(&self, message: OutboundMessage) -> Result<String> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(BusError::Publish("topic handle already shut down".to_string()));
        }

        let id = Uuid::new_v4().to_string();
        let inbound = InboundMessage {
            id: id.clone(),
            data: message.data,
            attributes: message.attributes,
            ordering_key: message.ordering_key,
            delivery_attempt: 1,
            publish_time: Some(Utc::now()),
        };

        self.sender
            .send(inbound)
            .await
            .map_err(|_| BusError::Publish("channel closed".to_string()))?;

        debug!(message_id = %id, "Published message to channel");
        Ok(id)
    }

    async fn shutdown(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

async fn pull_loop(worker: usize, subscription: Arc<Subscription>, handler: Arc<dyn MessageHandler>) {
    let ctx = subscription.context.clone();
    loop {
        let message_permit = tokio::select! {
            biased;
            _ = ctx.cancelled() => break,
            permit = subscription.messages.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        // The receiver stays locked until the message is in its lane, so lanes
        // see messages in queue order even with several pull loops.
        let mut receiver = tokio::select! {
            biased;
            _ = ctx.cancelled() => break,
            receiver = subscription.receiver.lock() => receiver,
        };
        let message = tokio::select! {
            biased;
            _ = ctx.cancelled() => break,
            message = receiver.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        let wanted = subscription.settings.byte_permits(message.data.len());
        let byte_permit = match subscription.bytes.clone().acquire_many_owned(wanted).await {
            Ok(permit) => permit,
            Err(_) => break,
        };

        let key = message.ordering_key.clone();
        let delivery = deliver(
            subscription.clone(),
            handler.clone(),
            message,
            (message_permit, byte_permit),
        );
        subscription.lanes.submit(key, delivery.boxed());
        drop(receiver);
    }
    debug!(worker, "Channel pull loop stopped");
}

async fn deliver(
    subscription: Arc<Subscription>,
    handler: Arc<dyn MessageHandler>,
    message: InboundMessage,
    permits: (OwnedSemaphorePermit, OwnedSemaphorePermit),
) {
    let result = handler
        .handle(subscription.context.clone(), message.clone())
        .await;
    drop(permits);

    match result {
        Ok(()) => {
            subscription.stats.acked.fetch_add(1, Ordering::SeqCst);
            debug!(message_id = %message.id, "Message acked");
        }
        Err(e) => nack(&subscription, message, e),
    }
}

fn nack(subscription: &Arc<Subscription>, mut message: InboundMessage, cause: BusError) {
    subscription.stats.nacked.fetch_add(1, Ordering::SeqCst);

    if message.delivery_attempt >= subscription.settings.max_delivery_attempts {
        subscription.stats.dead_lettered.fetch_add(1, Ordering::SeqCst);
        error!(
            message_id = %message.id,
            attempts = message.delivery_attempt,
            error = %cause,
            "Message dead-lettered after exhausting delivery attempts"
        );
        return;
    }

    warn!(
        message_id = %message.id,
        attempt = message.delivery_attempt,
        error = %cause,
        "Message nacked, scheduling redelivery"
    );

    let sender = subscription.sender.clone();
    let delay = Duration::from_millis(subscription.settings.redelivery_delay_ms);
    let ctx = subscription.context.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = ctx.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
        message.delivery_attempt += 1;
        if sender.send(message).await.is_err() {
            error!("Channel closed before redelivery");
        }
    });
}

#[async_trait]
impl EventBus for ChannelEventBus {
    async fn open_topic(&self) -> Result<Box<dyn TopicHandle>> {
        Ok(Box::new(ChannelTopic {
            sender: self.subscription.sender.clone(),
            open: AtomicBool::new(true),
        }))
    }

    async fn subscribe(&self, handler: Arc<dyn MessageHandler>) -> Result<()> {
        let mut slot = self.handler.write().await;
        if slot.is_some() {
            return Err(BusError::Subscribe(
                "channel subscription already has a handler".to_string(),
            ));
        }
        *slot = Some(handler);
        info!("Handler subscribed to channel bus");
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

        let workers = self.subscription.settings.num_workers.max(1);
        for worker in 0..workers {
            tokio::spawn(pull_loop(
                worker,
                self.subscription.clone(),
                handler.clone(),
            ));
        }

        info!(workers, "Channel consumer started");
        Ok(())
    }

    async fn shutdown(&self) {
        self.cancel.cancel();
        let stats = &self.subscription.stats;
        info!(
            acked = stats.acked(),
            nacked = stats.nacked(),
            dead_lettered = stats.dead_lettered(),
            "Channel event bus stopped"
        );
    }
}
