//! Sharded ordering dispatcher.
//!
//! Every inbound message is parsed, routed to one of `shard_count` bounded
//! queues by a hash of its aggregate id, and applied by the single worker
//! that drains that queue. Items for the same aggregate therefore apply in
//! enqueue order, while different shards run in parallel on the runtime's
//! thread pool.
//!
//! The queues are private to the dispatcher. The only way in is
//! [`ShardedDispatcher::process`].

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bus::{BusError, DeliveryContext, InboundMessage, MessageHandler};
use crate::config::ConfigError;
use crate::model::DomainEvent;
use crate::parser::{parse, ParseError, Strategy};
use crate::projector::{Applier, ApplyError, ApplyOutcome};

/// Dispatcher sizing and timeouts.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Number of (queue, worker) pairs.
    pub shard_count: usize,
    /// Capacity of each shard's queue.
    pub queue_capacity: usize,
    /// How long `process` waits for queue space. 0 waits indefinitely.
    pub enqueue_timeout_ms: u64,
    /// How long `process` waits for the apply result. 0 waits indefinitely.
    pub work_timeout_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            shard_count: 8,
            queue_capacity: 1024,
            enqueue_timeout_ms: 5_000,
            work_timeout_ms: 30_000,
        }
    }
}

impl DispatcherConfig {
    /// No enqueue or work timeout.
    pub fn unbounded(shard_count: usize, queue_capacity: usize) -> Self {
        Self {
            shard_count,
            queue_capacity,
            enqueue_timeout_ms: 0,
            work_timeout_ms: 0,
        }
    }

    pub fn enqueue_timeout(&self) -> Option<Duration> {
        millis(self.enqueue_timeout_ms)
    }

    pub fn work_timeout(&self) -> Option<Duration> {
        millis(self.work_timeout_ms)
    }
}

fn millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

/// Why a message was not processed.
///
/// Each variant is distinct so the subscriber can decide on ack/nack.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Parse failed: {0}")]
    Parse(#[from] ParseError),

    #[error("Shard {shard} queue still full after {waited:?}")]
    EnqueueTimeout { shard: usize, waited: Duration },

    #[error("Delivery cancelled before enqueue on shard {shard}")]
    CanceledBeforeEnqueue { shard: usize },

    #[error("Shard {shard} did not finish within {waited:?}")]
    WorkTimeout { shard: usize, waited: Duration },

    #[error("Delivery cancelled while waiting on shard {shard}")]
    CanceledWhileWaiting { shard: usize },

    #[error("Shard {shard} is closed")]
    ShardClosed { shard: usize },

    #[error("Apply failed: {0}")]
    Apply(#[from] ApplyError),
}

impl DispatchError {
    /// Whether the work may still have been applied.
    ///
    /// Once an item is enqueued its worker applies it even if the caller
    /// stopped waiting.
    pub fn applied_maybe(&self) -> bool {
        matches!(
            self,
            Self::WorkTimeout { .. } | Self::CanceledWhileWaiting { .. }
        )
    }
}

/// A message that went through parse, routing and apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Processed {
    pub strategy: Strategy,
    pub shard: usize,
    pub outcome: ApplyOutcome,
}

struct WorkItem {
    event: DomainEvent,
    result: oneshot::Sender<Result<ApplyOutcome, ApplyError>>,
}

/// Routes events to per-shard workers, preserving per-aggregate order.
pub struct ShardedDispatcher {
    config: DispatcherConfig,
    queues: RwLock<Vec<mpsc::Sender<WorkItem>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ShardedDispatcher {
    /// Create the queues and spawn one worker per shard.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: DispatcherConfig, applier: Arc<dyn Applier>) -> Result<Self, ConfigError> {
        if config.shard_count == 0 {
            return Err(ConfigError::Invalid("dispatcher.shard_count must be >= 1".into()));
        }
        if config.queue_capacity == 0 {
            return Err(ConfigError::Invalid("dispatcher.queue_capacity must be >= 1".into()));
        }

        let mut queues = Vec::with_capacity(config.shard_count);
        let mut workers = Vec::with_capacity(config.shard_count);
        for shard in 0..config.shard_count {
            let (sender, receiver) = mpsc::channel(config.queue_capacity);
            queues.push(sender);
            workers.push(tokio::spawn(run_shard(shard, receiver, applier.clone())));
        }

        info!(
            shard_count = config.shard_count,
            queue_capacity = config.queue_capacity,
            enqueue_timeout = ?config.enqueue_timeout(),
            work_timeout = ?config.work_timeout(),
            "Sharded dispatcher started"
        );

        Ok(Self {
            config,
            queues: RwLock::new(queues),
            workers: Mutex::new(workers),
        })
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Parse, route, enqueue and wait for the apply result of one message.
    #[tracing::instrument(
        name = "dispatcher.process",
        skip_all,
        fields(message_id = %message.id, attempt = message.delivery_attempt)
    )]
    pub async fn process(
        &self,
        ctx: &DeliveryContext,
        message: &InboundMessage,
    ) -> Result<Processed, DispatchError> {
        let parsed = parse(&message.data, &message.attributes)?;
        let strategy = parsed.strategy;
        let key = routing_key(&parsed.event, &message.id);
        let shard = shard_index(&key, self.config.shard_count);

        debug!(
            aggregate_id = parsed.event.aggregate_id,
            event_type = %parsed.event.event_type,
            %strategy,
            shard,
            "Routing event"
        );

        let queue = self
            .queues
            .read()
            .await
            .get(shard)
            .cloned()
            .ok_or(DispatchError::ShardClosed { shard })?;

        let (result_tx, result_rx) = oneshot::channel();
        let item = WorkItem {
            event: parsed.event,
            result: result_tx,
        };

        let enqueue_timeout = self.config.enqueue_timeout();
        let enqueued = tokio::select! {
            biased;
            _ = ctx.cancelled() => return Err(DispatchError::CanceledBeforeEnqueue { shard }),
            sent = with_timeout(enqueue_timeout, queue.send(item)) => sent,
        };
        match enqueued {
            None => {
                return Err(DispatchError::EnqueueTimeout {
                    shard,
                    waited: enqueue_timeout.unwrap_or_default(),
                })
            }
            Some(Err(_)) => return Err(DispatchError::ShardClosed { shard }),
            Some(Ok(())) => {}
        }

        let work_timeout = self.config.work_timeout();
        let finished = tokio::select! {
            biased;
            result = with_timeout(work_timeout, result_rx) => result,
            _ = ctx.cancelled() => return Err(DispatchError::CanceledWhileWaiting { shard }),
        };
        match finished {
            None => Err(DispatchError::WorkTimeout {
                shard,
                waited: work_timeout.unwrap_or_default(),
            }),
            Some(Err(_)) => Err(DispatchError::ShardClosed { shard }),
            Some(Ok(Err(e))) => Err(DispatchError::Apply(e)),
            Some(Ok(Ok(outcome))) => Ok(Processed {
                strategy,
                shard,
                outcome,
            }),
        }
    }

    /// Close every queue and wait for the workers to drain what is left.
    pub async fn shutdown(&self) {
        drop(std::mem::take(&mut *self.queues.write().await));

        let workers = std::mem::take(&mut *self.workers.lock().await);
        for (shard, worker) in workers.into_iter().enumerate() {
            if let Err(e) = worker.await {
                error!(shard, error = %e, "Shard worker ended abnormally");
            }
        }
        info!("Sharded dispatcher stopped");
    }
}

/// Shard key: the aggregate id, or the transport message id when the event
/// carries none.
fn routing_key(event: &DomainEvent, message_id: &str) -> String {
    if event.aggregate_id != 0 {
        event.read_key()
    } else {
        message_id.to_string()
    }
}

/// Stable shard for `key`: first 8 bytes of SHA-256, big-endian, modulo count.
pub fn shard_index(key: &str, shard_count: usize) -> usize {
    let digest = Sha256::digest(key.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % shard_count.max(1) as u64) as usize
}

async fn with_timeout<F: Future>(limit: Option<Duration>, fut: F) -> Option<F::Output> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut).await.ok(),
        None => Some(fut.await),
    }
}

async fn run_shard(shard: usize, mut queue: mpsc::Receiver<WorkItem>, applier: Arc<dyn Applier>) {
    while let Some(item) = queue.recv().await {
        let aggregate_id = item.event.aggregate_id;

        // Fault boundary: a panicking apply must not take the shard down.
        let result = AssertUnwindSafe(applier.apply(&item.event))
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| Err(ApplyError::Panicked(panic_message(payload.as_ref()))));

        if let Err(e) = &result {
            warn!(shard, aggregate_id, error = %e, "Apply failed");
        }
        if item.result.send(result).is_err() {
            debug!(shard, aggregate_id, "Caller stopped waiting; apply result discarded");
        }
    }
    debug!(shard, "Shard worker stopped");
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[async_trait]
impl MessageHandler for ShardedDispatcher {
    async fn handle(&self, ctx: DeliveryContext, message: InboundMessage) -> Result<(), BusError> {
        match self.process(&ctx, &message).await {
            Ok(processed) => {
                debug!(
                    message_id = %message.id,
                    shard = processed.shard,
                    strategy = %processed.strategy,
                    outcome = ?processed.outcome,
                    "Message applied"
                );
                Ok(())
            }
            Err(e) => {
                warn!(
                    message_id = %message.id,
                    attempt = message.delivery_attempt,
                    applied_maybe = e.applied_maybe(),
                    error = %e,
                    "Message not processed, nacking"
                );
                Err(BusError::HandlerFailed {
                    message: e.to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests;
