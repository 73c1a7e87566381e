//! activity-read-sync: Read model synchronizer
//!
//! Subscribes to the activity topic, parses each delivery and applies it to
//! the read model through the sharded dispatcher. A message is acked only
//! after its mutation is applied.
//!
//! ## Architecture
//! ```text
//! [activity topic] -> [subscription] -> [ShardedDispatcher] -> [ActivityProjector] -> [read model]
//! ```
//!
//! ## Configuration
//! - PUBSUB_PROJECT_ID / PUBSUB_SUBSCRIPTION / PUBSUB_NUM_WORKERS
//! - DISPATCHER_SHARD_COUNT / DISPATCHER_QUEUE_CAPACITY
//! - ACTIVITY_SYNC_LOG: tracing filter (default: info)

use std::sync::Arc;

use tracing::{error, info};

use activity_sync::bus::init_event_bus;
use activity_sync::config::Config;
use activity_sync::dispatcher::ShardedDispatcher;
use activity_sync::health::spawn_health_server;
use activity_sync::projector::ActivityProjector;
use activity_sync::storage::init_read_model_store;
use activity_sync::utils::bootstrap::{connect_with_retry, init_tracing, parse_config_path};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    init_tracing();

    let config = Config::load(parse_config_path().as_deref()).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!("Starting activity-read-sync");

    let store = connect_with_retry("read model store", || {
        init_read_model_store(&config.storage.read_model)
    })
    .await?;
    let bus = connect_with_retry("event bus", || init_event_bus(&config.messaging)).await?;

    let projector = Arc::new(ActivityProjector::new(store.clone()));
    let dispatcher = Arc::new(ShardedDispatcher::new(config.dispatcher.clone(), projector)?);

    bus.subscribe(dispatcher.clone()).await?;
    bus.start_consuming().await?;

    let health = spawn_health_server(&config.health, store)?;

    info!(
        shard_count = config.dispatcher.shard_count,
        num_workers = config.messaging.subscription.num_workers,
        "Read sync running. Press Ctrl+C to exit."
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    bus.shutdown().await;
    dispatcher.shutdown().await;
    health.shutdown();

    Ok(())
}
