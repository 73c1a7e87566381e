//! activity-sync-standalone: Both halves in one process
//!
//! Runs the outbox publisher and the read-model synchronizer over the
//! in-process channel bus. Intended for local development with SQLite.
//!
//! ## Architecture
//! ```text
//! [outbox.db] -> [publisher] -> [channel bus] -> [dispatcher] -> [projector] -> [read_model.db]
//! ```

use std::sync::Arc;

use tracing::{error, info};

use activity_sync::bus::{ChannelEventBus, EventBus, MessagingType};
use activity_sync::config::Config;
use activity_sync::dispatcher::ShardedDispatcher;
use activity_sync::health::spawn_health_server;
use activity_sync::outbox::{spawn_publisher_task, OutboxPublisher};
use activity_sync::projector::ActivityProjector;
use activity_sync::storage::{init_outbox_store, init_read_model_store};
use activity_sync::utils::bootstrap::{init_tracing, parse_config_path};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    init_tracing();

    let config = Config::load(parse_config_path().as_deref()).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    if config.messaging.messaging_type != MessagingType::Channel {
        return Err("activity-sync-standalone requires 'messaging.type: channel'".into());
    }

    info!("Starting activity-sync-standalone");

    let outbox_store = init_outbox_store(&config.storage.outbox).await?;
    let read_store = init_read_model_store(&config.storage.read_model).await?;

    let bus: Arc<dyn EventBus> = Arc::new(ChannelEventBus::new(config.messaging.subscription.clone()));

    let projector = Arc::new(ActivityProjector::new(read_store.clone()));
    let dispatcher = Arc::new(ShardedDispatcher::new(config.dispatcher.clone(), projector)?);
    bus.subscribe(dispatcher.clone()).await?;
    bus.start_consuming().await?;

    let publisher = Arc::new(OutboxPublisher::new(outbox_store, bus.clone(), config.outbox.clone()));
    let publisher_task = spawn_publisher_task(publisher, config.outbox.poll_interval());

    let health = spawn_health_server(&config.health, read_store)?;

    info!("Standalone mode running. Press Ctrl+C to exit.");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    publisher_task.stop();
    publisher_task.join().await;
    bus.shutdown().await;
    dispatcher.shutdown().await;
    health.shutdown();

    Ok(())
}
