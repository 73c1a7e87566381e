//! activity-outbox-publisher: Outbox drain loop
//!
//! Publishes unpublished outbox rows to the activity event topic every poll
//! interval and marks them published.
//!
//! ## Architecture
//! ```text
//! [outbox table] -> [activity-outbox-publisher] -> [activity topic]
//! ```
//!
//! ## Configuration
//! - DATABASE_URL: outbox database (postgres://... or sqlite:...)
//! - OUTBOX_POLL_INTERVAL_SECONDS / OUTBOX_BATCH_SIZE
//! - ACTIVITY_SYNC_LOG: tracing filter (default: info)

use std::sync::Arc;

use tracing::{error, info};

use activity_sync::bus::init_event_bus;
use activity_sync::config::Config;
use activity_sync::outbox::{spawn_publisher_task, OutboxPublisher};
use activity_sync::storage::init_outbox_store;
use activity_sync::utils::bootstrap::{connect_with_retry, init_tracing, parse_config_path};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    init_tracing();

    let config = Config::load(parse_config_path().as_deref()).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!("Starting activity-outbox-publisher");

    let store = connect_with_retry("outbox store", || init_outbox_store(&config.storage.outbox)).await?;
    let bus = connect_with_retry("event bus", || init_event_bus(&config.messaging)).await?;

    let publisher = Arc::new(OutboxPublisher::new(store, bus.clone(), config.outbox.clone()));
    let task = spawn_publisher_task(publisher, config.outbox.poll_interval());

    info!(
        poll_interval_secs = config.outbox.poll_interval_secs,
        batch_size = config.outbox.batch_size,
        "Outbox publisher running. Press Ctrl+C to exit."
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    task.stop();
    task.join().await;
    bus.shutdown().await;

    Ok(())
}
