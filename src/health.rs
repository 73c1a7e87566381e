//! Liveness probe for the read side.
//!
//! Serves the standard gRPC health protocol. A [`HealthMonitor`] pings the
//! read-model store once per interval and reports the overall service (`""`)
//! as `Serving` or `NotServing`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tonic::transport::Server;
use tonic_health::server::{health_reporter, HealthReporter};
use tonic_health::ServingStatus;
use tracing::{error, info, warn};

use crate::config::HealthConfig;
use crate::storage::ReadModelStore;

/// One probe: a single cheap store round trip.
pub async fn check_once(store: &dyn ReadModelStore) -> bool {
    match store.ping().await {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, "Read model store ping failed");
            false
        }
    }
}

/// Periodically probes the store and publishes the result.
pub struct HealthMonitor {
    store: Arc<dyn ReadModelStore>,
    reporter: HealthReporter,
    interval: Duration,
    serving: AtomicBool,
}

impl HealthMonitor {
    pub fn new(store: Arc<dyn ReadModelStore>, reporter: HealthReporter, interval: Duration) -> Self {
        Self {
            store,
            reporter,
            interval,
            serving: AtomicBool::new(false),
        }
    }

    /// Last reported status.
    pub fn is_serving(&self) -> bool {
        self.serving.load(Ordering::SeqCst)
    }

    /// Probe once and report. Returns the new status.
    pub async fn refresh(&self) -> bool {
        let healthy = check_once(self.store.as_ref()).await;
        let status = if healthy {
            ServingStatus::Serving
        } else {
            ServingStatus::NotServing
        };
        self.reporter.clone().set_service_status("", status).await;

        let was = self.serving.swap(healthy, Ordering::SeqCst);
        if was != healthy {
            info!(healthy, "Health status changed");
        }
        healthy
    }

    /// Probe immediately, then once per interval, until aborted.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                self.refresh().await;
                tokio::time::sleep(self.interval).await;
            }
        })
    }
}

/// Running health endpoint.
pub struct HealthServerHandle {
    pub monitor: Arc<HealthMonitor>,
    monitor_task: JoinHandle<()>,
    server_task: JoinHandle<()>,
}

impl HealthServerHandle {
    pub fn shutdown(&self) {
        self.monitor_task.abort();
        self.server_task.abort();
    }
}

/// Start the gRPC health server and its monitor.
pub fn spawn_health_server(
    config: &HealthConfig,
    store: Arc<dyn ReadModelStore>,
) -> Result<HealthServerHandle, std::net::AddrParseError> {
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let (reporter, health_service) = health_reporter();

    let monitor = Arc::new(HealthMonitor::new(
        store,
        reporter,
        Duration::from_secs(config.check_interval_secs),
    ));
    let monitor_task = monitor.clone().spawn();

    info!(%addr, "Health server listening");
    let server_task = tokio::spawn(async move {
        if let Err(e) = Server::builder()
            .add_service(health_service)
            .serve(addr)
            .await
        {
            error!(error = %e, "Health server failed");
        }
    });

    Ok(HealthServerHandle {
        monitor,
        monitor_task,
        server_task,
    })
}
