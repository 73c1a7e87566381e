//! Health endpoint configuration.

use serde::Deserialize;

/// Health check server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Host to bind to.
    pub host: String,
    /// Port for the gRPC health service.
    pub port: u16,
    /// Seconds between read-store probes.
    pub check_interval_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8081,
            check_interval_secs: 15,
        }
    }
}
