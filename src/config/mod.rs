//! Application configuration.
//!
//! Aggregates configuration from all modules into a single Config struct
//! that can be loaded from YAML files or environment variables.

mod server;
mod storage;

pub use server::HealthConfig;
pub use storage::{
    OutboxStorageConfig, OutboxStorageType, PostgresConfig, ReadModelStorageConfig,
    ReadModelStorageType, SqliteConfig, StorageConfig,
};

use std::str::FromStr;

use serde::Deserialize;

use crate::bus::MessagingConfig;
use crate::dispatcher::DispatcherConfig;
use crate::outbox::PublisherConfig;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "ACTIVITY_SYNC_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "ACTIVITY_SYNC";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "ACTIVITY_SYNC_LOG";

/// Environment variable for the outbox poll interval.
pub const OUTBOX_POLL_INTERVAL_ENV_VAR: &str = "OUTBOX_POLL_INTERVAL_SECONDS";
/// Environment variable for the outbox batch size.
pub const OUTBOX_BATCH_SIZE_ENV_VAR: &str = "OUTBOX_BATCH_SIZE";
/// Environment variable for the subscriber's outstanding message limit.
pub const MAX_OUTSTANDING_MESSAGES_ENV_VAR: &str = "PUBSUB_MAX_OUTSTANDING_MESSAGES";
/// Environment variable for the subscriber's outstanding byte limit.
pub const MAX_OUTSTANDING_BYTES_ENV_VAR: &str = "PUBSUB_MAX_OUTSTANDING_BYTES";
/// Environment variable for the subscriber's pull worker count.
pub const NUM_WORKERS_ENV_VAR: &str = "PUBSUB_NUM_WORKERS";
/// Environment variable for the dispatcher shard count.
pub const SHARD_COUNT_ENV_VAR: &str = "DISPATCHER_SHARD_COUNT";
/// Environment variable for the per-shard queue capacity.
pub const QUEUE_CAPACITY_ENV_VAR: &str = "DISPATCHER_QUEUE_CAPACITY";
/// Environment variable for the enqueue timeout (milliseconds, 0 = unbounded).
pub const ENQUEUE_TIMEOUT_ENV_VAR: &str = "DISPATCHER_ENQUEUE_TIMEOUT_MS";
/// Environment variable for the work timeout (milliseconds, 0 = unbounded).
pub const WORK_TIMEOUT_ENV_VAR: &str = "DISPATCHER_WORK_TIMEOUT_MS";
/// Environment variable for the outbox database URL.
pub const DATABASE_URL_ENV_VAR: &str = "DATABASE_URL";
/// Environment variable for the GCP project.
pub const PUBSUB_PROJECT_ID_ENV_VAR: &str = "PUBSUB_PROJECT_ID";
/// Environment variable for the Pub/Sub topic.
pub const PUBSUB_TOPIC_ENV_VAR: &str = "PUBSUB_TOPIC";
/// Environment variable for the Pub/Sub subscription.
pub const PUBSUB_SUBSCRIPTION_ENV_VAR: &str = "PUBSUB_SUBSCRIPTION";

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load config: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid value '{value}' for {name}: {message}")]
    InvalidEnv {
        name: String,
        value: String,
        message: String,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Outbox publisher loop.
    pub outbox: PublisherConfig,
    /// Transport and subscription settings.
    pub messaging: MessagingConfig,
    /// Sharded dispatcher.
    pub dispatcher: DispatcherConfig,
    /// Outbox and read-model stores.
    pub storage: StorageConfig,
    /// Health endpoint.
    pub health: HealthConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `config.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    /// 5. Flat deployment variables (`OUTBOX_POLL_INTERVAL_SECONDS`, ...)
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut config: Config = config.try_deserialize()?;
        config.apply_env_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply flat environment-style overrides.
    ///
    /// `lookup` resolves a variable name; unset variables leave the value alone.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = parse_var(&lookup, OUTBOX_POLL_INTERVAL_ENV_VAR)? {
            self.outbox.poll_interval_secs = v;
        }
        if let Some(v) = parse_var(&lookup, OUTBOX_BATCH_SIZE_ENV_VAR)? {
            self.outbox.batch_size = v;
        }

        let subscription = &mut self.messaging.subscription;
        if let Some(v) = parse_var(&lookup, MAX_OUTSTANDING_MESSAGES_ENV_VAR)? {
            subscription.max_outstanding_messages = v;
        }
        if let Some(v) = parse_var(&lookup, MAX_OUTSTANDING_BYTES_ENV_VAR)? {
            subscription.max_outstanding_bytes = v;
        }
        if let Some(v) = parse_var(&lookup, NUM_WORKERS_ENV_VAR)? {
            subscription.num_workers = v;
        }

        if let Some(v) = parse_var(&lookup, SHARD_COUNT_ENV_VAR)? {
            self.dispatcher.shard_count = v;
        }
        if let Some(v) = parse_var(&lookup, QUEUE_CAPACITY_ENV_VAR)? {
            self.dispatcher.queue_capacity = v;
        }
        if let Some(v) = parse_var(&lookup, ENQUEUE_TIMEOUT_ENV_VAR)? {
            self.dispatcher.enqueue_timeout_ms = v;
        }
        if let Some(v) = parse_var(&lookup, WORK_TIMEOUT_ENV_VAR)? {
            self.dispatcher.work_timeout_ms = v;
        }

        if let Some(url) = lookup(DATABASE_URL_ENV_VAR) {
            self.apply_database_url(&url)?;
        }

        let pubsub = &mut self.messaging.pubsub;
        if let Some(v) = lookup(PUBSUB_PROJECT_ID_ENV_VAR) {
            pubsub.project_id = v;
        }
        if let Some(v) = lookup(PUBSUB_TOPIC_ENV_VAR) {
            pubsub.topic = v;
        }
        if let Some(v) = lookup(PUBSUB_SUBSCRIPTION_ENV_VAR) {
            pubsub.subscription = v;
        }

        Ok(())
    }

    /// Point the outbox store at `DATABASE_URL`.
    ///
    /// `postgres://` / `postgresql://` select PostgreSQL, `sqlite:` selects SQLite.
    fn apply_database_url(&mut self, url: &str) -> Result<(), ConfigError> {
        let outbox = &mut self.storage.outbox;
        if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            outbox.storage_type = OutboxStorageType::Postgres;
            outbox.postgres.uri = url.to_string();
        } else if let Some(path) = url.strip_prefix("sqlite:") {
            outbox.storage_type = OutboxStorageType::Sqlite;
            outbox.sqlite.path = path.trim_start_matches("//").to_string();
        } else {
            return Err(ConfigError::InvalidEnv {
                name: DATABASE_URL_ENV_VAR.to_string(),
                value: url.to_string(),
                message: "expected a postgres:// or sqlite: URL".to_string(),
            });
        }
        Ok(())
    }

    /// Reject values that would leave a component unable to make progress.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.outbox.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid("outbox.poll_interval_secs must be >= 1".into()));
        }
        if self.outbox.batch_size == 0 {
            return Err(ConfigError::Invalid("outbox.batch_size must be >= 1".into()));
        }
        if self.dispatcher.shard_count == 0 {
            return Err(ConfigError::Invalid("dispatcher.shard_count must be >= 1".into()));
        }
        if self.dispatcher.queue_capacity == 0 {
            return Err(ConfigError::Invalid("dispatcher.queue_capacity must be >= 1".into()));
        }
        let subscription = &self.messaging.subscription;
        if subscription.num_workers == 0 {
            return Err(ConfigError::Invalid("messaging.subscription.num_workers must be >= 1".into()));
        }
        if subscription.max_outstanding_messages == 0 {
            return Err(ConfigError::Invalid(
                "messaging.subscription.max_outstanding_messages must be >= 1".into(),
            ));
        }
        if self.health.check_interval_secs == 0 {
            return Err(ConfigError::Invalid("health.check_interval_secs must be >= 1".into()));
        }
        Ok(())
    }
}

fn parse_var<F, T>(lookup: &F, name: &str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let Some(raw) = lookup(name) else {
        return Ok(None);
    };
    raw.trim()
        .parse()
        .map(Some)
        .map_err(|e: T::Err| ConfigError::InvalidEnv {
            name: name.to_string(),
            value: raw.clone(),
            message: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use serial_test::serial;

    use super::*;
    use crate::bus::MessagingType;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.outbox.poll_interval_secs, 10);
        assert_eq!(config.outbox.batch_size, 100);
        assert_eq!(config.dispatcher.shard_count, 8);
        assert_eq!(config.dispatcher.queue_capacity, 1024);
        assert_eq!(config.messaging.messaging_type, MessagingType::Channel);
        assert_eq!(config.messaging.subscription.max_outstanding_messages, 1000);
        assert_eq!(config.messaging.subscription.num_workers, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides_apply() {
        let mut config = Config::default();
        config
            .apply_env_overrides(lookup_from(&[
                (OUTBOX_POLL_INTERVAL_ENV_VAR, "3"),
                (OUTBOX_BATCH_SIZE_ENV_VAR, "25"),
                (MAX_OUTSTANDING_MESSAGES_ENV_VAR, "50"),
                (MAX_OUTSTANDING_BYTES_ENV_VAR, "1048576"),
                (NUM_WORKERS_ENV_VAR, "2"),
                (SHARD_COUNT_ENV_VAR, "16"),
                (QUEUE_CAPACITY_ENV_VAR, "64"),
                (ENQUEUE_TIMEOUT_ENV_VAR, "0"),
                (WORK_TIMEOUT_ENV_VAR, "1500"),
                (PUBSUB_PROJECT_ID_ENV_VAR, "acme"),
                (PUBSUB_TOPIC_ENV_VAR, "activities"),
                (PUBSUB_SUBSCRIPTION_ENV_VAR, "activities-read"),
            ]))
            .unwrap();

        assert_eq!(config.outbox.poll_interval_secs, 3);
        assert_eq!(config.outbox.batch_size, 25);
        assert_eq!(config.messaging.subscription.max_outstanding_messages, 50);
        assert_eq!(config.messaging.subscription.max_outstanding_bytes, 1_048_576);
        assert_eq!(config.messaging.subscription.num_workers, 2);
        assert_eq!(config.dispatcher.shard_count, 16);
        assert_eq!(config.dispatcher.queue_capacity, 64);
        assert_eq!(config.dispatcher.enqueue_timeout(), None);
        assert_eq!(
            config.dispatcher.work_timeout(),
            Some(std::time::Duration::from_millis(1500))
        );
        assert_eq!(config.messaging.pubsub.project_id, "acme");
        assert_eq!(config.messaging.pubsub.topic, "activities");
        assert_eq!(config.messaging.pubsub.subscription, "activities-read");
    }

    #[test]
    fn test_env_override_rejects_garbage() {
        let mut config = Config::default();
        let err = config
            .apply_env_overrides(lookup_from(&[(SHARD_COUNT_ENV_VAR, "eight")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { ref name, .. } if name == SHARD_COUNT_ENV_VAR));
    }

    #[test]
    fn test_database_url_selects_outbox_backend() {
        let mut config = Config::default();
        config
            .apply_env_overrides(lookup_from(&[(DATABASE_URL_ENV_VAR, "postgres://db:5432/app")]))
            .unwrap();
        assert_eq!(config.storage.outbox.storage_type, OutboxStorageType::Postgres);
        assert_eq!(config.storage.outbox.postgres.uri, "postgres://db:5432/app");

        config
            .apply_env_overrides(lookup_from(&[(DATABASE_URL_ENV_VAR, "sqlite://./data/app.db")]))
            .unwrap();
        assert_eq!(config.storage.outbox.storage_type, OutboxStorageType::Sqlite);
        assert_eq!(config.storage.outbox.sqlite.path, "./data/app.db");

        assert!(config
            .apply_env_overrides(lookup_from(&[(DATABASE_URL_ENV_VAR, "mysql://db/app")]))
            .is_err());
    }

    #[test]
    fn test_validate_rejects_zero_shards_and_capacity() {
        let mut config = Config::default();
        config.dispatcher.shard_count = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Config::default();
        config.dispatcher.queue_capacity = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Config::default();
        config.outbox.batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_yaml_sections() {
        let yaml = r#"
outbox:
  poll_interval_secs: 5
  batch_size: 10
messaging:
  type: pubsub
  pubsub:
    project_id: acme
    topic: activity-events
    subscription: activity-read-sync
dispatcher:
  shard_count: 4
storage:
  outbox:
    type: memory
  read_model:
    type: memory
health:
  port: 9090
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.outbox.poll_interval_secs, 5);
        assert_eq!(config.messaging.messaging_type, MessagingType::Pubsub);
        assert_eq!(config.messaging.pubsub.topic, "activity-events");
        assert_eq!(config.dispatcher.shard_count, 4);
        assert_eq!(config.dispatcher.queue_capacity, 1024);
        assert_eq!(config.storage.outbox.storage_type, OutboxStorageType::Memory);
        assert_eq!(config.storage.read_model.storage_type, ReadModelStorageType::Memory);
        assert_eq!(config.health.port, 9090);
    }

    #[test]
    #[serial]
    fn test_load_reads_prefixed_environment() {
        std::env::set_var("ACTIVITY_SYNC__DISPATCHER__SHARD_COUNT", "3");
        std::env::set_var(OUTBOX_BATCH_SIZE_ENV_VAR, "7");
        let loaded = Config::load(None);
        std::env::remove_var("ACTIVITY_SYNC__DISPATCHER__SHARD_COUNT");
        std::env::remove_var(OUTBOX_BATCH_SIZE_ENV_VAR);

        let config = loaded.unwrap();
        assert_eq!(config.dispatcher.shard_count, 3);
        assert_eq!(config.outbox.batch_size, 7);
    }
}
