//! Storage configuration types.

use serde::Deserialize;

/// Outbox storage type discriminator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboxStorageType {
    Memory,
    #[default]
    Sqlite,
    Postgres,
}

/// Read-model storage type discriminator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadModelStorageType {
    Memory,
    #[default]
    Sqlite,
}

/// Both stores the pipeline touches.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub outbox: OutboxStorageConfig,
    pub read_model: ReadModelStorageConfig,
}

/// Outbox storage configuration (discriminated union).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutboxStorageConfig {
    #[serde(rename = "type")]
    pub storage_type: OutboxStorageType,
    pub sqlite: SqliteConfig,
    pub postgres: PostgresConfig,
}

impl Default for OutboxStorageConfig {
    fn default() -> Self {
        Self {
            storage_type: OutboxStorageType::Sqlite,
            sqlite: SqliteConfig {
                path: "./data/outbox.db".to_string(),
            },
            postgres: PostgresConfig::default(),
        }
    }
}

/// Read-model storage configuration (discriminated union).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReadModelStorageConfig {
    #[serde(rename = "type")]
    pub storage_type: ReadModelStorageType,
    pub sqlite: SqliteConfig,
}

impl Default for ReadModelStorageConfig {
    fn default() -> Self {
        Self {
            storage_type: ReadModelStorageType::Sqlite,
            sqlite: SqliteConfig {
                path: "./data/read_model.db".to_string(),
            },
        }
    }
}

/// SQLite-specific configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SqliteConfig {
    /// Path to database file, or `:memory:`.
    pub path: String,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            path: "./data/activity.db".to_string(),
        }
    }
}

/// PostgreSQL-specific configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PostgresConfig {
    /// PostgreSQL connection URI.
    pub uri: String,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            uri: "postgres://localhost:5432/activities".to_string(),
        }
    }
}
