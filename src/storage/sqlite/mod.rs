//! SQLite implementations of storage interfaces.

mod outbox_store;
mod read_model_store;

pub use outbox_store::SqliteOutboxStore;
pub use read_model_store::SqliteReadModelStore;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

/// Open a pool for a database file (created if missing).
///
/// `":memory:"` yields a single-connection pool, since every SQLite
/// connection to `:memory:` gets its own private database.
pub async fn connect(path: &str) -> Result<SqlitePool, sqlx::Error> {
    if path == ":memory:" {
        return SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await;
    }

    if let Some(parent) = std::path::Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true);
    SqlitePoolOptions::new().connect_with(options).await
}
