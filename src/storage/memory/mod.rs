//! In-memory storage implementations.
//!
//! Used by the standalone binary when no database is configured and by tests,
//! which can inject failures through the `set_fail_*` hooks.

mod outbox_store;
mod read_model_store;

pub use outbox_store::InMemoryOutboxStore;
pub use read_model_store::InMemoryReadModelStore;
