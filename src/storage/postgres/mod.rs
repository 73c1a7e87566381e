//! PostgreSQL implementations of storage interfaces.
//!
//! Only the outbox lives in PostgreSQL: it shares the write side's database
//! so producers can append rows inside their own transactions.

mod outbox_store;

pub use outbox_store::PostgresOutboxStore;
