//! Shared storage integration tests.
//!
//! Tests the OutboxStore and ReadModelStore interfaces against all implementations.
//! Each implementation module imports these test functions and runs them.

pub mod outbox_store_tests;
pub mod read_model_store_tests;
