//! activity-sync - Outbox publisher and read-model synchronizer
//!
//! Moves activity mutations from the write side's transactional outbox onto
//! an event topic, and projects the delivered events into a denormalized
//! read model. Events for one activity are applied in order through a
//! sharded dispatcher; different activities proceed in parallel.

pub mod bus;
pub mod config;
pub mod dispatcher;
pub mod health;
pub mod model;
pub mod outbox;
pub mod parser;
pub mod projector;
pub mod storage;
pub mod utils;
