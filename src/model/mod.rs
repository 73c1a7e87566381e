//! Domain types shared by the write side (outbox) and the read side (projection).
//!
//! - [`OutboxEvent`]: durable row written alongside a domain mutation
//! - [`DomainEvent`]: normalized, in-flight event produced by the parser
//! - [`ActivityReadModel`]: denormalized record owned by the projector

mod event;
mod outbox;
mod read_model;

pub use event::{DomainEvent, EventType};
pub use outbox::{NewOutboxEvent, OutboxEnvelope, OutboxEvent, AGGREGATE_ID_PREFIX};
pub use read_model::{ActivityPatch, ActivityReadModel};
