//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

use activity_sync::model::{DomainEvent, EventType, NewOutboxEvent};

/// Default wait for asynchronous convergence.
pub const CONVERGE_TIMEOUT: Duration = Duration::from_secs(5);

/// Fixed, whole-second timestamp (round trips through every store exactly).
pub fn at(hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, hour, minute, 0).unwrap()
}

/// Domain event with predictable display fields.
pub fn activity_event(event_type: EventType, aggregate_id: u64, description: &str) -> DomainEvent {
    DomainEvent {
        event_type,
        aggregate_id,
        urgency_id: 3,
        employee_id: 5,
        description: description.to_string(),
        created_at: Some(at(9, 0)),
        employee_name: "Linus".to_string(),
        urgency_title: "Broken pipe".to_string(),
        urgency_level: "MEDIUM".to_string(),
    }
}

/// Outbox row for an activity mutation.
pub fn outbox_row(event_type: EventType, aggregate_id: u64, description: &str) -> NewOutboxEvent {
    NewOutboxEvent::for_activity(&activity_event(event_type, aggregate_id, description))
        .expect("event should serialize")
}

/// Poll `check` until it returns true or the timeout elapses.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
