//! OutboxStore interface tests.
//!
//! These tests verify the contract of the OutboxStore trait.
//! Each storage implementation should run these tests against an empty store.

use activity_sync::model::{EventType, NewOutboxEvent};
use activity_sync::storage::{OutboxStore, StorageError};
use chrono::Utc;

fn row(aggregate_id: u64) -> NewOutboxEvent {
    crate::common::outbox_row(EventType::Create, aggregate_id, "contract")
}

// =============================================================================
// OutboxStore::append tests
// =============================================================================

pub async fn test_append_returns_unpublished_row<S: OutboxStore>(store: &S) {
    let stored = store.append(row(1)).await.expect("append should succeed");

    assert!(stored.id > 0, "id should be assigned");
    assert!(!stored.published);
    assert!(stored.published_at.is_none());
    assert_eq!(stored.event_type, "activity.created");
    assert_eq!(stored.aggregate_id, "activity-1");

    let fetched = store.fetch_unpublished(10).await.unwrap();
    assert_eq!(fetched, vec![stored], "fetched row should equal appended row");
}

pub async fn test_append_assigns_increasing_ids<S: OutboxStore>(store: &S) {
    let first = store.append(row(2)).await.unwrap();
    let second = store.append(row(3)).await.unwrap();
    assert!(second.id > first.id);
}

// =============================================================================
// OutboxStore::fetch_unpublished tests
// =============================================================================

pub async fn test_fetch_oldest_first<S: OutboxStore>(store: &S) {
    let mut appended = Vec::new();
    for id in 10..15 {
        appended.push(store.append(row(id)).await.unwrap().id);
    }

    let fetched: Vec<i64> = store
        .fetch_unpublished(100)
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(fetched, appended);
}

pub async fn test_fetch_respects_limit<S: OutboxStore>(store: &S) {
    for id in 20..25 {
        store.append(row(id)).await.unwrap();
    }
    assert_eq!(store.fetch_unpublished(2).await.unwrap().len(), 2);
}

// =============================================================================
// OutboxStore::mark_published tests
// =============================================================================

pub async fn test_mark_published_hides_row<S: OutboxStore>(store: &S) {
    let keep = store.append(row(30)).await.unwrap();
    let done = store.append(row(31)).await.unwrap();

    store
        .mark_published(done.id, Utc::now())
        .await
        .expect("mark should succeed");

    let fetched = store.fetch_unpublished(100).await.unwrap();
    assert_eq!(fetched.len(), 1);
    assert_eq!(fetched[0].id, keep.id);
}

pub async fn test_mark_unknown_row<S: OutboxStore>(store: &S) {
    let result = store.mark_published(987_654, Utc::now()).await;
    assert!(
        matches!(result, Err(StorageError::OutboxEventNotFound(987_654))),
        "unexpected result: {result:?}"
    );
}

// =============================================================================
// Test runner macro
// =============================================================================

/// Run all OutboxStore interface tests. `$make` builds a fresh, empty store.
#[macro_export]
macro_rules! run_outbox_store_tests {
    ($make:expr) => {
        use $crate::storage::outbox_store_tests::*;

        test_append_returns_unpublished_row(&$make).await;
        println!("  test_append_returns_unpublished_row: PASSED");

        test_append_assigns_increasing_ids(&$make).await;
        println!("  test_append_assigns_increasing_ids: PASSED");

        test_fetch_oldest_first(&$make).await;
        println!("  test_fetch_oldest_first: PASSED");

        test_fetch_respects_limit(&$make).await;
        println!("  test_fetch_respects_limit: PASSED");

        test_mark_published_hides_row(&$make).await;
        println!("  test_mark_published_hides_row: PASSED");

        test_mark_unknown_row(&$make).await;
        println!("  test_mark_unknown_row: PASSED");
    };
}
