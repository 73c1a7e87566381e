//! ReadModelStore interface tests.
//!
//! These tests verify the contract of the ReadModelStore trait.
//! Each storage implementation should run these tests against an empty store.

use activity_sync::model::{ActivityPatch, ActivityReadModel, EventType};
use activity_sync::storage::{ReadModelStore, StorageError};

use crate::common::{activity_event, at};

fn record(aggregate_id: u64, created_hour: u32) -> ActivityReadModel {
    let mut event = activity_event(EventType::Create, aggregate_id, "original");
    event.created_at = Some(at(created_hour, 0));
    ActivityReadModel::from_event(&event, at(12, 0))
}

fn patch(description: &str) -> ActivityPatch {
    ActivityPatch {
        description: description.to_string(),
        employee_name: "Margaret".to_string(),
        urgency_title: "Flood".to_string(),
        urgency_level: "HIGH".to_string(),
        synced_at: at(13, 30),
    }
}

// =============================================================================
// upsert / get tests
// =============================================================================

pub async fn test_get_missing<S: ReadModelStore>(store: &S) {
    assert!(store.get("404").await.unwrap().is_none());
}

pub async fn test_upsert_and_get<S: ReadModelStore>(store: &S) {
    let record = record(1, 8);
    store.upsert(&record).await.expect("upsert should succeed");

    let stored = store.get("1").await.unwrap().expect("record should exist");
    assert_eq!(stored, record);
}

pub async fn test_upsert_replaces<S: ReadModelStore>(store: &S) {
    store.upsert(&record(2, 8)).await.unwrap();

    let mut replacement = record(2, 8);
    replacement.description = "replaced".to_string();
    store.upsert(&replacement).await.unwrap();

    let stored = store.get("2").await.unwrap().unwrap();
    assert_eq!(stored.description, "replaced");
    assert_eq!(stored.version, 1);
}

// =============================================================================
// patch tests
// =============================================================================

pub async fn test_patch_updates_fields_and_version<S: ReadModelStore>(store: &S) {
    let original = record(3, 8);
    store.upsert(&original).await.unwrap();

    let version = store.patch("3", &patch("first")).await.unwrap();
    assert_eq!(version, 2);
    let version = store.patch("3", &patch("second")).await.unwrap();
    assert_eq!(version, 3);

    let stored = store.get("3").await.unwrap().unwrap();
    assert_eq!(stored.description, "second");
    assert_eq!(stored.employee_name, "Margaret");
    assert_eq!(stored.urgency_level, "HIGH");
    assert_eq!(stored.synced_at, at(13, 30));
    assert_eq!(stored.version, 3);
    // Identity and creation fields are untouched.
    assert_eq!(stored.created_at, original.created_at);
    assert_eq!(stored.urgency_id, original.urgency_id);
    assert_eq!(stored.employee_id, original.employee_id);
}

pub async fn test_patch_missing<S: ReadModelStore>(store: &S) {
    let result = store.patch("405", &patch("nothing")).await;
    assert!(
        matches!(result, Err(StorageError::ReadModelNotFound(ref id)) if id == "405"),
        "unexpected result: {result:?}"
    );
    assert!(store.get("405").await.unwrap().is_none(), "patch must not create");
}

// =============================================================================
// delete tests
// =============================================================================

pub async fn test_delete_reports_existence<S: ReadModelStore>(store: &S) {
    store.upsert(&record(4, 8)).await.unwrap();

    assert!(store.delete("4").await.unwrap());
    assert!(!store.delete("4").await.unwrap());
    assert!(store.get("4").await.unwrap().is_none());
}

// =============================================================================
// list / ping tests
// =============================================================================

pub async fn test_list_newest_first<S: ReadModelStore>(store: &S) {
    store.upsert(&record(10, 7)).await.unwrap();
    store.upsert(&record(11, 9)).await.unwrap();
    store.upsert(&record(12, 8)).await.unwrap();

    let ids: Vec<String> = store
        .list(2)
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(ids, vec!["11".to_string(), "12".to_string()]);
}

pub async fn test_ping<S: ReadModelStore>(store: &S) {
    store.ping().await.expect("ping should succeed");
}

// =============================================================================
// Test runner macro
// =============================================================================

/// Run all ReadModelStore interface tests. `$make` builds a fresh, empty store.
#[macro_export]
macro_rules! run_read_model_store_tests {
    ($make:expr) => {
        use $crate::storage::read_model_store_tests::*;

        test_get_missing(&$make).await;
        println!("  test_get_missing: PASSED");

        test_upsert_and_get(&$make).await;
        println!("  test_upsert_and_get: PASSED");

        test_upsert_replaces(&$make).await;
        println!("  test_upsert_replaces: PASSED");

        test_patch_updates_fields_and_version(&$make).await;
        println!("  test_patch_updates_fields_and_version: PASSED");

        test_patch_missing(&$make).await;
        println!("  test_patch_missing: PASSED");

        test_delete_reports_existence(&$make).await;
        println!("  test_delete_reports_existence: PASSED");

        test_list_newest_first(&$make).await;
        println!("  test_list_newest_first: PASSED");

        test_ping(&$make).await;
        println!("  test_ping: PASSED");
    };
}
