#![allow(clippy::expect_used, clippy::panic)]
//! Integration tests for fail-point injection.
//!
//! These tests require the `failpoints` feature:
//! ```bash
//! cargo test -p cursordb-storage --features failpoints --test failpoint_tests
//! ```

use cursordb_storage::{
    CursorPosition, DbError, KeyRange, Patch,
    testutil::{record_ids, seeded_storage},
};
use serde_json::json;

#[tokio::test]
async fn list_scan_failpoint_rejects_request() {
    let scenario = fail::FailScenario::setup();
    fail::cfg("memory-list-iter", "return").expect("failed to configure fail point");

    let storage = seeded_storage().await;
    let query = storage.from("articles").expect("query").order(&["rating"]).expect("order");
    let result = query.list(Some(2)).outcome().await;

    assert!(
        matches!(result, Err(DbError::Internal { .. })),
        "list should fail when fail point is active, got: {result:?}"
    );
    assert_eq!(query.position(), CursorPosition::Initial, "a failed page must not move the cursor");

    scenario.teardown();
}

#[tokio::test]
async fn list_scan_without_failpoint_succeeds() {
    let scenario = fail::FailScenario::setup();
    // No fail point configured; the scan runs normally.

    let storage = seeded_storage().await;
    let query = storage.from("articles").expect("query").order(&["rating"]).expect("order");
    let page = query.list(Some(2)).outcome().await.expect("list should succeed");

    assert_eq!(record_ids(&page), vec![4, 6]);

    scenario.teardown();
}

#[tokio::test]
async fn cursor_write_failpoint_rolls_back_patch() {
    let scenario = fail::FailScenario::setup();
    fail::cfg("memory-cursor-write", "1*off->return").expect("failed to configure fail point");

    let storage = seeded_storage().await;
    let query = storage
        .from("articles")
        .expect("query")
        .where_range("type", KeyRange::only("b"))
        .expect("where");
    let result = query.patch(Patch::field("rating", json!(0))).expect("patch").outcome().await;

    assert!(result.is_err(), "patch should fail when the second write fails");
    let ratings = storage.values_in("articles", None, None).outcome().await.expect("values");
    let untouched = ratings.as_array().expect("array").iter().all(|r| r["rating"] != json!(0));
    assert!(untouched, "the first write must be rolled back: {ratings}");

    scenario.teardown();
}

#[tokio::test]
async fn cursor_write_without_failpoint_succeeds() {
    let scenario = fail::FailScenario::setup();

    let storage = seeded_storage().await;
    let query = storage
        .from("articles")
        .expect("query")
        .where_range("type", KeyRange::only("b"))
        .expect("where");
    let patched = query.patch(Patch::field("rating", json!(0))).expect("patch").outcome().await;

    assert_eq!(patched.expect("patch should succeed"), json!(3));

    scenario.teardown();
}
