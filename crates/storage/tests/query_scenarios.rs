//! End-to-end query scenarios over the memory back-end: filtering,
//! conjunctions, pagination resume and SQL execution.

#![allow(clippy::expect_used, clippy::panic, clippy::unwrap_used)]

use cursordb_storage::{
    DatabaseSchema, DbIterator, IndexSchema, KeyRange, QueryType, Storage, StoreSchema,
    assert_argument_error,
    sql::{Aggregate, SqlStatement},
    testutil::{memory_storage, record_ids, seeded_storage},
};
use serde_json::{Value, json};

fn items_schema() -> DatabaseSchema {
    DatabaseSchema::new(vec![
        StoreSchema::new("items", "id")
            .with_index(IndexSchema::new("type", "type"))
            .with_index(IndexSchema::new("rating", "rating")),
    ])
}

async fn items(records: Vec<Value>) -> Storage {
    let storage = memory_storage(items_schema());
    storage.put_all("items", records).outcome().await.expect("seed");
    storage
}

// ============================================================================
// Filtering
// ============================================================================

#[tokio::test]
async fn equality_on_index_lists_matches_in_key_order() {
    let storage = items(vec![
        json!({"id": 1, "type": "a"}),
        json!({"id": 2, "type": "b"}),
        json!({"id": 3, "type": "a"}),
    ])
    .await;

    let query = storage.from("items").unwrap().where_("type", "=", "a", None, None).unwrap();
    let listed = query.list(None).outcome().await.expect("list");

    assert_eq!(listed, json!([{"id": 1, "type": "a"}, {"id": 3, "type": "a"}]));
}

#[tokio::test]
async fn unindexed_field_is_rejected_synchronously() {
    let storage = seeded_storage().await;
    let query = storage.from("articles").unwrap();
    assert_argument_error!(query.where_("author", "=", "ann", None, None));
    assert_argument_error!(storage.from("missing"), "unknown store");
}

#[tokio::test]
async fn conjunction_lists_intersection() {
    let storage = seeded_storage().await;
    let query = storage
        .from("articles")
        .unwrap()
        .where_("type", "=", "b", None, None)
        .unwrap()
        .where_("rating", ">=", 3, None, None)
        .unwrap();

    assert!(query.is_conjunction());
    assert_eq!(record_ids(&query.list(None).outcome().await.expect("list")), vec![2, 5]);
    assert_eq!(query.count().outcome().await.expect("count"), json!(2));
}

#[tokio::test]
async fn and_puts_other_iterators_first() {
    let storage = seeded_storage().await;
    let from = storage.from("articles").unwrap();
    let a = from.where_("type", "=", "a", None, None).unwrap();
    let b = from.where_range("rating", KeyRange::lower_bound(4, false)).unwrap();

    let combined = a.and(&b).unwrap();

    let expected: Vec<DbIterator> = b.iterators().into_iter().chain(a.iterators()).collect();
    assert_eq!(combined.iterators(), expected);
    assert_eq!(record_ids(&combined.list(None).outcome().await.expect("list")), vec![1, 3]);
}

#[tokio::test]
async fn select_primary_keys_of_index_scan() {
    let storage = seeded_storage().await;
    let query = storage.from("articles").unwrap().where_range("tags", KeyRange::only("y")).unwrap();
    let keys = query.select(&["id"]).unwrap();

    assert_eq!(keys.kind(), QueryType::PrimaryKeys);
    assert_eq!(keys.list(None).outcome().await.expect("list"), json!([1, 2]));
    assert_argument_error!(query.select(&["id", "type", "rating"]));
}

// ============================================================================
// Pagination
// ============================================================================

#[tokio::test]
async fn repeated_list_resumes_without_gaps() {
    let storage = seeded_storage().await;
    let query = storage.from("articles").unwrap();

    let mut pages = Vec::new();
    for _ in 0..5 {
        pages.push(record_ids(&query.list(Some(2)).outcome().await.expect("page")));
    }

    assert_eq!(pages, vec![vec![1, 2], vec![3, 4], vec![5, 6], vec![7], vec![]]);
}

#[tokio::test]
async fn copies_paginate_independently() {
    let storage = seeded_storage().await;
    let query = storage.from("articles").unwrap().order(&["rating"]).unwrap();

    assert_eq!(record_ids(&query.list(Some(3)).outcome().await.unwrap()), vec![4, 6, 2]);
    let fresh = query.copy();
    assert_eq!(record_ids(&query.list(Some(3)).outcome().await.unwrap()), vec![7, 3, 1]);
    assert_eq!(record_ids(&fresh.list(Some(3)).outcome().await.unwrap()), vec![4, 6, 2]);
}

mod proptests {
    use proptest::prelude::*;

    use super::*;

    proptest! {
        /// Paging an index scan with a fixed limit visits every record
        /// exactly once, in scan order.
        #[test]
        fn paging_visits_each_record_once(
            ratings in proptest::collection::vec(0i64..5, 0..25),
            limit in 1usize..6,
            reverse in any::<bool>(),
        ) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("runtime");

            rt.block_on(async {
                let records: Vec<Value> = ratings
                    .iter()
                    .enumerate()
                    .map(|(i, rating)| json!({"id": i + 1, "rating": rating}))
                    .collect();
                let storage = items(records).await;

                let mut expected: Vec<(i64, i64)> =
                    ratings.iter().enumerate().map(|(i, r)| (*r, i as i64 + 1)).collect();
                expected.sort_unstable();
                if reverse {
                    expected.reverse();
                }
                let expected: Vec<i64> = expected.into_iter().map(|(_, id)| id).collect();

                let mut query = storage.from("items").unwrap().order(&["rating"]).unwrap();
                if reverse {
                    query = query.reverse().unwrap();
                }

                let mut seen = Vec::new();
                for _ in 0..=ratings.len() + 1 {
                    let page = record_ids(&query.list(Some(limit)).outcome().await.unwrap());
                    prop_assert!(page.len() <= limit);
                    if page.is_empty() {
                        break;
                    }
                    seen.extend(page);
                }
                prop_assert_eq!(seen, expected);
                Ok(())
            })?;
        }
    }
}

// ============================================================================
// SQL
// ============================================================================

#[tokio::test]
async fn sql_select_with_residual_filter_and_projection() {
    let storage = seeded_storage().await;
    let stmt = SqlStatement::select("articles")
        .fields(&["id", "author"])
        .where_("type", "=", "b", None, None)
        .unwrap()
        .condition("author", KeyRange::only("ann"));

    let rows = storage.execute_sql(&stmt).unwrap().outcome().await.expect("select");

    assert_eq!(rows, json!([{"id": 6, "author": "ann"}]));
}

#[tokio::test]
async fn sql_ordered_page() {
    let storage = seeded_storage().await;
    let stmt = SqlStatement::select("articles").order_by("rating", true).limit(2).offset(1);

    let rows = storage.execute_sql(&stmt).unwrap().outcome().await.expect("select");

    assert_eq!(record_ids(&rows), vec![1, 3]);
}

#[tokio::test]
async fn sql_aggregate_over_range() {
    let storage = seeded_storage().await;
    let stmt = SqlStatement::select("articles")
        .where_("rating", ">=", 3, None, None)
        .unwrap()
        .aggregate(Aggregate::parse("sum", Some("rating")).unwrap())
        .unwrap();

    let total = storage.execute_sql(&stmt).unwrap().outcome().await.expect("sum");

    assert_eq!(total, json!(20.0));
}

#[tokio::test]
async fn sql_join_is_not_supported() {
    let storage = seeded_storage().await;
    let stmt = SqlStatement::select("articles").join("authors");
    let result = storage.execute_sql(&stmt);
    assert!(result.is_err_and(|e| e.is_not_supported()));
}
