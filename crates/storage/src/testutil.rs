//! Shared test utilities.
//!
//! This module provides a sample schema and data set, storage factories and
//! assertion macros for [`DbResult`](crate::DbResult) values. It is feature-gated behind
//! `testutil` to keep it out of production builds.
//!
//! # Usage
//!
//! In integration tests, enable the feature in `Cargo.toml`:
//!
//! ```toml
//! [dev-dependencies]
//! cursordb-storage = { path = "../storage", features = ["testutil"] }
//! ```
//!
//! Then import helpers:
//!
//! ```no_run
//! // Requires the `testutil` feature to be enabled.
//! use cursordb_storage::testutil::{sample_schema, seeded_storage};
//! ```
//!
//! # Sample data
//!
//! Store `articles`, primary key `id`, with indexes:
//!
//! | Index | Key path | Notes |
//! |-------|----------|-------|
//! | `type` | `type` | |
//! | `rating` | `rating` | |
//! | `tags` | `tags` | multi-entry |
//! | `type_rating` | `[type, rating]` | compound |
//! | `slug` | `slug` | unique, unused by the sample records |
//!
//! and seven records:
//!
//! | id | type | rating | author | tags |
//! |----|------|--------|--------|------|
//! | 1 | a | 5 | ann | x, y |
//! | 2 | b | 3 | bob | y |
//! | 3 | a | 4 | bob | |
//! | 4 | c | 1 | ann | x |
//! | 5 | b | 5 | cid | |
//! | 6 | b | 2 | ann | z |
//! | 7 | c | 3 | bob | |

use serde_json::{Value, json};

use crate::{
    deferred::Deferred,
    memory::MemoryBackend,
    schema::{DatabaseSchema, IndexSchema, StoreSchema},
    storage::Storage,
};

/// Schema of the sample `articles` store.
#[must_use]
pub fn sample_schema() -> DatabaseSchema {
    DatabaseSchema::new(vec![
        StoreSchema::new("articles", "id")
            .with_index(IndexSchema::new("type", "type"))
            .with_index(IndexSchema::new("rating", "rating"))
            .with_index(IndexSchema::new("tags", "tags").multi_entry(true))
            .with_index(IndexSchema::compound("type_rating", ["type", "rating"]))
            .with_index(IndexSchema::new("slug", "slug").unique(true)),
    ])
}

/// The seven sample records, in primary key order.
#[must_use]
pub fn sample_records() -> Vec<Value> {
    vec![
        json!({"id": 1, "type": "a", "rating": 5, "author": "ann", "tags": ["x", "y"]}),
        json!({"id": 2, "type": "b", "rating": 3, "author": "bob", "tags": ["y"]}),
        json!({"id": 3, "type": "a", "rating": 4, "author": "bob"}),
        json!({"id": 4, "type": "c", "rating": 1, "author": "ann", "tags": ["x"]}),
        json!({"id": 5, "type": "b", "rating": 5, "author": "cid"}),
        json!({"id": 6, "type": "b", "rating": 2, "author": "ann", "tags": ["z"]}),
        json!({"id": 7, "type": "c", "rating": 3, "author": "bob"}),
    ]
}

/// A [`Storage`] over an empty [`MemoryBackend`] with `schema`.
#[must_use]
pub fn memory_storage(schema: DatabaseSchema) -> Storage {
    Storage::new(MemoryBackend::new(schema))
}

/// A [`Storage`] over the sample schema, loaded with the sample records.
///
/// # Panics
///
/// Panics if loading fails (should not happen with `MemoryBackend`).
pub async fn seeded_storage() -> Storage {
    let storage = memory_storage(sample_schema());
    storage.put_all("articles", sample_records()).outcome().await.expect("seeding failed");
    storage
}

/// Marks the request's rejection as observed, for tests that expect a
/// failure without awaiting it.
pub fn silence<R: Deferred>(request: &R) {
    request.add_errback(|_| {});
}

/// Assert that a [`DbResult`](crate::DbResult) is a
/// [`DbError::Argument`](crate::DbError::Argument).
///
/// # Examples
///
/// ```no_run
/// // Requires the `testutil` feature to be enabled.
/// use cursordb_storage::{DbError, DbResult, assert_argument_error};
///
/// let result: DbResult<()> = Err(DbError::argument("bad field"));
/// assert_argument_error!(result);
/// ```
#[macro_export]
macro_rules! assert_argument_error {
    ($result:expr) => {
        assert!(
            matches!($result, Err($crate::error::DbError::Argument { .. })),
            "expected DbError::Argument, got: {:?}",
            $result,
        );
    };
    ($result:expr, $msg:expr) => {
        assert!(
            matches!($result, Err($crate::error::DbError::Argument { .. })),
            "{}: expected DbError::Argument, got: {:?}",
            $msg,
            $result,
        );
    };
}

/// Assert that a [`DbResult`](crate::DbResult) is a
/// [`DbError::InvalidState`](crate::DbError::InvalidState).
#[macro_export]
macro_rules! assert_invalid_state {
    ($result:expr) => {
        assert!(
            matches!($result, Err($crate::error::DbError::InvalidState { .. })),
            "expected DbError::InvalidState, got: {:?}",
            $result,
        );
    };
}

/// Assert that a [`DbResult`](crate::DbResult) is `Ok` and return the value.
#[macro_export]
macro_rules! assert_db_ok {
    ($result:expr) => {
        match $result {
            Ok(val) => val,
            Err(e) => panic!("expected Ok, got DbError: {e:?}"),
        }
    };
    ($result:expr, $msg:expr) => {
        match $result {
            Ok(val) => val,
            Err(e) => panic!("{}: expected Ok, got DbError: {e:?}", $msg),
        }
    };
}

/// Record ids of a JSON array of records, in order.
///
/// # Panics
///
/// Panics if `records` is not an array of objects with integer `id`s.
#[must_use]
pub fn record_ids(records: &Value) -> Vec<i64> {
    records
        .as_array()
        .expect("expected an array of records")
        .iter()
        .map(|r| r["id"].as_i64().expect("record without integer id"))
        .collect()
}
