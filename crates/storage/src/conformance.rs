//! Conformance test suite for [`Backend`] implementations.
//!
//! Every check drives the back-end through [`Storage`], so it exercises the
//! same path applications use: request creation, transaction attachment,
//! resolution before commit and cursor write settlement. Any adapter,
//! in-memory or engine-backed, can run the suite to show it honors the
//! request contract.
//!
//! # Usage
//!
//! Enable the `testutil` feature and build the back-end over
//! [`sample_schema`]. Each check reseeds the `articles` store itself, so the
//! checks can share one storage:
//!
//! ```no_run
//! use cursordb_storage::{MemoryBackend, Storage, conformance, testutil::sample_schema};
//!
//! #[tokio::test]
//! async fn memory_get_missing() {
//!     let storage = Storage::new(MemoryBackend::new(sample_schema()));
//!     conformance::crud_get_missing_resolves_null(&storage).await;
//! }
//! ```
//!
//! # Check Categories
//!
//! | Category | Checks | Contract aspect |
//! |----------|--------|-----------------|
//! | CRUD | 5 | get, put and remove results |
//! | Scan | 6 | key order, direction, unique and multi-entry indexes |
//! | Count/clear | 3 | scope semantics and deleted counts |
//! | Cursor | 4 | writes, read-only rejection, abort rollback |
//! | Concurrent | 2 | serialized writers, unique constraint races |

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{Value, json};

use crate::{
    assert_invalid_state,
    backend::{Backend, CursorStep, QueryMethod},
    deferred::{TransactionMode, Transactional},
    error::DbError,
    iterator::DbIterator,
    key::Key,
    key_range::KeyRange,
    storage::Storage,
    testutil::{record_ids, sample_records},
};

const STORE: &str = "articles";

/// Replaces the contents of the `articles` store with the sample records.
///
/// # Panics
///
/// Panics if clearing or loading fails.
pub async fn reseed(storage: &Storage) {
    storage.clear(STORE, None).outcome().await.expect("clear");
    storage.put_all(STORE, sample_records()).outcome().await.expect("seed");
}

async fn scan(storage: &Storage, method: QueryMethod, iter: &DbIterator) -> Value {
    storage.list_iter(method, iter, None, 0).outcome().await.expect("list_iter")
}

async fn count(storage: &Storage) -> Value {
    storage.count(STORE, None).outcome().await.expect("count")
}

// ============================================================================
// CRUD
// ============================================================================

/// `get` on a missing key resolves with `null`, not an error.
pub async fn crud_get_missing_resolves_null(storage: &Storage) {
    reseed(storage).await;
    let value = storage.get(STORE, 404).outcome().await.expect("get");
    assert_eq!(value, Value::Null);
}

/// `put` resolves with the primary key and the record reads back unchanged.
pub async fn crud_put_then_get(storage: &Storage) {
    reseed(storage).await;
    let record = json!({"id": 10, "type": "d", "rating": 2});
    let key = storage.put(STORE, record.clone()).outcome().await.expect("put");
    assert_eq!(key, json!(10));
    assert_eq!(storage.get(STORE, 10).outcome().await.expect("get"), record);
}

/// `put` over an existing key replaces the record and its index entries.
pub async fn crud_put_overwrites(storage: &Storage) {
    reseed(storage).await;
    storage.put(STORE, json!({"id": 4, "type": "a", "rating": 1})).outcome().await.expect("put");
    let iter = DbIterator::index_keys(STORE, "type", Some(KeyRange::only("c")));
    assert_eq!(scan(storage, QueryMethod::ListPrimaryKey, &iter).await, json!([7]));
    assert_eq!(count(storage).await, json!(7));
}

/// `remove` resolves with the number deleted; removing again deletes nothing.
pub async fn crud_remove_counts_deleted(storage: &Storage) {
    reseed(storage).await;
    assert_eq!(storage.remove(STORE, 1).outcome().await.expect("remove"), json!(1));
    assert_eq!(storage.remove(STORE, 1).outcome().await.expect("remove again"), json!(0));
    assert_eq!(storage.get(STORE, 1).outcome().await.expect("get"), Value::Null);
}

/// A unique violation rejects the whole batch and writes nothing.
pub async fn crud_unique_violation_rolls_back_batch(storage: &Storage) {
    reseed(storage).await;
    let batch = vec![json!({"id": 20, "slug": "dup"}), json!({"id": 21, "slug": "dup"})];
    let result = storage.put_all(STORE, batch).outcome().await;
    assert!(matches!(result, Err(DbError::Constraint { .. })), "got: {result:?}");
    assert_eq!(storage.get(STORE, 20).outcome().await.expect("get"), Value::Null);
    assert_eq!(count(storage).await, json!(7));
}

// ============================================================================
// Scan
// ============================================================================

/// Store scans are ordered by primary key in both directions.
pub async fn scan_store_is_ordered(storage: &Storage) {
    reseed(storage).await;
    let iter = DbIterator::values(STORE, Some(KeyRange::bound(2, 5, false, true).expect("range")));
    assert_eq!(record_ids(&scan(storage, QueryMethod::ListValue, &iter).await), vec![2, 3, 4]);
    assert_eq!(
        scan(storage, QueryMethod::ListPrimaryKey, &iter.reverse()).await,
        json!([4, 3, 2])
    );
}

/// Index scans order by index key, then primary key.
pub async fn scan_index_orders_duplicates_by_primary_key(storage: &Storage) {
    reseed(storage).await;
    let iter = DbIterator::index_keys(STORE, "type", None);
    assert_eq!(
        scan(storage, QueryMethod::ListPrimaryKey, &iter).await,
        json!([1, 3, 2, 5, 6, 4, 7])
    );
    assert_eq!(
        scan(storage, QueryMethod::ListPrimaryKey, &iter.reverse()).await,
        json!([7, 4, 6, 5, 2, 3, 1])
    );
}

/// Unique scans visit each index key once.
pub async fn scan_unique_collapses_duplicates(storage: &Storage) {
    reseed(storage).await;
    let iter = DbIterator::index_keys(STORE, "type", None).unique(true);
    assert_eq!(scan(storage, QueryMethod::ListKey, &iter).await, json!(["a", "b", "c"]));
    assert_eq!(scan(storage, QueryMethod::ListKey, &iter.reverse()).await, json!(["c", "b", "a"]));
}

/// Multi-entry indexes hold one entry per array element.
pub async fn scan_multi_entry_index(storage: &Storage) {
    reseed(storage).await;
    let iter = DbIterator::index_keys(STORE, "tags", Some(KeyRange::only("x")));
    assert_eq!(scan(storage, QueryMethod::ListPrimaryKey, &iter).await, json!([1, 4]));
    let pairs = DbIterator::index_keys(STORE, "tags", Some(KeyRange::only("y")));
    assert_eq!(scan(storage, QueryMethod::ListKeys, &pairs).await, json!([["y", 1], ["y", 2]]));
}

/// Compound index prefixes select records ordered by the remaining fields.
pub async fn scan_compound_prefix(storage: &Storage) {
    reseed(storage).await;
    let range = KeyRange::array_prefix(vec![Key::from("b")]);
    let iter = DbIterator::index_keys(STORE, "type_rating", Some(range));
    assert_eq!(scan(storage, QueryMethod::ListPrimaryKey, &iter).await, json!([6, 2, 5]));
}

/// Limit and offset are applied during the scan.
pub async fn scan_limit_and_offset(storage: &Storage) {
    reseed(storage).await;
    let iter = DbIterator::keys(STORE, None);
    let page = storage.list_iter(QueryMethod::ListPrimaryKey, &iter, Some(2), 3).outcome().await;
    assert_eq!(page.expect("page"), json!([4, 5]));
    let first = scan(storage, QueryMethod::Get, &iter.reverse()).await;
    assert_eq!(first["id"], json!(7));
}

// ============================================================================
// Count and clear
// ============================================================================

/// Counts honor store, index and iterator scopes.
pub async fn count_by_scope(storage: &Storage) {
    reseed(storage).await;
    assert_eq!(count(storage).await, json!(7));
    let tags = storage.count_index(STORE, "tags", None).outcome().await.expect("count index");
    assert_eq!(tags, json!(5));
    let unique = DbIterator::index_keys(STORE, "type", None).unique(true);
    assert_eq!(storage.count_iter(&unique).outcome().await.expect("count iter"), json!(3));
}

/// Clearing a primary key range resolves with the number deleted.
pub async fn clear_store_range(storage: &Storage) {
    reseed(storage).await;
    let range = KeyRange::bound(2, 4, false, false).expect("range");
    assert_eq!(storage.clear(STORE, Some(range)).outcome().await.expect("clear"), json!(3));
    assert_eq!(
        storage.keys_in(STORE, None, None).outcome().await.expect("keys"),
        json!([1, 5, 6, 7])
    );
}

/// Clearing by index deletes the matching records, not only index entries.
pub async fn clear_by_index(storage: &Storage) {
    reseed(storage).await;
    let cleared = storage.clear_index(STORE, "type", Some(KeyRange::only("c"))).outcome().await;
    assert_eq!(cleared.expect("clear index"), json!(2));
    assert_eq!(count(storage).await, json!(5));
    let rating = DbIterator::index_keys(STORE, "rating", Some(KeyRange::only(1)));
    assert_eq!(scan(storage, QueryMethod::ListPrimaryKey, &rating).await, json!([]));
}

// ============================================================================
// Cursor
// ============================================================================

/// Cursor updates are committed and re-indexed.
pub async fn cursor_update_persists(storage: &Storage) {
    reseed(storage).await;
    let iter = DbIterator::index_values(STORE, "type", Some(KeyRange::only("b")));
    let visited = storage
        .open(&iter, TransactionMode::ReadWrite, |entry| {
            let mut record = entry.value().cloned().unwrap_or(Value::Null);
            record["type"] = json!("d");
            let _nested = entry.update(record);
            Ok(CursorStep::Continue)
        })
        .outcome()
        .await
        .expect("cursor");
    assert_eq!(visited, json!(3));
    let moved = DbIterator::index_keys(STORE, "type", Some(KeyRange::only("d")));
    assert_eq!(scan(storage, QueryMethod::ListPrimaryKey, &moved).await, json!([2, 5, 6]));
}

/// Cursor deletes remove the visited records.
pub async fn cursor_delete_persists(storage: &Storage) {
    reseed(storage).await;
    let low = KeyRange::upper_bound(3, true);
    let iter = DbIterator::index_values(STORE, "rating", Some(low));
    storage
        .open(&iter, TransactionMode::ReadWrite, |entry| {
            let _nested = entry.delete();
            Ok(CursorStep::Continue)
        })
        .outcome()
        .await
        .expect("cursor");
    assert_eq!(
        storage.keys_in(STORE, None, None).outcome().await.expect("keys"),
        json!([1, 2, 3, 5, 7])
    );
}

/// Writes through a read-only cursor reject and change nothing.
pub async fn cursor_read_only_rejects_writes(storage: &Storage) {
    reseed(storage).await;
    let result = storage
        .open(&DbIterator::values(STORE, None), TransactionMode::ReadOnly, |entry| {
            let _nested = entry.delete();
            Ok(CursorStep::Stop)
        })
        .outcome()
        .await;
    assert_invalid_state!(result);
    assert_eq!(count(storage).await, json!(7));
}

/// Aborting from a cursor callback rolls back writes made earlier in the scan.
pub async fn cursor_abort_rolls_back(storage: &Storage) {
    reseed(storage).await;
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&seen);
    let result = storage
        .open(&DbIterator::values(STORE, None), TransactionMode::ReadWrite, move |entry| {
            log.lock().push(entry.primary_key().clone());
            if entry.primary_key() == &Key::from(3) {
                entry.request().abort()?;
                return Ok(CursorStep::Stop);
            }
            let _nested = entry.delete();
            Ok(CursorStep::Continue)
        })
        .outcome()
        .await;
    assert!(result.as_ref().is_err_and(DbError::is_aborted), "got: {result:?}");
    assert_eq!(*seen.lock(), vec![Key::from(1), Key::from(2), Key::from(3)]);
    assert_eq!(count(storage).await, json!(7));
}

// ============================================================================
// Concurrent access
// ============================================================================

/// Concurrent writers to different keys all land.
pub async fn concurrent_puts_all_land(storage: &Storage) {
    reseed(storage).await;
    let mut handles = Vec::new();
    for id in 100i64..120 {
        let storage = storage.clone();
        handles.push(tokio::spawn(async move {
            storage.put(STORE, json!({"id": id, "type": "z"})).outcome().await
        }));
    }
    for handle in handles {
        handle.await.expect("task join").expect("concurrent put");
    }
    assert_eq!(count(storage).await, json!(27));
}

/// Racing writers of the same unique key: exactly one wins.
pub async fn concurrent_unique_exactly_one_winner(storage: &Storage) {
    reseed(storage).await;
    let mut handles = Vec::new();
    for id in 200i64..210 {
        let storage = storage.clone();
        handles.push(tokio::spawn(async move {
            storage.put(STORE, json!({"id": id, "slug": "contested"})).outcome().await
        }));
    }

    let mut winners = 0u32;
    let mut conflicts = 0u32;
    for handle in handles {
        match handle.await.expect("task join") {
            Ok(_) => winners += 1,
            Err(DbError::Constraint { .. }) => conflicts += 1,
            Err(e) => panic!("unexpected error: {e:?}"),
        }
    }
    assert_eq!(winners, 1, "exactly one writer should win");
    assert_eq!(conflicts, 9, "remaining writers should hit the constraint");
}

// ============================================================================
// Convenience runner
// ============================================================================

/// Runs every check against `backend`, which must use
/// [`sample_schema`](crate::testutil::sample_schema).
///
/// ```no_run
/// use cursordb_storage::{MemoryBackend, conformance, testutil::sample_schema};
///
/// #[tokio::test]
/// async fn memory_backend_conformance() {
///     conformance::run_all(MemoryBackend::new(sample_schema())).await;
/// }
/// ```
pub async fn run_all<B: Backend>(backend: B) {
    let storage = Storage::new(backend);

    // CRUD
    crud_get_missing_resolves_null(&storage).await;
    crud_put_then_get(&storage).await;
    crud_put_overwrites(&storage).await;
    crud_remove_counts_deleted(&storage).await;
    crud_unique_violation_rolls_back_batch(&storage).await;

    // Scan
    scan_store_is_ordered(&storage).await;
    scan_index_orders_duplicates_by_primary_key(&storage).await;
    scan_unique_collapses_duplicates(&storage).await;
    scan_multi_entry_index(&storage).await;
    scan_compound_prefix(&storage).await;
    scan_limit_and_offset(&storage).await;

    // Count and clear
    count_by_scope(&storage).await;
    clear_store_range(&storage).await;
    clear_by_index(&storage).await;

    // Cursor
    cursor_update_persists(&storage).await;
    cursor_delete_persists(&storage).await;
    cursor_read_only_rejects_writes(&storage).await;
    cursor_abort_rolls_back(&storage).await;

    // Concurrent
    concurrent_puts_all_land(&storage).await;
    concurrent_unique_exactly_one_winner(&storage).await;
}
