//! Conformance test suite for `MemoryBackend`.
//!
//! Each test function corresponds to a single conformance check, providing
//! fine-grained failure reporting. The `run_all` test exercises the full
//! suite on one storage to show the checks do not depend on each other.

#![allow(clippy::expect_used, clippy::panic)]

use cursordb_storage::{MemoryBackend, Storage, conformance, testutil::sample_schema};

fn storage() -> Storage {
    Storage::new(MemoryBackend::new(sample_schema()))
}

// ============================================================================
// CRUD (5 tests)
// ============================================================================

#[tokio::test]
async fn crud_get_missing_resolves_null() {
    conformance::crud_get_missing_resolves_null(&storage()).await;
}

#[tokio::test]
async fn crud_put_then_get() {
    conformance::crud_put_then_get(&storage()).await;
}

#[tokio::test]
async fn crud_put_overwrites() {
    conformance::crud_put_overwrites(&storage()).await;
}

#[tokio::test]
async fn crud_remove_counts_deleted() {
    conformance::crud_remove_counts_deleted(&storage()).await;
}

#[tokio::test]
async fn crud_unique_violation_rolls_back_batch() {
    conformance::crud_unique_violation_rolls_back_batch(&storage()).await;
}

// ============================================================================
// Scan (6 tests)
// ============================================================================

#[tokio::test]
async fn scan_store_is_ordered() {
    conformance::scan_store_is_ordered(&storage()).await;
}

#[tokio::test]
async fn scan_index_orders_duplicates_by_primary_key() {
    conformance::scan_index_orders_duplicates_by_primary_key(&storage()).await;
}

#[tokio::test]
async fn scan_unique_collapses_duplicates() {
    conformance::scan_unique_collapses_duplicates(&storage()).await;
}

#[tokio::test]
async fn scan_multi_entry_index() {
    conformance::scan_multi_entry_index(&storage()).await;
}

#[tokio::test]
async fn scan_compound_prefix() {
    conformance::scan_compound_prefix(&storage()).await;
}

#[tokio::test]
async fn scan_limit_and_offset() {
    conformance::scan_limit_and_offset(&storage()).await;
}

// ============================================================================
// Count and clear (3 tests)
// ============================================================================

#[tokio::test]
async fn count_by_scope() {
    conformance::count_by_scope(&storage()).await;
}

#[tokio::test]
async fn clear_store_range() {
    conformance::clear_store_range(&storage()).await;
}

#[tokio::test]
async fn clear_by_index() {
    conformance::clear_by_index(&storage()).await;
}

// ============================================================================
// Cursor (4 tests)
// ============================================================================

#[tokio::test]
async fn cursor_update_persists() {
    conformance::cursor_update_persists(&storage()).await;
}

#[tokio::test]
async fn cursor_delete_persists() {
    conformance::cursor_delete_persists(&storage()).await;
}

#[tokio::test]
async fn cursor_read_only_rejects_writes() {
    conformance::cursor_read_only_rejects_writes(&storage()).await;
}

#[tokio::test]
async fn cursor_abort_rolls_back() {
    conformance::cursor_abort_rolls_back(&storage()).await;
}

// ============================================================================
// Concurrent (2 tests)
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_puts_all_land() {
    conformance::concurrent_puts_all_land(&storage()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_unique_exactly_one_winner() {
    conformance::concurrent_unique_exactly_one_winner(&storage()).await;
}

// ============================================================================
// Full suite
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn run_all() {
    conformance::run_all(MemoryBackend::new(sample_schema())).await;
}
