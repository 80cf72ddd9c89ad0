//! Back-end adapter boundary.
//!
//! The [`Backend`] trait is the narrow operation set the request and query
//! layers need from a physical storage engine. Adapters never return results
//! directly. Each operation receives the [`Request`] the façade created and
//! talks back through two calls only:
//!
//! - [`Transactional::set_tx`](crate::Transactional::set_tx) once the engine
//!   has scheduled the operation in a transaction;
//! - [`Deferred::set_db_value`](crate::Deferred::set_db_value) with the
//!   result or the failure.
//!
//! Adapters should resolve the request *before* committing, so a transform
//! or callback that calls [`abort`](crate::Transactional::abort) still rolls
//! the transaction back, and detach the transaction with
//! [`remove_tx`](crate::Transactional::remove_tx) once it has finished.
//!
//! # Implementing a Backend
//!
//! 1. Implement [`Backend`].
//! 2. Implement [`TxHandle`](crate::TxHandle) for the engine's transaction.
//! 3. Map engine errors to [`DbError`](crate::DbError).
//! 4. Run the [`conformance`](crate::conformance) suite against it.
//!
//! See [`MemoryBackend`](crate::MemoryBackend) for a reference implementation.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use crate::{
    deferred::TransactionMode,
    error::DbResult,
    iterator::{CursorPosition, DbIterator},
    key::Key,
    key_range::KeyRange,
    request::Request,
    schema::DatabaseSchema,
};

/// Projection produced by a list scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryMethod {
    /// First matching record, or `null`.
    Get,
    /// Array of records.
    ListValue,
    /// Array of primary keys.
    ListPrimaryKey,
    /// Array of effective keys: index keys for index scans, primary keys
    /// otherwise.
    ListKey,
    /// Array of `[key, primary key]` pairs.
    ListKeys,
    /// Number of matches.
    Count,
}

/// Shared slot a back-end writes the final cursor position into before it
/// resolves a list request.
#[derive(Debug, Clone, Default)]
pub struct PositionReport(Arc<Mutex<Option<CursorPosition>>>);

impl PositionReport {
    /// Creates an empty report.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records where the scan stopped.
    pub fn record(&self, position: CursorPosition) {
        *self.0.lock() = Some(position);
    }

    /// Position recorded by the last scan, if any.
    #[must_use]
    pub fn get(&self) -> Option<CursorPosition> {
        self.0.lock().clone()
    }
}

/// Parameters of a list scan.
#[derive(Debug, Clone)]
pub struct ListScan {
    /// Projection.
    pub method: QueryMethod,
    /// Scan descriptor; its position says where to resume.
    pub iter: DbIterator,
    /// Maximum number of results, `None` for all.
    pub limit: Option<usize>,
    /// Number of matches to skip before emitting results. Skipping happens
    /// during the scan, not by slicing a larger result.
    pub offset: usize,
    /// Where the back-end reports the final position.
    pub report: PositionReport,
}

impl ListScan {
    /// Scan over `iter` with no limit, no offset and a fresh report.
    #[must_use]
    pub fn new(method: QueryMethod, iter: DbIterator) -> Self {
        Self { method, iter, limit: None, offset: 0, report: PositionReport::new() }
    }

    /// Sets the limit.
    #[must_use]
    pub fn limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }

    /// Sets the offset.
    #[must_use]
    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }
}

/// Target of a count or clear.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    /// Records of a store, optionally within a primary key range.
    Store {
        /// Store name.
        store: String,
        /// Primary key range.
        range: Option<KeyRange>,
    },
    /// Entries of an index, optionally within an index key range.
    Index {
        /// Store name.
        store: String,
        /// Index name.
        index: String,
        /// Index key range.
        range: Option<KeyRange>,
    },
    /// Whatever an iterator visits, including unique collapsing.
    Iterator(DbIterator),
}

impl Scope {
    /// Store the scope refers to.
    #[must_use]
    pub fn store_name(&self) -> &str {
        match self {
            Self::Store { store, .. } | Self::Index { store, .. } => store,
            Self::Iterator(iter) => iter.store_name(),
        }
    }

    /// The scope expressed as an iterator.
    #[must_use]
    pub fn to_iterator(&self) -> DbIterator {
        match self {
            Self::Store { store, range } => DbIterator::keys(store.clone(), range.clone()),
            Self::Index { store, index, range } => {
                DbIterator::index_keys(store.clone(), index.clone(), range.clone())
            },
            Self::Iterator(iter) => iter.clone(),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_iterator())
    }
}

/// What a cursor callback wants next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorStep {
    /// Move to the next entry.
    Continue,
    /// Move `n` entries forward; `Advance(1)` is `Continue`.
    Advance(usize),
    /// End the scan.
    Stop,
}

/// Write queued by a cursor callback.
#[derive(Debug, Clone)]
pub enum CursorWrite {
    /// Replace the current record.
    Update(Value),
    /// Delete the current record.
    Delete,
}

/// A write together with the nested request that reports its outcome.
#[derive(Debug)]
pub struct PendingWrite {
    /// Nested request, a [`Request::copy`] of the cursor request.
    pub request: Request,
    /// The write.
    pub write: CursorWrite,
}

/// The record a cursor is positioned on.
#[derive(Debug)]
pub struct CursorEntry {
    key: Key,
    primary_key: Key,
    value: Option<Value>,
    request: Request,
    writes: Vec<PendingWrite>,
}

impl CursorEntry {
    /// Builds an entry; called by back-ends.
    #[must_use]
    pub fn new(key: Key, primary_key: Key, value: Option<Value>, request: Request) -> Self {
        Self { key, primary_key, value, request, writes: Vec::new() }
    }

    /// Effective key: index key for index scans, primary key otherwise.
    #[must_use]
    pub fn key(&self) -> &Key {
        &self.key
    }

    /// Primary key.
    #[must_use]
    pub fn primary_key(&self) -> &Key {
        &self.primary_key
    }

    /// Record value; `None` for key-only cursors.
    #[must_use]
    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    /// The cursor's own request, e.g. to abort the transaction.
    #[must_use]
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Queues a replacement of the current record. The returned request
    /// resolves with the primary key once the write has been applied; the
    /// cursor does not advance until it has.
    pub fn update(&mut self, value: Value) -> Request {
        self.queue(CursorWrite::Update(value))
    }

    /// Queues deletion of the current record.
    pub fn delete(&mut self) -> Request {
        self.queue(CursorWrite::Delete)
    }

    fn queue(&mut self, write: CursorWrite) -> Request {
        let request = self.request.copy();
        self.writes.push(PendingWrite { request: request.clone(), write });
        request
    }

    /// Removes and returns the queued writes; called by back-ends.
    pub fn take_writes(&mut self) -> Vec<PendingWrite> {
        std::mem::take(&mut self.writes)
    }
}

/// Callback invoked once per record by [`Backend::open`].
pub type CursorCallback = Box<dyn FnMut(&mut CursorEntry) -> DbResult<CursorStep> + Send>;

/// A storage engine.
///
/// Every method resolves `req` exactly once, through
/// [`set_db_value`](crate::Deferred::set_db_value).
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Stores and indexes the engine provides.
    fn schema(&self) -> &DatabaseSchema;

    /// Short engine name for logs, e.g. `"memory"`.
    fn mechanism(&self) -> &'static str;

    /// Resolves with the record at `key`, or `null`.
    async fn get(&self, req: &Request, store: &str, key: &Key);

    /// Inserts or overwrites `records`; resolves with the array of their
    /// primary keys. Fails as a whole on the first constraint violation.
    async fn put(&self, req: &Request, store: &str, records: Vec<Value>);

    /// Deletes records in `range`; resolves with the number deleted.
    async fn remove(&self, req: &Request, store: &str, range: &KeyRange);

    /// Runs a list scan; resolves with the projection named by
    /// `scan.method` after recording the final position in `scan.report`.
    async fn list_iter(&self, req: &Request, scan: ListScan);

    /// Opens a live cursor over `iter`, calling `callback` per record.
    /// Resolves with the number of records visited.
    async fn open(
        &self,
        req: &Request,
        iter: &DbIterator,
        mode: TransactionMode,
        callback: CursorCallback,
    );

    /// Resolves with the number of entries in `scope`.
    async fn count(&self, req: &Request, scope: &Scope);

    /// Deletes the records in `scope`; resolves with the number deleted.
    async fn clear(&self, req: &Request, scope: &Scope);
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{deferred::Deferred, request::Method};

    #[test]
    fn position_report_is_shared_between_clones() {
        let report = PositionReport::new();
        let clone = report.clone();
        clone.record(CursorPosition::Completed);
        assert_eq!(report.get(), Some(CursorPosition::Completed));
    }

    #[test]
    fn scope_as_iterator() {
        let scope = Scope::Index {
            store: "s".into(),
            index: "i".into(),
            range: Some(KeyRange::only(1)),
        };
        let iter = scope.to_iterator();
        assert_eq!(iter.index_name(), Some("i"));
        assert!(iter.is_key_only());
        assert_eq!(scope.store_name(), "s");
    }

    #[tokio::test]
    async fn cursor_writes_use_copied_requests() {
        let outer = Request::new(Method::Open, "cursor");
        let mut entry = CursorEntry::new(Key::from(1), Key::from(1), Some(json!({})), outer);
        let nested = entry.update(json!({"id": 1}));
        assert_eq!(nested.label(), "cursorC1");

        let writes = entry.take_writes();
        assert_eq!(writes.len(), 1);
        assert!(entry.take_writes().is_empty());
        writes[0].request.set_db_value(Ok(json!(1))).unwrap();
        assert_eq!(nested.outcome().await.unwrap(), json!(1));
    }
}
