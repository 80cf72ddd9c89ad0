//! The storage façade.
//!
//! [`Storage`] is the entry point applications call. Every operation creates
//! a [`Request`], spawns the back-end work on the current tokio runtime and
//! returns the request immediately. Argument errors that can be detected
//! before any I/O are returned synchronously as `Err`; everything else
//! arrives through the request's rejection.

use std::{fmt, future::Future, mem, sync::Arc};

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{Instrument, debug};

use crate::{
    backend::{Backend, CursorCallback, CursorEntry, CursorStep, ListScan, QueryMethod, Scope},
    config::StorageConfig,
    deferred::{Deferred, TransactionMode},
    error::{ConfigError, DbError, DbResult},
    iterator::DbIterator,
    key::Key,
    key_range::KeyRange,
    metrics::Metrics,
    query::Query,
    request::{Method, Request},
    schema::{DatabaseSchema, StoreSchema},
    sql::{self, SqlStatement},
};

/// Handle to a database.
///
/// # Cloning
///
/// `Storage` is cheaply cloneable. Clones share the back-end, the
/// configuration and the metrics.
#[derive(Clone)]
pub struct Storage {
    backend: Arc<dyn Backend>,
    config: Arc<StorageConfig>,
    metrics: Metrics,
}

impl Storage {
    /// Wraps `backend` with the default configuration.
    pub fn new(backend: impl Backend) -> Self {
        Self { backend: Arc::new(backend), config: Arc::default(), metrics: Metrics::new() }
    }

    /// Wraps `backend` with `config`.
    ///
    /// # Errors
    ///
    /// Returns the [`ConfigError`] reported by [`StorageConfig::validate`].
    pub fn with_config(backend: impl Backend, config: StorageConfig) -> Result<Self, ConfigError> {
        Self::from_shared(Arc::new(backend), config)
    }

    /// Wraps an already shared back-end with `config`.
    ///
    /// # Errors
    ///
    /// Returns the [`ConfigError`] reported by [`StorageConfig::validate`].
    pub fn from_shared(
        backend: Arc<dyn Backend>,
        config: StorageConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        debug!(db = %config.name, mechanism = backend.mechanism(), "Storage opened");
        Ok(Self { backend, config: Arc::new(config), metrics: Metrics::new() })
    }

    /// Configuration in effect.
    #[must_use]
    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Request counters shared by every request this façade issued.
    #[must_use]
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Stores and indexes of the back-end.
    #[must_use]
    pub fn schema(&self) -> &DatabaseSchema {
        self.backend.schema()
    }

    /// Back-end name, e.g. `"memory"`.
    #[must_use]
    pub fn mechanism(&self) -> &'static str {
        self.backend.mechanism()
    }

    pub(crate) fn store_schema(&self, store: &str) -> DbResult<Arc<StoreSchema>> {
        self.schema().require_store(store).cloned()
    }

    pub(crate) fn limit_or_default(&self, limit: Option<usize>) -> usize {
        limit.unwrap_or(self.config.default_result_limit)
    }

    /// A pending request carrying this façade's metrics and reporting policy.
    pub(crate) fn request(&self, method: Method) -> Request {
        Request::new(method, format!("{}:{method}", self.config.name))
            .with_metrics(self.metrics.clone())
            .report_unhandled(self.config.report_unhandled_rejections)
    }

    /// Runs `work` on the current runtime, inside the caller's span. Without
    /// a runtime the request is rejected instead.
    pub(crate) fn spawn<Fut>(&self, req: &Request, work: Fut)
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(work.instrument(tracing::Span::current()));
            },
            Err(_) => {
                let _ = req.set_db_value(Err(DbError::invalid_state(
                    "storage operations require a tokio runtime",
                )));
            },
        }
    }

    fn dispatch<F, Fut>(&self, method: Method, op: F) -> Request
    where
        F: FnOnce(Arc<dyn Backend>, Request) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.submit(self.request(method), op)
    }

    /// Hands `req` to the back-end. Transforms must be registered on `req`
    /// before this call, since the back-end may resolve it right away.
    pub(crate) fn submit<F, Fut>(&self, req: Request, op: F) -> Request
    where
        F: FnOnce(Arc<dyn Backend>, Request) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let work = op(Arc::clone(&self.backend), req.clone());
        self.spawn(&req, work);
        req
    }

    /// Looks up the record at `key`. Resolves with the record or `null`.
    #[tracing::instrument(skip(self, key), fields(db = %self.config.name))]
    pub fn get(&self, store: &str, key: impl Into<Key>) -> Request {
        let store = store.to_owned();
        let key = key.into();
        self.dispatch(Method::Get, move |backend, req| async move {
            backend.get(&req, &store, &key).await;
        })
    }

    /// Inserts or overwrites one record. Resolves with its primary key.
    #[tracing::instrument(skip(self, record), fields(db = %self.config.name))]
    pub fn put(&self, store: &str, record: Value) -> Request {
        let req = self.request(Method::Put);
        // A fresh request always accepts transforms.
        let _ = req.map(|keys| match keys {
            Value::Array(mut keys) if keys.len() == 1 => Ok(keys.swap_remove(0)),
            other => Err(DbError::internal(format!("put resolved with unexpected keys {other}"))),
        });
        self.put_records(req, store, vec![record])
    }

    /// Inserts or overwrites `records` in one transaction. Resolves with the
    /// array of their primary keys.
    #[tracing::instrument(skip(self, records), fields(db = %self.config.name, n = records.len()))]
    pub fn put_all(&self, store: &str, records: Vec<Value>) -> Request {
        self.put_records(self.request(Method::Put), store, records)
    }

    fn put_records(&self, req: Request, store: &str, records: Vec<Value>) -> Request {
        let store = store.to_owned();
        self.submit(req, move |backend, req| async move {
            backend.put(&req, &store, records).await;
        })
    }

    /// Deletes the record at `key`. Resolves with the number deleted.
    #[tracing::instrument(skip(self, key), fields(db = %self.config.name))]
    pub fn remove(&self, store: &str, key: impl Into<Key>) -> Request {
        self.remove_range(store, KeyRange::only(key))
    }

    /// Deletes the records in `range`. Resolves with the number deleted.
    #[tracing::instrument(skip(self), fields(db = %self.config.name))]
    pub fn remove_range(&self, store: &str, range: KeyRange) -> Request {
        let store = store.to_owned();
        self.dispatch(Method::Remove, move |backend, req| async move {
            backend.remove(&req, &store, &range).await;
        })
    }

    /// Lists effective keys visited by `iter`: index keys for index scans,
    /// primary keys otherwise.
    #[tracing::instrument(skip(self), fields(db = %self.config.name, iter = %iter))]
    pub fn keys(&self, iter: &DbIterator, limit: Option<usize>, offset: usize) -> Request {
        let scan = ListScan::new(QueryMethod::ListKey, iter.as_key_iterator())
            .limit(Some(self.limit_or_default(limit)))
            .offset(offset);
        self.scan(Method::KeysIter, scan)
    }

    /// Lists records visited by `iter`. For a key-only iterator this lists
    /// primary keys instead.
    #[tracing::instrument(skip(self), fields(db = %self.config.name, iter = %iter))]
    pub fn values(&self, iter: &DbIterator, limit: Option<usize>, offset: usize) -> Request {
        let method =
            if iter.is_key_only() { QueryMethod::ListPrimaryKey } else { QueryMethod::ListValue };
        let scan = ListScan::new(method, iter.clone())
            .limit(Some(self.limit_or_default(limit)))
            .offset(offset);
        self.scan(Method::ValuesIter, scan)
    }

    /// Lists primary keys of `store` within `range`.
    #[tracing::instrument(skip(self), fields(db = %self.config.name))]
    pub fn keys_in(&self, store: &str, range: Option<KeyRange>, limit: Option<usize>) -> Request {
        let scan = ListScan::new(QueryMethod::ListPrimaryKey, DbIterator::keys(store, range))
            .limit(Some(self.limit_or_default(limit)));
        self.scan(Method::Keys, scan)
    }

    /// Lists records of `store` within `range`.
    #[tracing::instrument(skip(self), fields(db = %self.config.name))]
    pub fn values_in(&self, store: &str, range: Option<KeyRange>, limit: Option<usize>) -> Request {
        let scan = ListScan::new(QueryMethod::ListValue, DbIterator::values(store, range))
            .limit(Some(self.limit_or_default(limit)));
        self.scan(Method::Values, scan)
    }

    /// Runs a list scan with an explicit projection. `None` lists everything.
    #[tracing::instrument(skip(self), fields(db = %self.config.name, iter = %iter))]
    pub fn list_iter(
        &self,
        method: QueryMethod,
        iter: &DbIterator,
        limit: Option<usize>,
        offset: usize,
    ) -> Request {
        let tag = match method {
            QueryMethod::Count => Method::Count,
            QueryMethod::Get | QueryMethod::ListValue => Method::ValuesIter,
            QueryMethod::ListPrimaryKey | QueryMethod::ListKey | QueryMethod::ListKeys => {
                Method::KeysIter
            },
        };
        self.scan(tag, ListScan::new(method, iter.clone()).limit(limit).offset(offset))
    }

    fn scan(&self, method: Method, scan: ListScan) -> Request {
        self.submit_scan(self.request(method), scan)
    }

    pub(crate) fn submit_scan(&self, req: Request, scan: ListScan) -> Request {
        self.submit(req, move |backend, req| async move {
            backend.list_iter(&req, scan).await;
        })
    }

    /// Opens a live cursor over `iter`, calling `callback` once per record.
    /// Resolves with the number of records visited once every write queued
    /// by the callback has settled.
    #[tracing::instrument(skip(self, callback), fields(db = %self.config.name, iter = %iter))]
    pub fn open<F>(&self, iter: &DbIterator, mode: TransactionMode, callback: F) -> Request
    where
        F: FnMut(&mut CursorEntry) -> DbResult<CursorStep> + Send + 'static,
    {
        self.submit_open(self.request(Method::Open), iter.clone(), mode, Box::new(callback))
    }

    pub(crate) fn submit_open(
        &self,
        req: Request,
        iter: DbIterator,
        mode: TransactionMode,
        callback: CursorCallback,
    ) -> Request {
        self.submit(req, move |backend, req| async move {
            backend.open(&req, &iter, mode, callback).await;
        })
    }

    /// Calls `callback` once per entry `iter` visits, in a read-only cursor.
    ///
    /// The callback receives the effective key for key iterators, the
    /// primary key for index value iterators and the record otherwise.
    /// Resolves with `null` once the scan completes.
    #[tracing::instrument(skip(self, callback), fields(db = %self.config.name, iter = %iter))]
    pub fn map<F>(&self, iter: &DbIterator, mut callback: F) -> Request
    where
        F: FnMut(Value) + Send + 'static,
    {
        let req = self.request(Method::Map);
        let _ = req.map(|_visited| Ok(Value::Null));
        let (scan, item) = cursor_items(iter);
        let cursor: CursorCallback = Box::new(move |entry| {
            callback(item(entry));
            Ok(CursorStep::Continue)
        });
        self.submit_open(req, scan, TransactionMode::ReadOnly, cursor)
    }

    /// Folds the entries `iter` visits into one value, in a read-only
    /// cursor.
    ///
    /// `callback(previous, current, index)` returns the next accumulator,
    /// where `current` is what [`map`](Self::map) would pass. Resolves with
    /// the last accumulator, or `initial` when nothing matched.
    #[tracing::instrument(
        skip(self, callback, initial),
        fields(db = %self.config.name, iter = %iter)
    )]
    pub fn reduce<F>(&self, iter: &DbIterator, mut callback: F, initial: Value) -> Request
    where
        F: FnMut(Value, Value, usize) -> Value + Send + 'static,
    {
        let req = self.request(Method::Reduce);
        let acc = Arc::new(Mutex::new(initial));
        let result = Arc::clone(&acc);
        let _ = req.map(move |_visited| Ok(mem::take(&mut *result.lock())));
        let (scan, item) = cursor_items(iter);
        let mut index = 0usize;
        let cursor: CursorCallback = Box::new(move |entry| {
            let mut acc = acc.lock();
            let previous = mem::take(&mut *acc);
            *acc = callback(previous, item(entry), index);
            index += 1;
            Ok(CursorStep::Continue)
        });
        self.submit_open(req, scan, TransactionMode::ReadOnly, cursor)
    }

    /// Counts records of `store` within `range`.
    #[tracing::instrument(skip(self), fields(db = %self.config.name))]
    pub fn count(&self, store: &str, range: Option<KeyRange>) -> Request {
        self.count_scope(Scope::Store { store: store.to_owned(), range })
    }

    /// Counts entries of `index` within `range`.
    #[tracing::instrument(skip(self), fields(db = %self.config.name))]
    pub fn count_index(&self, store: &str, index: &str, range: Option<KeyRange>) -> Request {
        self.count_scope(Scope::Index { store: store.to_owned(), index: index.to_owned(), range })
    }

    /// Counts what `iter` visits, collapsing duplicates for unique scans.
    #[tracing::instrument(skip(self), fields(db = %self.config.name, iter = %iter))]
    pub fn count_iter(&self, iter: &DbIterator) -> Request {
        self.count_scope(Scope::Iterator(iter.as_key_iterator()))
    }

    pub(crate) fn count_scope(&self, scope: Scope) -> Request {
        self.dispatch(Method::Count, move |backend, req| async move {
            backend.count(&req, &scope).await;
        })
    }

    /// Deletes records of `store` within `range`.
    #[tracing::instrument(skip(self), fields(db = %self.config.name))]
    pub fn clear(&self, store: &str, range: Option<KeyRange>) -> Request {
        self.clear_scope(Scope::Store { store: store.to_owned(), range })
    }

    /// Deletes records whose `index` key falls within `range`.
    #[tracing::instrument(skip(self), fields(db = %self.config.name))]
    pub fn clear_index(&self, store: &str, index: &str, range: Option<KeyRange>) -> Request {
        self.clear_scope(Scope::Index { store: store.to_owned(), index: index.to_owned(), range })
    }

    /// Deletes the records `iter` visits.
    #[tracing::instrument(skip(self), fields(db = %self.config.name, iter = %iter))]
    pub fn clear_iter(&self, iter: &DbIterator) -> Request {
        self.clear_scope(Scope::Iterator(iter.as_key_iterator()))
    }

    pub(crate) fn clear_scope(&self, scope: Scope) -> Request {
        self.dispatch(Method::Clear, move |backend, req| async move {
            backend.clear(&req, &scope).await;
        })
    }

    /// Starts a query over `store`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Argument`] for an unknown store.
    pub fn from(&self, store: &str) -> DbResult<Query> {
        Query::new(self.clone(), store)
    }

    /// Executes a parsed SQL statement.
    ///
    /// # Errors
    ///
    /// - [`DbError::Argument`] for unknown stores or fields.
    /// - [`DbError::NotSupported`] for joins and statements other than
    ///   `SELECT`.
    #[tracing::instrument(skip(self, statement), fields(db = %self.config.name))]
    pub fn execute_sql(&self, statement: &SqlStatement) -> DbResult<Request> {
        sql::execute(self, statement)
    }
}

/// Iterator to open for [`Storage::map`] and [`Storage::reduce`], and what
/// each entry contributes. Index value scans yield primary keys, so they run
/// key-only.
fn cursor_items(iter: &DbIterator) -> (DbIterator, fn(&CursorEntry) -> Value) {
    match (iter.is_key_only(), iter.index_name().is_some()) {
        (true, _) => (iter.clone(), |entry| entry.key().to_json()),
        (false, true) => (iter.as_key_iterator(), |entry| entry.primary_key().to_json()),
        (false, false) => (iter.clone(), |entry| entry.value().cloned().unwrap_or(Value::Null)),
    }
}

impl fmt::Debug for Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Storage")
            .field("name", &self.config.name)
            .field("mechanism", &self.backend.mechanism())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::testutil::{sample_records, sample_schema, seeded_storage};

    #[tokio::test]
    async fn put_resolves_with_single_key() {
        let storage = seeded_storage().await;
        let key = storage.put("articles", json!({"id": 42, "type": "c"})).outcome().await.unwrap();
        assert_eq!(key, json!(42));
        let record = storage.get("articles", 42).outcome().await.unwrap();
        assert_eq!(record["type"], "c");
    }

    #[tokio::test]
    async fn values_and_keys_listing() {
        let storage = seeded_storage().await;
        let iter = DbIterator::index_values("articles", "type", Some(KeyRange::only("a")));
        let values = storage.values(&iter, None, 0).outcome().await.unwrap();
        let ids: Vec<_> = values.as_array().unwrap().iter().map(|r| r["id"].clone()).collect();
        assert_eq!(ids, vec![json!(1), json!(3)]);

        let keys = storage.keys(&iter, None, 0).outcome().await.unwrap();
        assert_eq!(keys, json!(["a", "a"]));

        let pks = storage.values(&iter.as_key_iterator(), Some(1), 1).outcome().await.unwrap();
        assert_eq!(pks, json!([3]));
    }

    #[tokio::test]
    async fn default_limit_applies() {
        let backend = crate::MemoryBackend::new(sample_schema());
        let config = StorageConfig::builder().default_result_limit(2).build();
        let storage = Storage::with_config(backend, config).unwrap();
        storage.put_all("articles", sample_records()).outcome().await.unwrap();
        let keys = storage.keys_in("articles", None, None).outcome().await.unwrap();
        assert_eq!(keys.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn count_and_clear_overloads() {
        let storage = seeded_storage().await;
        assert_eq!(storage.count("articles", None).outcome().await.unwrap(), json!(7));
        assert_eq!(
            storage
                .count_index("articles", "type", Some(KeyRange::only("b")))
                .outcome()
                .await
                .unwrap(),
            json!(3)
        );
        let unique = DbIterator::index_keys("articles", "type", None).unique(true);
        assert_eq!(storage.count_iter(&unique).outcome().await.unwrap(), json!(3));

        let cleared = storage.clear_index("articles", "type", Some(KeyRange::only("b")));
        assert_eq!(cleared.outcome().await.unwrap(), json!(3));
        assert_eq!(storage.count("articles", None).outcome().await.unwrap(), json!(4));
    }

    #[tokio::test]
    async fn remove_single_key() {
        let storage = seeded_storage().await;
        assert_eq!(storage.remove("articles", 2).outcome().await.unwrap(), json!(1));
        assert_eq!(storage.get("articles", 2).outcome().await.unwrap(), Value::Null);
    }

    #[tokio::test]
    async fn open_visits_in_order() {
        let storage = seeded_storage().await;
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        let iter = DbIterator::keys("articles", Some(KeyRange::bound(2, 4, false, false).unwrap()));
        let req = storage.open(&iter.reverse(), TransactionMode::ReadOnly, move |entry| {
            log.lock().push(entry.primary_key().clone());
            Ok(CursorStep::Continue)
        });
        assert_eq!(req.outcome().await.unwrap(), json!(3));
        assert_eq!(*seen.lock(), vec![Key::from(4), Key::from(3), Key::from(2)]);
    }

    #[tokio::test]
    async fn metrics_count_requests() {
        let storage = seeded_storage().await;
        let _ = storage.get("articles", 1).outcome().await;
        let _ = storage.count("articles", None).outcome().await;
        let snapshot = storage.metrics().snapshot();
        // Seeding issued one write.
        assert_eq!(snapshot.write_count, 1);
        assert_eq!(snapshot.read_count, 2);
        assert_eq!(snapshot.resolved_count, 3);
    }

    async fn mapped(storage: &Storage, iter: DbIterator) -> Vec<Value> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        let done = storage.map(&iter, move |item| log.lock().push(item));
        assert_eq!(done.outcome().await.unwrap(), Value::Null);
        let items = seen.lock().clone();
        items
    }

    #[tokio::test]
    async fn map_yields_by_iterator_kind() {
        let storage = seeded_storage().await;
        let type_a = Some(KeyRange::only("a"));

        let index_keys = DbIterator::index_keys("articles", "type", type_a.clone());
        assert_eq!(mapped(&storage, index_keys).await, vec![json!("a"), json!("a")]);
        let index_values = DbIterator::index_values("articles", "type", type_a);
        assert_eq!(mapped(&storage, index_values).await, vec![json!(1), json!(3)]);

        let first_two = Some(KeyRange::bound(1, 2, false, false).unwrap());
        let keys = DbIterator::keys("articles", first_two);
        assert_eq!(mapped(&storage, keys).await, vec![json!(1), json!(2)]);
        let fourth = DbIterator::values("articles", Some(KeyRange::only(4)));
        let records = mapped(&storage, fourth).await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["author"], "ann");
    }

    #[tokio::test]
    async fn reduce_folds_with_running_index() {
        let storage = seeded_storage().await;
        let total = storage.reduce(
            &DbIterator::values("articles", None),
            |acc, record, _| json!(acc.as_i64().unwrap() + record["rating"].as_i64().unwrap()),
            json!(0),
        );
        assert_eq!(total.outcome().await.unwrap(), json!(23));

        let type_b = DbIterator::index_values("articles", "type", Some(KeyRange::only("b")));
        let indexed = storage.reduce(
            &type_b,
            |mut acc, pk, i| {
                acc.as_array_mut().unwrap().push(json!([i, pk]));
                acc
            },
            json!([]),
        );
        assert_eq!(indexed.outcome().await.unwrap(), json!([[0, 2], [1, 5], [2, 6]]));

        let missing = DbIterator::keys("articles", Some(KeyRange::only(99)));
        let empty = storage.reduce(&missing, |_, _, _| json!("touched"), json!("initial"));
        assert_eq!(empty.outcome().await.unwrap(), json!("initial"));
        assert_eq!(storage.metrics().snapshot().cursor_count, 3);
    }

    #[test]
    fn operations_without_runtime_reject() {
        let storage = Storage::new(crate::MemoryBackend::new(sample_schema()));
        let req = storage.get("articles", 1);
        assert!(req.peek().unwrap().unwrap_err().is_invalid_state());
    }

    #[test]
    fn invalid_config_is_rejected() {
        let backend = crate::MemoryBackend::new(sample_schema());
        let config = StorageConfig::builder().default_result_limit(0).build();
        assert!(Storage::with_config(backend, config).is_err());
    }

    #[test]
    fn unknown_store_is_argument_error() {
        let storage = Storage::new(crate::MemoryBackend::new(sample_schema()));
        assert!(storage.from("nope").unwrap_err().is_argument());
    }
}
