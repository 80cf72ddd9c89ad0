//! In-memory back-end.
//!
//! [`MemoryBackend`] implements [`Backend`] over ordered maps and is the
//! in-memory fallback engine as well as the reference adapter for tests.
//!
//! # Layout
//!
//! - records: `BTreeMap<primary key, record>` per store
//! - indexes: `BTreeMap<index key, BTreeSet<primary key>>` per index, so an
//!   index scan visits entries by index key, then primary key
//!
//! # Transactions
//!
//! Every operation runs in its own [`MemoryTx`]. Read-only operations read
//! committed data under a shared lock. Read-write operations are serialized
//! by a write gate, work on a private copy of the store, resolve the request,
//! and only then install the copy, unless the transaction was aborted in the
//! meantime. Aborting from a transform or a cursor callback therefore rolls
//! every write of the operation back.
//!
//! # Example
//!
//! ```
//! use cursordb_storage::{DatabaseSchema, MemoryBackend, Storage, StoreSchema};
//! use serde_json::json;
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let schema = DatabaseSchema::new(vec![StoreSchema::new("notes", "id")]);
//! let storage = Storage::new(MemoryBackend::new(schema));
//!
//! storage.put("notes", json!({"id": 1, "text": "hi"})).outcome().await.unwrap();
//! let note = storage.get("notes", 1).outcome().await.unwrap();
//! assert_eq!(note["text"], "hi");
//! # });
//! ```

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    ops::Bound,
    sync::{
        Arc,
        atomic::{AtomicU8, AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use fail::fail_point;
use parking_lot::RwLock;
use serde_json::{Value, json};
use tracing::{debug, trace};

use crate::{
    backend::{
        Backend, CursorCallback, CursorEntry, CursorStep, CursorWrite, ListScan, QueryMethod,
        Scope,
    },
    deferred::{Deferred, TransactionMode, Transactional, TxHandle},
    error::{DbError, DbResult},
    iterator::{CursorPosition, DbIterator},
    key::Key,
    key_range::KeyRange,
    request::Request,
    schema::{DatabaseSchema, StoreSchema},
};

type IndexEntries = BTreeMap<Key, BTreeSet<Key>>;
type ScanIter<'a> = Box<dyn Iterator<Item = (&'a Key, &'a Key)> + 'a>;

/// Records and index entries of one store.
#[derive(Debug, Clone, Default)]
struct StoreData {
    records: BTreeMap<Key, Value>,
    indexes: BTreeMap<String, IndexEntries>,
}

impl StoreData {
    fn new(schema: &StoreSchema) -> Self {
        Self {
            records: BTreeMap::new(),
            indexes: schema.indexes.iter().map(|i| (i.name.clone(), IndexEntries::new())).collect(),
        }
    }

    /// Inserts or overwrites `record`, keeping indexes in step.
    fn put(&mut self, schema: &StoreSchema, record: Value) -> DbResult<Key> {
        let pk = schema.extract_primary_key(&record)?;

        for index in schema.indexes.iter().filter(|i| i.unique) {
            let Some(entries) = self.indexes.get(&index.name) else { continue };
            for key in index.extract_keys(&record) {
                let taken =
                    entries.get(&key).is_some_and(|pks| pks.iter().any(|other| other != &pk));
                if taken {
                    return Err(DbError::constraint(format!(
                        "unique index '{}' of store '{}' already contains {key}",
                        index.name, schema.name
                    )));
                }
            }
        }

        self.delete(schema, &pk);
        for index in &schema.indexes {
            let entries = self.indexes.entry(index.name.clone()).or_default();
            for key in index.extract_keys(&record) {
                entries.entry(key).or_default().insert(pk.clone());
            }
        }
        self.records.insert(pk.clone(), record);
        Ok(pk)
    }

    /// Deletes the record at `pk`. Returns whether it existed.
    fn delete(&mut self, schema: &StoreSchema, pk: &Key) -> bool {
        let Some(old) = self.records.remove(pk) else {
            return false;
        };
        for index in &schema.indexes {
            let Some(entries) = self.indexes.get_mut(&index.name) else { continue };
            for key in index.extract_keys(&old) {
                if let Some(pks) = entries.get_mut(&key) {
                    pks.remove(pk);
                    if pks.is_empty() {
                        entries.remove(&key);
                    }
                }
            }
        }
        true
    }

    /// Yields `(effective key, primary key)` pairs in scan order, starting
    /// strictly after the iterator's resting position.
    fn scan<'a>(&'a self, iter: &'a DbIterator) -> DbResult<ScanIter<'a>> {
        let (lower, upper) = iter
            .key_range()
            .map_or((Bound::Unbounded, Bound::Unbounded), KeyRange::bounds);
        let resume = match iter.position() {
            CursorPosition::Completed => return Ok(Box::new(std::iter::empty())),
            CursorPosition::Resting { key, primary_key } => Some((key, primary_key)),
            CursorPosition::Initial => None,
        };
        let reverse = iter.is_reversed();
        let (lower, upper) = match resume {
            Some((key, _)) if reverse => (lower, tighter_upper(upper, key)),
            Some((key, _)) => (tighter_lower(lower, key), upper),
            None => (lower, upper),
        };
        if !bounds_valid(lower, upper) {
            return Ok(Box::new(std::iter::empty()));
        }

        let Some(index_name) = iter.index_name() else {
            let keys = self.records.range::<Key, _>((lower, upper)).map(|(k, _)| (k, k));
            let keys: ScanIter<'a> = if reverse { Box::new(keys.rev()) } else { Box::new(keys) };
            return Ok(match resume {
                Some((rk, _)) => {
                    Box::new(
                        keys.skip_while(move |(k, _)| if reverse { *k >= rk } else { *k <= rk }),
                    )
                },
                None => keys,
            });
        };

        let entries = self.indexes.get(index_name).ok_or_else(|| {
            DbError::not_found(format!("index '{index_name}' in store '{}'", iter.store_name()))
        })?;
        let unique = iter.is_unique();
        let ranged = entries.range::<Key, _>((lower, upper));
        // Unique scans pick the lowest primary key in both directions.
        let flat: ScanIter<'a> = match (reverse, unique) {
            (false, false) => {
                Box::new(ranged.flat_map(|(k, pks)| pks.iter().map(move |pk| (k, pk))))
            },
            (true, false) => {
                Box::new(ranged.rev().flat_map(|(k, pks)| pks.iter().rev().map(move |pk| (k, pk))))
            },
            (false, true) => Box::new(ranged.filter_map(|(k, pks)| pks.first().map(|pk| (k, pk)))),
            (true, true) => {
                Box::new(ranged.rev().filter_map(|(k, pks)| pks.first().map(|pk| (k, pk))))
            },
        };
        Ok(match resume {
            None => flat,
            Some((rk, rpk)) => Box::new(flat.skip_while(move |(k, pk)| match (unique, reverse) {
                (true, false) => *k <= rk,
                (true, true) => *k >= rk,
                (false, false) => (*k, *pk) <= (rk, rpk),
                (false, true) => (*k, *pk) >= (rk, rpk),
            })),
        })
    }

    fn list(&self, scan: &ListScan) -> DbResult<Value> {
        fail_point!("memory-list-iter", |_| {
            Err(DbError::internal("injected failure in memory list scan"))
        });

        let limit = match scan.method {
            QueryMethod::Get => Some(1),
            _ => scan.limit,
        };
        let mut entries = self.scan(&scan.iter)?.skip(scan.offset).peekable();
        let mut out = Vec::new();
        let mut taken = 0usize;
        let mut last = None;
        while limit.is_none_or(|l| taken < l) {
            let Some((key, pk)) = entries.next() else { break };
            taken += 1;
            match scan.method {
                QueryMethod::Get | QueryMethod::ListValue => {
                    if let Some(record) = self.records.get(pk) {
                        out.push(record.clone());
                    }
                },
                QueryMethod::ListPrimaryKey => out.push(pk.to_json()),
                QueryMethod::ListKey => out.push(key.to_json()),
                QueryMethod::ListKeys => out.push(json!([key.to_json(), pk.to_json()])),
                QueryMethod::Count => {},
            }
            last = Some((key, pk));
        }

        let more = entries.peek().is_some();
        let position = match last {
            Some((key, pk)) if more => {
                CursorPosition::Resting { key: key.clone(), primary_key: pk.clone() }
            },
            None if more => scan.iter.position().clone(),
            _ => CursorPosition::Completed,
        };
        trace!(iter = %scan.iter, taken, ?position, "List scan finished");
        scan.report.record(position);

        Ok(match scan.method {
            QueryMethod::Get => out.into_iter().next().unwrap_or(Value::Null),
            QueryMethod::Count => json!(taken),
            _ => Value::Array(out),
        })
    }

    /// Distinct primary keys visited by `iter`, in scan order.
    fn primary_keys(&self, iter: &DbIterator) -> DbResult<Vec<Key>> {
        let mut seen = BTreeSet::new();
        Ok(self.scan(iter)?.filter(|(_, pk)| seen.insert(*pk)).map(|(_, pk)| pk.clone()).collect())
    }
}

/// `(key, primary key, record)` for each entry `iter` visits in `data`. The
/// record is only cloned when `with_values` is set.
fn cursor_entries(
    data: &StoreData,
    iter: &DbIterator,
    with_values: bool,
) -> DbResult<Vec<(Key, Key, Option<Value>)>> {
    Ok(data
        .scan(iter)?
        .map(|(k, pk)| {
            let value = if with_values { data.records.get(pk).cloned() } else { None };
            (k.clone(), pk.clone(), value)
        })
        .collect())
}

fn tighter_lower<'k>(lower: Bound<&'k Key>, key: &'k Key) -> Bound<&'k Key> {
    match lower {
        Bound::Included(l) | Bound::Excluded(l) if l >= key => lower,
        _ => Bound::Included(key),
    }
}

fn tighter_upper<'k>(upper: Bound<&'k Key>, key: &'k Key) -> Bound<&'k Key> {
    match upper {
        Bound::Included(u) | Bound::Excluded(u) if u <= key => upper,
        _ => Bound::Included(key),
    }
}

/// `BTreeMap::range` panics on inverted bounds; treat them as empty.
fn bounds_valid(lower: Bound<&Key>, upper: Bound<&Key>) -> bool {
    match (lower, upper) {
        (Bound::Included(l), Bound::Included(u)) => l <= u,
        (Bound::Included(l) | Bound::Excluded(l), Bound::Excluded(u))
        | (Bound::Excluded(l), Bound::Included(u)) => l < u,
        _ => true,
    }
}

fn apply_cursor_write(
    working: &mut StoreData,
    schema: &StoreSchema,
    pk: &Key,
    write: CursorWrite,
) -> DbResult<Value> {
    fail_point!("memory-cursor-write", |_| {
        Err(DbError::internal("injected failure in memory cursor write"))
    });

    match write {
        CursorWrite::Update(record) => {
            let new_pk = schema.extract_primary_key(&record)?;
            if &new_pk != pk {
                return Err(DbError::argument(format!(
                    "cursor update must keep primary key {pk}, got {new_pk}"
                )));
            }
            working.put(schema, record).map(|k| k.to_json())
        },
        CursorWrite::Delete => {
            working.delete(schema, pk);
            Ok(Value::Null)
        },
    }
}

const TX_ACTIVE: u8 = 0;
const TX_COMMITTED: u8 = 1;
const TX_ABORTED: u8 = 2;

/// Transaction of the memory engine. Supports native abort.
#[derive(Debug)]
pub struct MemoryTx {
    label: String,
    mode: TransactionMode,
    state: AtomicU8,
}

impl MemoryTx {
    /// Returns `true` if the transaction was aborted.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.state.load(Ordering::SeqCst) == TX_ABORTED
    }

    /// Marks the transaction committed. Returns `false` if it was aborted.
    fn finish(&self) -> bool {
        self.state
            .compare_exchange(TX_ACTIVE, TX_COMMITTED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn rollback(&self) {
        // Already finished transactions stay as they are.
        let _ =
            self.state.compare_exchange(TX_ACTIVE, TX_ABORTED, Ordering::SeqCst, Ordering::SeqCst);
    }
}

impl TxHandle for MemoryTx {
    fn label(&self) -> &str {
        &self.label
    }

    fn mode(&self) -> TransactionMode {
        self.mode
    }

    fn is_active(&self) -> bool {
        self.state.load(Ordering::SeqCst) == TX_ACTIVE
    }

    fn abort(&self) -> DbResult<()> {
        self.state
            .compare_exchange(TX_ACTIVE, TX_ABORTED, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(|_| {
                DbError::invalid_state(format!("transaction {} already finished", self.label))
            })
    }
}

/// In-memory storage engine.
///
/// # Cloning
///
/// `MemoryBackend` is cheaply cloneable via [`Arc`]. All clones share the
/// same data.
#[derive(Clone)]
pub struct MemoryBackend {
    schema: Arc<DatabaseSchema>,
    data: Arc<RwLock<BTreeMap<String, StoreData>>>,
    write_gate: Arc<tokio::sync::Mutex<()>>,
    next_tx: Arc<AtomicU64>,
}

impl MemoryBackend {
    /// Creates an empty engine with one store per schema entry.
    pub fn new(schema: DatabaseSchema) -> Self {
        let data = schema.stores.iter().map(|s| (s.name.clone(), StoreData::new(s))).collect();
        Self {
            schema: Arc::new(schema),
            data: Arc::new(RwLock::new(data)),
            write_gate: Arc::new(tokio::sync::Mutex::new(())),
            next_tx: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Number of records in `store`, or `None` for an unknown store.
    #[must_use]
    pub fn len(&self, store: &str) -> Option<usize> {
        self.data.read().get(store).map(|s| s.records.len())
    }

    fn begin(&self, mode: TransactionMode) -> Arc<MemoryTx> {
        let id = self.next_tx.fetch_add(1, Ordering::Relaxed);
        let kind = match mode {
            TransactionMode::ReadOnly => "ro",
            TransactionMode::ReadWrite => "rw",
        };
        Arc::new(MemoryTx {
            label: format!("mem-{kind}-{id}"),
            mode,
            state: AtomicU8::new(TX_ACTIVE),
        })
    }

    fn store_schema(&self, store: &str) -> DbResult<Arc<StoreSchema>> {
        self.schema
            .store(store)
            .cloned()
            .ok_or_else(|| DbError::not_found(format!("store '{store}'")))
    }

    /// Binds `tx` to `req`; on failure delivers the error and returns `false`.
    fn attach(&self, req: &Request, tx: &Arc<MemoryTx>) -> bool {
        let handle: Arc<dyn TxHandle> = Arc::clone(tx) as Arc<dyn TxHandle>;
        match req.set_tx(handle, tx.label()) {
            Ok(()) => true,
            Err(err) => {
                let _ = req.set_db_value(Err(err));
                false
            },
        }
    }

    fn run_read<F>(&self, req: &Request, store: &str, op: F)
    where
        F: FnOnce(&StoreData) -> DbResult<Value>,
    {
        let tx = self.begin(TransactionMode::ReadOnly);
        if !self.attach(req, &tx) {
            return;
        }
        let outcome = {
            let data = self.data.read();
            match data.get(store) {
                Some(store_data) => op(store_data),
                None => Err(DbError::not_found(format!("store '{store}'"))),
            }
        };
        let _ = req.set_db_value(outcome);
        tx.finish();
        req.remove_tx();
    }

    async fn run_write<F>(&self, req: &Request, store: &str, op: F)
    where
        F: FnOnce(&mut StoreData, &StoreSchema) -> DbResult<Value> + Send,
    {
        let _gate = self.write_gate.lock().await;
        let tx = self.begin(TransactionMode::ReadWrite);
        if !self.attach(req, &tx) {
            return;
        }

        let staged = self.store_schema(store).and_then(|schema| {
            let mut working = self.snapshot(store)?;
            let value = op(&mut working, &schema)?;
            Ok((value, working))
        });
        let (outcome, working) = match staged {
            Ok((value, working)) => (Ok(value), Some(working)),
            Err(err) => {
                tx.rollback();
                (Err(err), None)
            },
        };

        let _ = req.set_db_value(outcome);
        self.commit(&tx, store, working);
        req.remove_tx();
    }

    fn snapshot(&self, store: &str) -> DbResult<StoreData> {
        self.data
            .read()
            .get(store)
            .cloned()
            .ok_or_else(|| DbError::not_found(format!("store '{store}'")))
    }

    fn commit(&self, tx: &MemoryTx, store: &str, working: Option<StoreData>) {
        if !tx.finish() {
            debug!(tx = %tx.label, store, "Transaction rolled back");
            return;
        }
        if let Some(working) = working {
            self.data.write().insert(store.to_owned(), working);
            trace!(tx = %tx.label, store, "Transaction committed");
        }
    }
}

impl fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBackend")
            .field(
                "stores",
                &self.schema.stores.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn schema(&self) -> &DatabaseSchema {
        &self.schema
    }

    fn mechanism(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, req: &Request, store: &str, key: &Key) {
        self.run_read(req, store, |data| Ok(data.records.get(key).cloned().unwrap_or(Value::Null)));
    }

    async fn put(&self, req: &Request, store: &str, records: Vec<Value>) {
        self.run_write(req, store, move |working, schema| {
            let keys = records
                .into_iter()
                .map(|record| working.put(schema, record).map(|k| k.to_json()))
                .collect::<DbResult<Vec<_>>>()?;
            Ok(Value::Array(keys))
        })
        .await;
    }

    async fn remove(&self, req: &Request, store: &str, range: &KeyRange) {
        let range = range.clone();
        self.run_write(req, store, move |working, schema| {
            let doomed: Vec<Key> =
                working.records.range::<Key, _>(range.bounds()).map(|(k, _)| k.clone()).collect();
            for pk in &doomed {
                working.delete(schema, pk);
            }
            Ok(json!(doomed.len()))
        })
        .await;
    }

    async fn list_iter(&self, req: &Request, scan: ListScan) {
        let store = scan.iter.store_name().to_owned();
        self.run_read(req, &store, |data| data.list(&scan));
    }

    async fn open(
        &self,
        req: &Request,
        iter: &DbIterator,
        mode: TransactionMode,
        mut callback: CursorCallback,
    ) {
        let _gate = match mode {
            TransactionMode::ReadWrite => Some(self.write_gate.lock().await),
            TransactionMode::ReadOnly => None,
        };
        let tx = self.begin(mode);
        if !self.attach(req, &tx) {
            return;
        }
        let store = iter.store_name().to_owned();

        // Read-only cursors take their entries from committed data; only
        // read-write cursors need a private copy to stage writes on.
        let staged = self.store_schema(&store).and_then(|schema| {
            let (working, entries) = match mode {
                TransactionMode::ReadWrite => {
                    let working = self.snapshot(&store)?;
                    let entries = cursor_entries(&working, iter, false)?;
                    (Some(working), entries)
                },
                TransactionMode::ReadOnly => {
                    let data = self.data.read();
                    let committed = data
                        .get(&store)
                        .ok_or_else(|| DbError::not_found(format!("store '{store}'")))?;
                    (None, cursor_entries(committed, iter, !iter.is_key_only())?)
                },
            };
            Ok((schema, working, entries))
        });
        let (schema, mut working, entries) = match staged {
            Ok(staged) => staged,
            Err(err) => {
                tx.rollback();
                let _ = req.set_db_value(Err(err));
                req.remove_tx();
                return;
            },
        };

        let mut visited = 0usize;
        let mut skip = 0usize;
        let mut outcome: DbResult<()> = Ok(());
        'scan: for (key, pk, prefetched) in entries {
            if !tx.is_active() {
                break;
            }
            if skip > 0 {
                skip -= 1;
                continue;
            }
            let value = if iter.is_key_only() {
                None
            } else {
                let current = match &working {
                    Some(working) => working.records.get(&pk).cloned(),
                    None => prefetched,
                };
                match current {
                    Some(record) => Some(record),
                    // Deleted earlier in this scan.
                    None => continue,
                }
            };

            let mut entry = CursorEntry::new(key, pk.clone(), value, req.clone());
            let step = match callback(&mut entry) {
                Ok(step) => step,
                Err(err) => {
                    outcome = Err(err);
                    break;
                },
            };
            visited += 1;

            for pending in entry.take_writes() {
                let result = match working.as_mut() {
                    Some(working) => apply_cursor_write(working, &schema, &pk, pending.write),
                    None => Err(DbError::invalid_state(format!(
                        "cursor of read-only transaction {} cannot write",
                        tx.label
                    ))),
                };
                let _ = pending.request.set_db_value(result);
                // The cursor does not advance until the nested write settles.
                if let Err(err) = pending.request.outcome().await {
                    outcome = Err(err);
                    break 'scan;
                }
            }

            match step {
                CursorStep::Continue => {},
                CursorStep::Advance(n) => skip = n.saturating_sub(1),
                CursorStep::Stop => break,
            }
        }
        if outcome.is_ok() && tx.is_aborted() {
            outcome = Err(DbError::aborted(format!("transaction {} was aborted", tx.label)));
        }

        let outcome = outcome.map(|()| json!(visited));
        if outcome.is_err() {
            tx.rollback();
        }
        let _ = req.set_db_value(outcome);
        self.commit(&tx, &store, working);
        req.remove_tx();
    }

    async fn count(&self, req: &Request, scope: &Scope) {
        let iter = scope.to_iterator();
        self.run_read(req, scope.store_name(), |data| Ok(json!(data.scan(&iter)?.count())));
    }

    async fn clear(&self, req: &Request, scope: &Scope) {
        let iter = scope.to_iterator();
        let store = scope.store_name().to_owned();
        self.run_write(req, &store, move |working, schema| {
            let doomed = working.primary_keys(&iter)?;
            for pk in &doomed {
                working.delete(schema, pk);
            }
            Ok(json!(doomed.len()))
        })
        .await;
    }
}
