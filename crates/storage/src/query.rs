//! Fluent query builder.
//!
//! A [`Query`] wraps one scan (or, for conjunctions, several) plus the
//! projection to produce. Builder methods never mutate the receiver; each
//! returns a new query with a fresh resume marker.
//!
//! # Pagination
//!
//! [`Query::list`] resumes from where the previous call on the *same*
//! instance stopped, so repeated calls page forward. Once the scan is
//! exhausted further calls resolve with an empty list until
//! [`Query::reset`]. Two call sites that each need their own pagination
//! must use separate instances, see [`Query::copy`].
//!
//! ```
//! use cursordb_storage::testutil::seeded_storage;
//! use serde_json::json;
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let storage = seeded_storage().await;
//! let query = storage.from("articles").unwrap().select(&["id"]).unwrap();
//! assert_eq!(query.list(Some(5)).outcome().await.unwrap(), json!([1, 2, 3, 4, 5]));
//! assert_eq!(query.list(Some(5)).outcome().await.unwrap(), json!([6, 7]));
//! assert_eq!(query.list(Some(5)).outcome().await.unwrap(), json!([]));
//! # });
//! ```
//!
//! # Conjunctions
//!
//! [`Query::and`], or [`Query::where_`] on a second index, produces a query
//! over several independent scans. Its results are the intersection of the
//! scans' primary keys, in ascending primary key order. After each member
//! scan the request reports progress as
//! `{"scanned": i, "of": n, "matches": m}`, where `m` is the number of keys
//! still in the intersection.

use std::{collections::BTreeSet, fmt, ops::Bound, sync::Arc};

use parking_lot::Mutex;
use serde_json::{Map, Value, json};

use crate::{
    backend::{CursorCallback, CursorStep, ListScan, QueryMethod},
    deferred::{Deferred, TransactionMode},
    error::{DbError, DbResult},
    iterator::{CursorPosition, DbIterator},
    key::Key,
    key_range::KeyRange,
    request::{Method, Request},
    schema::{IndexSchema, StoreSchema, set_path},
    storage::Storage,
};

/// Projection a query produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryType {
    /// Full records.
    Values,
    /// Primary keys.
    PrimaryKeys,
    /// Index keys of the scanned index.
    IndexKeys,
    /// `[index key, primary key]` pairs.
    KeyPairs,
}

#[derive(Debug, Clone)]
enum Plan {
    Single(DbIterator),
    Conj(Vec<DbIterator>),
}

/// Field update applied by [`Query::patch`].
#[derive(Debug, Clone, PartialEq)]
pub enum Patch {
    /// Set one field, dotted paths allowed.
    Field {
        /// Field path.
        field: String,
        /// New value.
        value: Value,
    },
    /// Set several fields; `fields[i]` receives `values[i]`.
    Fields {
        /// Field paths.
        fields: Vec<String>,
        /// New values, same length as `fields`.
        values: Vec<Value>,
    },
    /// Shallow merge of an object into the record.
    Merge(Map<String, Value>),
}

impl Patch {
    /// Sets one field.
    pub fn field(field: impl Into<String>, value: Value) -> Self {
        Self::Field { field: field.into(), value }
    }

    /// Builds a patch from loosely typed input: a field name with a value,
    /// an array of field names with an array of values, or an object alone.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Argument`] for any other shape.
    pub fn parse(fields: &Value, values: Option<&Value>) -> DbResult<Self> {
        match (fields, values) {
            (Value::String(field), Some(value)) => Ok(Self::field(field.clone(), value.clone())),
            (Value::String(field), None) => {
                Err(DbError::argument(format!("patch of field '{field}' needs a value")))
            },
            (Value::Array(names), Some(Value::Array(values))) => {
                let fields = names
                    .iter()
                    .map(|name| {
                        name.as_str().map(str::to_owned).ok_or_else(|| {
                            DbError::argument(format!(
                                "patch field names must be strings, got {name}"
                            ))
                        })
                    })
                    .collect::<DbResult<Vec<_>>>()?;
                Ok(Self::Fields { fields, values: values.clone() })
            },
            (Value::Array(_), _) => {
                Err(DbError::argument("an array of patch fields needs an array of values"))
            },
            (Value::Object(map), None) => Ok(Self::Merge(map.clone())),
            (Value::Object(_), Some(_)) => {
                Err(DbError::argument("an object patch takes no separate values"))
            },
            (other, _) => Err(DbError::argument(format!(
                "patch expects a field name, an array of field names or an object, got {other}"
            ))),
        }
    }

    fn validate(&self, store: &StoreSchema) -> DbResult<()> {
        let touches_primary_key = |field: &str| {
            store.is_primary_key(field)
                || store.key_path.split('.').next().is_some_and(|head| head == field)
        };
        let names: Vec<&str> = match self {
            Self::Field { field, .. } => vec![field.as_str()],
            Self::Fields { fields, values } => {
                if fields.len() != values.len() {
                    return Err(DbError::argument(format!(
                        "patch has {} fields but {} values",
                        fields.len(),
                        values.len()
                    )));
                }
                fields.iter().map(String::as_str).collect()
            },
            Self::Merge(map) => map.keys().map(String::as_str).collect(),
        };
        if names.is_empty() {
            return Err(DbError::argument("patch must set at least one field"));
        }
        for name in names {
            if name.is_empty() {
                return Err(DbError::argument("patch field names must not be empty"));
            }
            if touches_primary_key(name) {
                return Err(DbError::argument(format!(
                    "patch must not change the primary key '{}'",
                    store.key_path
                )));
            }
        }
        Ok(())
    }

    fn apply(&self, record: &mut Value) -> DbResult<()> {
        match self {
            Self::Field { field, value } => set_path(record, field, value.clone()),
            Self::Fields { fields, values } => {
                for (field, value) in fields.iter().zip(values) {
                    set_path(record, field, value.clone())?;
                }
                Ok(())
            },
            Self::Merge(map) => {
                let Value::Object(target) = record else {
                    return Err(DbError::argument("cannot merge a patch into a non-object record"));
                };
                target.extend(map.iter().map(|(k, v)| (k.clone(), v.clone())));
                Ok(())
            },
        }
    }
}

/// Immutable query over one store.
pub struct Query {
    storage: Storage,
    store: Arc<StoreSchema>,
    kind: QueryType,
    plan: Plan,
    marker: Arc<Mutex<CursorPosition>>,
}

impl Query {
    pub(crate) fn new(storage: Storage, store: &str) -> DbResult<Self> {
        let store = storage.store_schema(store)?;
        let plan = Plan::Single(DbIterator::values(store.name.clone(), None));
        Ok(Self { storage, store, kind: QueryType::Values, plan, marker: Arc::default() })
    }

    fn derive(&self, kind: QueryType, plan: Plan) -> DbResult<Self> {
        let conj = matches!(plan, Plan::Conj(_));
        if conj && !matches!(kind, QueryType::Values | QueryType::PrimaryKeys) {
            return Err(DbError::argument(
                "a conjunctive query can only select full records or primary keys",
            ));
        }
        Ok(Self {
            storage: self.storage.clone(),
            store: Arc::clone(&self.store),
            kind,
            plan,
            marker: Arc::default(),
        })
    }

    fn single(&self, op: &str) -> DbResult<&DbIterator> {
        match &self.plan {
            Plan::Single(iter) => Ok(iter),
            Plan::Conj(_) => Err(DbError::argument(format!(
                "{op} is not available on a conjunctive query, which lists in primary key \
                 order"
            ))),
        }
    }

    fn index_for(&self, field: &str) -> Option<&IndexSchema> {
        self.store.index(field).or_else(|| self.store.index_by_key_path(&[field]))
    }

    /// Index a condition on `field` scans: `None` for the primary key.
    fn target_for(&self, field: &str) -> DbResult<Option<String>> {
        if self.store.is_primary_key(field) {
            return Ok(None);
        }
        self.index_for(field).map(|index| Some(index.name.clone())).ok_or_else(|| {
            DbError::argument(format!(
                "field '{field}' is not indexed in store '{}'",
                self.store.name
            ))
        })
    }

    /// Name of the store queried.
    #[must_use]
    pub fn store_name(&self) -> &str {
        &self.store.name
    }

    /// Projection produced by [`list`](Self::list).
    #[must_use]
    pub fn kind(&self) -> QueryType {
        self.kind
    }

    /// Returns `true` for queries over several scans.
    #[must_use]
    pub fn is_conjunction(&self) -> bool {
        matches!(self.plan, Plan::Conj(_))
    }

    /// The scans this query evaluates.
    #[must_use]
    pub fn iterators(&self) -> Vec<DbIterator> {
        match &self.plan {
            Plan::Single(iter) => vec![iter.clone()],
            Plan::Conj(iters) => iters.clone(),
        }
    }

    /// The scan of a non-conjunctive query.
    pub(crate) fn single_iterator(&self) -> Option<&DbIterator> {
        match &self.plan {
            Plan::Single(iter) => Some(iter),
            Plan::Conj(_) => None,
        }
    }

    /// Where the next [`list`](Self::list) call resumes.
    #[must_use]
    pub fn position(&self) -> CursorPosition {
        self.marker.lock().clone()
    }

    /// Restricts `field` with comparison operators.
    ///
    /// A condition on the field the query already scans, or on a fresh
    /// query, refines that scan's range. A condition on another field adds
    /// a second scan and turns the query into a conjunction.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Argument`] for an unindexed field, invalid
    /// operators, or ranges that do not overlap.
    pub fn where_(
        &self,
        field: &str,
        op: &str,
        value: impl Into<Key>,
        op2: Option<&str>,
        value2: Option<Key>,
    ) -> DbResult<Self> {
        self.where_range(field, KeyRange::where_(op, value, op2, value2)?)
    }

    /// Restricts `field` to `range`, see [`where_`](Self::where_).
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Argument`] for an unindexed field or ranges that do
    /// not overlap.
    pub fn where_range(&self, field: &str, range: KeyRange) -> DbResult<Self> {
        let target = self.target_for(field)?;
        let condition = DbIterator::values(self.store.name.clone(), None)
            .on_index(target.clone(), Some(range.clone()));

        let plan = match &self.plan {
            Plan::Single(iter) if iter.index_name() == target.as_deref() => {
                Plan::Single(iter.with_range(range)?)
            },
            Plan::Single(iter) if iter.is_fresh() => {
                Plan::Single(iter.on_index(target, Some(range)))
            },
            Plan::Single(iter) => Plan::Conj(vec![condition, iter.clone()]),
            Plan::Conj(iters) => {
                let mut iters = iters.clone();
                match iters.iter().position(|i| i.index_name() == target.as_deref()) {
                    Some(pos) => iters[pos] = iters[pos].with_range(range)?,
                    None => iters.insert(0, condition),
                }
                Plan::Conj(iters)
            },
        };
        self.derive(self.kind, plan)
    }

    /// Chooses the projection.
    ///
    /// - `["*"]`: full records.
    /// - `[primary key]`: primary keys.
    /// - `[indexed field]`: index keys, scanning in that index's order.
    /// - `[primary key, current index field]` in either order: key pairs.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Argument`] for more than two fields, unindexed
    /// fields, or field pairs other than primary key plus current index.
    pub fn select(&self, fields: &[&str]) -> DbResult<Self> {
        match fields {
            [] => Err(DbError::argument("select requires at least one field")),
            ["*"] => self.derive(QueryType::Values, self.plan.clone()),
            [field] if self.store.is_primary_key(field) => {
                self.derive(QueryType::PrimaryKeys, self.plan.clone())
            },
            [field] => {
                let iter = self.single("selecting an index field")?;
                let index = self.index_for(field).ok_or_else(|| {
                    DbError::argument(format!(
                        "cannot select '{field}': not the primary key and not indexed in store \
                         '{}'",
                        self.store.name
                    ))
                })?;
                let ordered = if iter.index_name() == Some(index.name.as_str()) {
                    iter.clone()
                } else {
                    let path: Vec<&str> = index.key_path.iter().map(String::as_str).collect();
                    iter.order(&path, &self.store)?
                };
                if ordered.index_name() != Some(index.name.as_str()) {
                    return Err(DbError::argument(format!(
                        "cannot select '{field}' while scanning {iter}"
                    )));
                }
                self.derive(QueryType::IndexKeys, Plan::Single(ordered))
            },
            [a, b] => {
                let iter = self.single("selecting a key pair")?;
                let current = iter
                    .index_name()
                    .and_then(|name| self.store.index(name))
                    .ok_or_else(|| {
                        DbError::argument("selecting two fields requires an index scan")
                    })?;
                let is_current = |f: &str| {
                    f == current.name || (current.key_path.len() == 1 && current.key_path[0] == f)
                };
                let pair = (self.store.is_primary_key(a) && is_current(b))
                    || (self.store.is_primary_key(b) && is_current(a));
                if !pair {
                    return Err(DbError::argument(format!(
                        "selecting two fields requires the primary key '{}' and the field of \
                         index '{}'",
                        self.store.key_path, current.name
                    )));
                }
                self.derive(QueryType::KeyPairs, self.plan.clone())
            },
            _ => Err(DbError::argument(format!(
                "select accepts at most two fields, got {}",
                fields.len()
            ))),
        }
    }

    /// Orders results by `fields`, see [`DbIterator::order`].
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Argument`] when the order is incompatible with the
    /// current scan.
    pub fn order(&self, fields: &[&str]) -> DbResult<Self> {
        let iter = self.single("order")?;
        self.derive(self.kind, Plan::Single(iter.order(fields, &self.store)?))
    }

    /// Collapses duplicate index keys (or stops doing so).
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Argument`] on a conjunctive query.
    pub fn unique(&self, unique: bool) -> DbResult<Self> {
        let iter = self.single("unique")?;
        self.derive(self.kind, Plan::Single(iter.unique(unique)))
    }

    /// Flips the scan direction.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Argument`] on a conjunctive query.
    pub fn reverse(&self) -> DbResult<Self> {
        let iter = self.single("reverse")?;
        self.derive(self.kind, Plan::Single(iter.reverse()))
    }

    /// Combines with `other` into a conjunction. The result scans `other`'s
    /// iterators first, then this query's.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Argument`] if the queries target different stores
    /// or this query's projection is not records or primary keys.
    pub fn and(&self, other: &Query) -> DbResult<Self> {
        if other.store.name != self.store.name {
            return Err(DbError::argument(format!(
                "cannot combine queries over '{}' and '{}'",
                self.store.name, other.store.name
            )));
        }
        let mut iters = other.iterators();
        iters.extend(self.iterators());
        self.derive(self.kind, Plan::Conj(iters))
    }

    /// Same query with its own, fresh pagination.
    #[must_use]
    pub fn copy(&self) -> Self {
        Self {
            storage: self.storage.clone(),
            store: Arc::clone(&self.store),
            kind: self.kind,
            plan: self.plan.clone(),
            marker: Arc::default(),
        }
    }

    /// Restarts pagination from the beginning.
    pub fn reset(&self) {
        *self.marker.lock() = CursorPosition::Initial;
    }

    /// Lists the next page of at most `limit` results (the configured
    /// default for `None`).
    pub fn list(&self, limit: Option<usize>) -> Request {
        self.list_offset(limit, 0)
    }

    /// Like [`list`](Self::list), but first skips `offset` matches. The skip
    /// happens inside the scan, so large offsets cost no result transfer.
    pub fn list_offset(&self, limit: Option<usize>, offset: usize) -> Request {
        let tag = match self.kind {
            QueryType::Values => Method::ValuesIter,
            _ => Method::KeysIter,
        };
        let limit = self.storage.limit_or_default(limit);
        self.list_into(self.storage.request(tag), limit, offset)
    }

    pub(crate) fn list_into(&self, req: Request, limit: usize, offset: usize) -> Request {
        match &self.plan {
            Plan::Single(iter) => self.list_single(req, iter, limit, offset),
            Plan::Conj(iters) => self.list_conj(req, iters, limit, offset),
        }
    }

    fn list_single(&self, req: Request, iter: &DbIterator, limit: usize, offset: usize) -> Request {
        let (method, iter) = match self.kind {
            QueryType::Values => (QueryMethod::ListValue, iter.as_value_iterator()),
            QueryType::PrimaryKeys => (QueryMethod::ListPrimaryKey, iter.as_key_iterator()),
            QueryType::IndexKeys => (QueryMethod::ListKey, iter.as_key_iterator()),
            QueryType::KeyPairs => (QueryMethod::ListKeys, iter.as_key_iterator()),
        };
        let scan = ListScan::new(method, iter.with_position(self.position()))
            .limit(Some(limit))
            .offset(offset);
        let report = scan.report.clone();
        let marker = Arc::clone(&self.marker);

        let _ = req.await_with(move |outcome, next| {
            if outcome.is_ok() {
                if let Some(position) = report.get() {
                    *marker.lock() = position;
                }
            }
            next.resume(outcome);
        });
        self.storage.submit_scan(req, scan)
    }

    fn list_conj(
        &self,
        req: Request,
        iters: &[DbIterator],
        limit: usize,
        offset: usize,
    ) -> Request {
        let storage = self.storage.clone();
        let store = Arc::clone(&self.store);
        let iters = iters.to_vec();
        let kind = self.kind;
        let after = self.position();
        let marker = Arc::clone(&self.marker);

        let work = {
            let req = req.clone();
            async move {
                let page = async {
                    let keys = intersect(&storage, &iters, &req).await?;
                    let (page, position) = page_after(&keys, &after, offset, limit);
                    let value = match kind {
                        QueryType::Values => fetch_records(&storage, &store, &page).await?,
                        _ => Value::Array(page.iter().map(Key::to_json).collect()),
                    };
                    Ok::<_, DbError>((value, position))
                };
                match page.await {
                    Ok((value, position)) => {
                        *marker.lock() = position;
                        let _ = req.set_db_value(Ok(value));
                    },
                    Err(err) => {
                        let _ = req.set_db_value(Err(err));
                    },
                }
            }
        };
        self.storage.spawn(&req, work);
        req
    }

    /// Counts matches. Unique scans count through the iterator so duplicates
    /// are collapsed.
    pub fn count(&self) -> Request {
        let iter = match &self.plan {
            Plan::Single(iter) => iter,
            Plan::Conj(iters) => {
                let req = self.storage.request(Method::Count);
                let storage = self.storage.clone();
                let iters = iters.clone();
                let work = {
                    let req = req.clone();
                    async move {
                        let count = intersect(&storage, &iters, &req)
                            .await
                            .map(|keys| Value::from(keys.len()));
                        let _ = req.set_db_value(count);
                    }
                };
                self.storage.spawn(&req, work);
                return req;
            },
        };
        let range = iter.key_range().cloned();
        if iter.is_unique() {
            self.storage.count_iter(iter)
        } else if let Some(index) = iter.index_name() {
            self.storage.count_index(&self.store.name, index, range)
        } else {
            self.storage.count(&self.store.name, range)
        }
    }

    /// Deletes the records this query matches.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::NotSupported`] for conjunctive queries.
    pub fn clear(&self) -> DbResult<Request> {
        let Plan::Single(iter) = &self.plan else {
            return Err(DbError::not_supported("clear on a conjunctive query"));
        };
        let range = iter.key_range().cloned();
        Ok(match iter.index_name() {
            Some(index) => self.storage.clear_index(&self.store.name, index, range),
            None => self.storage.clear(&self.store.name, range),
        })
    }

    /// Applies `patch` to every matched record in one read-write cursor
    /// scan. Resolves with the number of distinct records patched, once
    /// every write has settled.
    ///
    /// # Errors
    ///
    /// - [`DbError::Argument`] for a malformed patch or one that touches the
    ///   primary key.
    /// - [`DbError::NotSupported`] for conjunctive queries.
    pub fn patch(&self, patch: Patch) -> DbResult<Request> {
        patch.validate(&self.store)?;
        let Plan::Single(iter) = &self.plan else {
            return Err(DbError::not_supported("patch on a conjunctive query"));
        };

        let req = self.storage.request(Method::Open);
        let metrics = self.storage.metrics().clone();
        let patched: Arc<Mutex<BTreeSet<Key>>> = Arc::default();
        let counted = Arc::clone(&patched);
        let _ = req.map(move |_visited| {
            let n = counted.lock().len();
            metrics.record_patched(n as u64);
            Ok(Value::from(n))
        });
        let callback: CursorCallback = Box::new(move |entry| {
            let Some(mut record) = entry.value().cloned() else {
                return Ok(CursorStep::Continue);
            };
            // Multi-entry indexes visit a record once per element.
            if !patched.lock().insert(entry.primary_key().clone()) {
                return Ok(CursorStep::Continue);
            }
            patch.apply(&mut record)?;
            let _write = entry.update(record);
            Ok(CursorStep::Continue)
        });
        Ok(self.storage.submit_open(
            req,
            iter.as_value_iterator().copy(),
            TransactionMode::ReadWrite,
            callback,
        ))
    }
}

/// Primary keys every scan in `iters` visits. Reports progress on `req`
/// after each scan.
async fn intersect(
    storage: &Storage,
    iters: &[DbIterator],
    req: &Request,
) -> DbResult<BTreeSet<Key>> {
    let mut acc: Option<BTreeSet<Key>> = None;
    for (i, iter) in iters.iter().enumerate() {
        let scan = ListScan::new(QueryMethod::ListPrimaryKey, iter.as_key_iterator().copy());
        let listed = storage.submit_scan(storage.request(Method::KeysIter), scan).outcome().await?;
        let keys: BTreeSet<Key> = listed
            .as_array()
            .map(|keys| keys.iter().filter_map(Key::from_json).collect())
            .unwrap_or_default();
        let merged = match acc {
            None => keys,
            Some(prev) => prev.intersection(&keys).cloned().collect(),
        };
        let _ = req.notify(&json!({"scanned": i + 1, "of": iters.len(), "matches": merged.len()}));
        if merged.is_empty() {
            return Ok(merged);
        }
        acc = Some(merged);
    }
    Ok(acc.unwrap_or_default())
}

/// Records of `page`, primary keys in ascending order, read in a single
/// primary key scan. Keys whose record is gone by now are left out.
async fn fetch_records(storage: &Storage, store: &StoreSchema, page: &[Key]) -> DbResult<Value> {
    let (Some(first), Some(last)) = (page.first(), page.last()) else {
        return Ok(Value::Array(Vec::new()));
    };
    let range = KeyRange::bound(first.clone(), last.clone(), false, false)?;
    let iter = DbIterator::values(store.name.clone(), Some(range));
    let scan = ListScan::new(QueryMethod::ListValue, iter);
    let listed = storage.submit_scan(storage.request(Method::ValuesIter), scan).outcome().await?;
    let records = match listed {
        Value::Array(records) => records,
        other => return Err(DbError::internal(format!("value scan resolved with {other}"))),
    };
    Ok(Value::Array(
        records
            .into_iter()
            .filter(|record| {
                store.extract_primary_key(record).is_ok_and(|pk| page.binary_search(&pk).is_ok())
            })
            .collect(),
    ))
}

/// Up to `limit` keys after `after`, plus the position to resume from.
fn page_after(
    keys: &BTreeSet<Key>,
    after: &CursorPosition,
    offset: usize,
    limit: usize,
) -> (Vec<Key>, CursorPosition) {
    let mut rest: Box<dyn Iterator<Item = &Key>> = match after {
        CursorPosition::Completed => return (Vec::new(), CursorPosition::Completed),
        CursorPosition::Resting { primary_key, .. } => {
            Box::new(keys.range::<Key, _>((Bound::Excluded(primary_key), Bound::Unbounded)))
        },
        CursorPosition::Initial => Box::new(keys.iter()),
    };
    let page: Vec<Key> = rest.by_ref().skip(offset).take(limit).cloned().collect();
    let more = rest.next().is_some();
    let position = match page.last() {
        Some(last) if more => {
            CursorPosition::Resting { key: last.clone(), primary_key: last.clone() }
        },
        None if more => after.clone(),
        _ => CursorPosition::Completed,
    };
    (page, position)
}

impl fmt::Debug for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("store", &self.store.name)
            .field("kind", &self.kind)
            .field("plan", &self.plan)
            .field("marker", &*self.marker.lock())
            .finish()
    }
}
