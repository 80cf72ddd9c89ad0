//! Parsed SQL statements and their execution.
//!
//! Turning SQL text into a [`SqlStatement`] is the parser's job; this module
//! maps a statement that has already been parsed onto the query layer.
//!
//! A plain `SELECT *` whose conditions all target one indexed field runs as
//! a [`Query`](crate::Query) list. Everything else becomes one read-only
//! cursor scan:
//!
//! - conditions beyond the first indexed field are checked per record;
//! - field lists project each record to an object with just those fields;
//! - aggregates fold the matching records into a single value.
//!
//! `OFFSET` skips matches inside the scan in both cases. Without `LIMIT`
//! every match is returned. An aggregate always folds every match, and
//! `LIMIT`/`OFFSET` apply to its single result row: `LIMIT 0` or a non-zero
//! `OFFSET` resolves with `null`.
//!
//! ```
//! use cursordb_storage::{
//!     sql::{Aggregate, SqlStatement},
//!     testutil::seeded_storage,
//! };
//! use serde_json::json;
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let storage = seeded_storage().await;
//! let statement = SqlStatement::select("articles")
//!     .where_("type", "=", "b", None, None)
//!     .unwrap()
//!     .aggregate(Aggregate::parse("max", Some("rating")).unwrap())
//!     .unwrap();
//! assert_eq!(storage.execute_sql(&statement).unwrap().outcome().await.unwrap(), json!(5));
//! # });
//! ```

use std::{cmp::Ordering, fmt, str::FromStr, sync::Arc};

use parking_lot::Mutex;
use serde_json::{Map, Value};

use crate::{
    backend::{CursorCallback, CursorStep},
    deferred::TransactionMode,
    error::{DbError, DbResult},
    key::Key,
    key_range::KeyRange,
    request::{Method, Request},
    schema::get_path,
    storage::Storage,
};

/// Statement verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SqlAction {
    /// `SELECT`
    Select,
    /// `INSERT`
    Insert,
    /// `UPDATE`
    Update,
    /// `DELETE`
    Delete,
}

impl SqlAction {
    /// Upper-case keyword.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Select => "SELECT",
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for SqlAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggregateKind {
    /// `COUNT`
    Count,
    /// `SUM`
    Sum,
    /// `MIN`
    Min,
    /// `MAX`
    Max,
    /// `AVG`
    Avg,
}

impl FromStr for AggregateKind {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "count" => Ok(Self::Count),
            "sum" => Ok(Self::Sum),
            "min" => Ok(Self::Min),
            "max" => Ok(Self::Max),
            "avg" => Ok(Self::Avg),
            _ => Err(DbError::argument(format!("unknown aggregate function '{s}'"))),
        }
    }
}

/// Aggregate applied to the matching records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Aggregate {
    kind: AggregateKind,
    field: Option<String>,
}

impl Aggregate {
    /// Builds an aggregate from a function name and its argument.
    ///
    /// `COUNT` takes an optional field and counts non-null values of it when
    /// given. The other functions require a field.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Argument`] for an unknown function or a missing
    /// field.
    pub fn parse(method: &str, field: Option<&str>) -> DbResult<Self> {
        let kind: AggregateKind = method.parse()?;
        if kind != AggregateKind::Count && field.is_none() {
            return Err(DbError::argument(format!("{} requires a field", method.to_uppercase())));
        }
        Ok(Self { kind, field: field.map(str::to_owned) })
    }

    /// Function.
    #[must_use]
    pub fn kind(&self) -> AggregateKind {
        self.kind
    }

    /// Argument field.
    #[must_use]
    pub fn field(&self) -> Option<&str> {
        self.field.as_deref()
    }
}

/// `WHERE` term: `field` must fall within `range`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlCondition {
    /// Field path.
    pub field: String,
    /// Accepted keys.
    pub range: KeyRange,
}

impl SqlCondition {
    fn matches(&self, record: &Value) -> bool {
        get_path(record, &self.field)
            .and_then(Key::from_json)
            .is_some_and(|key| self.range.contains(&key))
    }
}

/// A parsed statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlStatement {
    action: SqlAction,
    stores: Vec<String>,
    fields: Vec<String>,
    conditions: Vec<SqlCondition>,
    order: Option<(String, bool)>,
    limit: Option<usize>,
    offset: usize,
    aggregate: Option<Aggregate>,
}

impl SqlStatement {
    /// A statement with the given verb over one store.
    pub fn new(action: SqlAction, store: impl Into<String>) -> Self {
        Self {
            action,
            stores: vec![store.into()],
            fields: Vec::new(),
            conditions: Vec::new(),
            order: None,
            limit: None,
            offset: 0,
            aggregate: None,
        }
    }

    /// `SELECT * FROM store`.
    pub fn select(store: impl Into<String>) -> Self {
        Self::new(SqlAction::Select, store)
    }

    /// Adds a store to the `FROM` list.
    #[must_use]
    pub fn join(mut self, store: impl Into<String>) -> Self {
        self.stores.push(store.into());
        self
    }

    /// Selected fields; empty or `["*"]` selects whole records.
    #[must_use]
    pub fn fields(mut self, fields: &[&str]) -> Self {
        self.fields = fields.iter().map(|f| (*f).to_owned()).collect();
        self
    }

    /// Adds a condition with an already resolved range.
    #[must_use]
    pub fn condition(mut self, field: impl Into<String>, range: KeyRange) -> Self {
        self.conditions.push(SqlCondition { field: field.into(), range });
        self
    }

    /// Adds a condition from comparison operators, see [`KeyRange::where_`].
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Argument`] for invalid operators.
    pub fn where_(
        self,
        field: &str,
        op: &str,
        value: impl Into<Key>,
        op2: Option<&str>,
        value2: Option<Key>,
    ) -> DbResult<Self> {
        Ok(self.condition(field, KeyRange::where_(op, value, op2, value2)?))
    }

    /// `ORDER BY field [DESC]`.
    #[must_use]
    pub fn order_by(mut self, field: impl Into<String>, descending: bool) -> Self {
        self.order = Some((field.into(), descending));
        self
    }

    /// `LIMIT n`.
    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// `OFFSET n`.
    #[must_use]
    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// Sets the aggregate function.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Argument`] if one is already set.
    pub fn aggregate(mut self, aggregate: Aggregate) -> DbResult<Self> {
        if self.aggregate.is_some() {
            return Err(DbError::argument("a statement takes at most one aggregate"));
        }
        self.aggregate = Some(aggregate);
        Ok(self)
    }

    /// Verb.
    #[must_use]
    pub fn action(&self) -> SqlAction {
        self.action
    }

    /// `FROM` list.
    #[must_use]
    pub fn stores(&self) -> &[String] {
        &self.stores
    }

    /// `WHERE` terms.
    #[must_use]
    pub fn conditions(&self) -> &[SqlCondition] {
        &self.conditions
    }

    fn selects_all(&self) -> bool {
        self.fields.is_empty() || self.fields.iter().any(|f| f == "*")
    }
}

/// Running state of an aggregate.
#[derive(Debug)]
enum Reducer {
    Count { field: Option<String>, n: u64 },
    Sum { field: String, total: f64 },
    Min { field: String, best: Option<Key> },
    Max { field: String, best: Option<Key> },
    Avg { field: String, mean: f64, n: u64 },
}

impl Reducer {
    fn new(aggregate: &Aggregate) -> Self {
        let field = aggregate.field.clone().unwrap_or_default();
        match aggregate.kind {
            AggregateKind::Count => Self::Count { field: aggregate.field.clone(), n: 0 },
            AggregateKind::Sum => Self::Sum { field, total: 0.0 },
            AggregateKind::Min => Self::Min { field, best: None },
            AggregateKind::Max => Self::Max { field, best: None },
            AggregateKind::Avg => Self::Avg { field, mean: 0.0, n: 0 },
        }
    }

    fn feed(&mut self, record: &Value) -> DbResult<()> {
        match self {
            Self::Count { field: None, n } => *n += 1,
            Self::Count { field: Some(field), n } => {
                if get_path(record, field).is_some_and(|v| !v.is_null()) {
                    *n += 1;
                }
            },
            Self::Sum { field, total } => {
                if let Some(x) = numeric(record, field, "SUM")? {
                    *total += x;
                }
            },
            Self::Avg { field, mean, n } => {
                if let Some(x) = numeric(record, field, "AVG")? {
                    *mean = (*mean * *n as f64 + x) / (*n + 1) as f64;
                    *n += 1;
                }
            },
            Self::Min { field, best } => keep(best, record, field, Ordering::Less),
            Self::Max { field, best } => keep(best, record, field, Ordering::Greater),
        }
        Ok(())
    }

    fn finish(&self) -> Value {
        match self {
            Self::Count { n, .. } => Value::from(*n),
            Self::Sum { total, .. } => Value::from(*total),
            Self::Min { best, .. } | Self::Max { best, .. } => {
                best.as_ref().map_or(Value::Null, Key::to_json)
            },
            Self::Avg { mean, n, .. } => {
                if *n == 0 {
                    Value::Null
                } else {
                    Value::from(*mean)
                }
            },
        }
    }
}

/// Replaces `best` when the record's key at `field` compares as `wanted`.
fn keep(best: &mut Option<Key>, record: &Value, field: &str, wanted: Ordering) {
    let Some(key) = get_path(record, field).and_then(Key::from_json) else {
        return;
    };
    if best.as_ref().is_none_or(|current| key.cmp(current) == wanted) {
        *best = Some(key);
    }
}

fn numeric(record: &Value, field: &str, function: &str) -> DbResult<Option<f64>> {
    match get_path(record, field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => Ok(n.as_f64()),
        Some(other) => Err(DbError::argument(format!(
            "{function}({field}) over non-numeric value {other}"
        ))),
    }
}

/// State shared between the cursor callback and the result transform.
#[derive(Debug)]
struct Scan {
    residual: Vec<SqlCondition>,
    fields: Option<Vec<String>>,
    skip: usize,
    limit: usize,
    started: bool,
    rows: Vec<Value>,
    reducer: Option<Reducer>,
    emit_aggregate: bool,
}

impl Scan {
    fn step(&mut self, record: Option<&Value>) -> DbResult<CursorStep> {
        if !self.started {
            self.started = true;
            // Without residual filters every entry matches, so the cursor
            // can jump over the offset directly.
            if self.residual.is_empty() && self.skip > 0 {
                let n = self.skip;
                self.skip = 0;
                return Ok(CursorStep::Advance(n));
            }
        }
        if self.limit == 0 {
            return Ok(CursorStep::Stop);
        }
        let Some(record) = record else {
            return Ok(CursorStep::Continue);
        };
        if !self.residual.iter().all(|c| c.matches(record)) {
            return Ok(CursorStep::Continue);
        }
        if self.skip > 0 {
            self.skip -= 1;
            return Ok(CursorStep::Continue);
        }

        match &mut self.reducer {
            Some(reducer) => reducer.feed(record)?,
            None => self.rows.push(project(record, self.fields.as_deref())),
        }
        self.limit -= 1;
        Ok(if self.limit == 0 { CursorStep::Stop } else { CursorStep::Continue })
    }

    fn finish(&mut self) -> Value {
        match &self.reducer {
            Some(reducer) if self.emit_aggregate => reducer.finish(),
            Some(_) => Value::Null,
            None => Value::Array(std::mem::take(&mut self.rows)),
        }
    }
}

fn project(record: &Value, fields: Option<&[String]>) -> Value {
    let Some(fields) = fields else {
        return record.clone();
    };
    let mut row = Map::new();
    for field in fields {
        if let Some(value) = get_path(record, field) {
            row.insert(field.clone(), value.clone());
        }
    }
    Value::Object(row)
}

/// Executes `statement` against `storage`.
pub(crate) fn execute(storage: &Storage, statement: &SqlStatement) -> DbResult<Request> {
    if statement.action != SqlAction::Select {
        return Err(DbError::not_supported(format!("{} statements", statement.action)));
    }
    let store = match statement.stores.as_slice() {
        [store] => store,
        [] => return Err(DbError::argument("statement has no FROM store")),
        _ => return Err(DbError::not_supported("joins across several stores")),
    };
    let schema = storage.store_schema(store)?;
    let mut query = storage.from(store)?;

    // Conditions on the first indexed field drive the scan; the rest are
    // checked per record.
    let mut scanned: Option<&str> = None;
    let mut residual = Vec::new();
    for condition in &statement.conditions {
        let field = condition.field.as_str();
        let indexed = schema.is_primary_key(field)
            || schema.index(field).is_some()
            || schema.index_by_key_path(&[field]).is_some();
        match scanned {
            Some(field) if field == condition.field => {
                query = query.where_range(&condition.field, condition.range.clone())?;
            },
            None if indexed => {
                query = query.where_range(&condition.field, condition.range.clone())?;
                scanned = Some(&condition.field);
            },
            _ => residual.push(condition.clone()),
        }
    }

    if let Some((field, descending)) = &statement.order {
        query = query.order(&[field.as_str()])?;
        if *descending {
            query = query.reverse()?;
        }
    }

    let limit = statement.limit.unwrap_or(usize::MAX);
    if residual.is_empty() && statement.aggregate.is_none() && statement.selects_all() {
        return Ok(query.list_into(storage.request(Method::Sql), limit, statement.offset));
    }

    let reducer = statement.aggregate.as_ref().map(Reducer::new);
    // The aggregate sees every match; LIMIT and OFFSET select from its one row.
    let (skip, limit) = match reducer {
        Some(_) => (0, usize::MAX),
        None => (statement.offset, limit),
    };
    let scan = Arc::new(Mutex::new(Scan {
        residual,
        fields: (!statement.selects_all()).then(|| statement.fields.clone()),
        skip,
        limit,
        started: false,
        rows: Vec::new(),
        reducer,
        emit_aggregate: statement.offset == 0 && statement.limit != Some(0),
    }));

    let method = if statement.aggregate.is_some() { Method::Reduce } else { Method::Sql };
    let req = storage.request(method);
    let result = Arc::clone(&scan);
    let _ = req.map(move |_visited| Ok(result.lock().finish()));

    let callback: CursorCallback = Box::new(move |entry| scan.lock().step(entry.value()));
    let iter = query
        .single_iterator()
        .ok_or_else(|| DbError::internal("statement compiled to a conjunctive query"))?
        .as_value_iterator();
    Ok(storage.submit_open(req, iter, TransactionMode::ReadOnly, callback))
}
