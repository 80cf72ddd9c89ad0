//! The transactional request.
//!
//! A [`Request`] represents one in-flight or completed database operation.
//! It is created by the [`Storage`](crate::Storage) façade, bound to a
//! back-end transaction when the engine schedules the operation, and
//! resolved exactly once when the back-end calls
//! [`set_db_value`](Deferred::set_db_value).
//!
//! # State machine
//!
//! ```text
//! Pending ──set_db_value──► Resolving ──(transforms drained)──► Resolved
//!    │                          ▲
//!    └──set_tx (any time)───────┘
//! ```
//!
//! Transforms registered with [`await_with`](Deferred::await_with) run
//! strictly in registration order. Each one fully completes, by resuming its
//! [`Continuation`], before the next is invoked.
//!
//! # Unhandled rejections
//!
//! A rejection nothing observes (no [`outcome`](Request::outcome) call, no
//! errback) is reported to the process-wide hook installed with
//! [`set_unhandled_rejection_hook`] after one scheduler yield. Without a hook
//! it is logged at ERROR level.
//!
//! # Progress
//!
//! Operations that run in several stages report intermediate results with
//! [`notify`](Deferred::notify). Listeners added with
//! [`add_progback`](Deferred::add_progback) see every report made before the
//! request resolves and none after.

use std::{collections::VecDeque, fmt, mem, sync::Arc, time::Instant};

use parking_lot::{Mutex, RwLock, const_rwlock};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, error, trace, warn};

use crate::{
    deferred::{Continuation, Deferred, Transactional, TxHandle},
    error::{DbError, DbResult},
    metrics::Metrics,
};

/// Operation tag of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// Single record lookup.
    Get,
    /// Record insert or overwrite.
    Put,
    /// Record deletion by key range.
    Remove,
    /// Store or index range deletion.
    Clear,
    /// Range count.
    Count,
    /// Primary key listing by store and range.
    Keys,
    /// Value listing by store and range.
    Values,
    /// Key listing driven by an iterator.
    KeysIter,
    /// Value listing driven by an iterator.
    ValuesIter,
    /// Live cursor.
    Open,
    /// Per-entry callback scan.
    Map,
    /// Aggregating scan.
    Reduce,
    /// Compiled SQL statement.
    Sql,
}

/// Coarse grouping of [`Method`]s used for metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MethodFamily {
    /// Reads.
    Read,
    /// Writes.
    Write,
    /// Cursor scans.
    Cursor,
    /// SQL statements.
    Sql,
}

impl Method {
    /// Lowercase name used in labels and log fields.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "get",
            Self::Put => "put",
            Self::Remove => "remove",
            Self::Clear => "clear",
            Self::Count => "count",
            Self::Keys => "keys",
            Self::Values => "values",
            Self::KeysIter => "keys_iter",
            Self::ValuesIter => "values_iter",
            Self::Open => "open",
            Self::Map => "map",
            Self::Reduce => "reduce",
            Self::Sql => "sql",
        }
    }

    /// Metrics family.
    #[must_use]
    pub fn family(self) -> MethodFamily {
        match self {
            Self::Get
            | Self::Count
            | Self::Keys
            | Self::Values
            | Self::KeysIter
            | Self::ValuesIter => MethodFamily::Read,
            Self::Put | Self::Remove | Self::Clear => MethodFamily::Write,
            Self::Open | Self::Map | Self::Reduce => MethodFamily::Cursor,
            Self::Sql => MethodFamily::Sql,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolution state of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// No outcome delivered yet.
    Pending,
    /// An outcome was delivered and transforms are running.
    Resolving,
    /// The final outcome is known.
    Resolved,
}

/// A rejection that no observer saw.
#[derive(Debug)]
pub struct UnhandledRejection<'a> {
    /// Method of the rejected request.
    pub method: Method,
    /// Label of the rejected request.
    pub label: &'a str,
    /// The rejection.
    pub error: &'a DbError,
}

/// Process-wide reporter for unobserved rejections.
pub type UnhandledRejectionHook = Arc<dyn Fn(&UnhandledRejection<'_>) + Send + Sync>;

static UNHANDLED_REJECTION_HOOK: RwLock<Option<UnhandledRejectionHook>> = const_rwlock(None);

/// Installs (or with `None`, removes) the unhandled rejection reporter and
/// returns the previous one.
pub fn set_unhandled_rejection_hook(
    hook: Option<UnhandledRejectionHook>,
) -> Option<UnhandledRejectionHook> {
    mem::replace(&mut *UNHANDLED_REJECTION_HOOK.write(), hook)
}

type Transform = Box<dyn FnOnce(DbResult<Value>, Continuation) + Send>;
type TxCallback = Box<dyn FnOnce(&Arc<dyn TxHandle>) + Send>;
type Progback = Box<dyn FnMut(&Value) + Send>;

enum Listener {
    Success(Box<dyn FnOnce(&Value) + Send>),
    Failure(Box<dyn FnOnce(&DbError) + Send>),
}

struct Inner {
    method: Method,
    label: String,
    tx: Option<Arc<dyn TxHandle>>,
    txbacks: Vec<TxCallback>,
    transforms: VecDeque<Transform>,
    listeners: Vec<Listener>,
    progbacks: Vec<Progback>,
    state: RequestState,
    observed: bool,
    copies: u32,
    report_unhandled: bool,
    metrics: Option<Metrics>,
    issued_at: Instant,
}

struct Shared {
    inner: Mutex<Inner>,
    outcome: watch::Sender<Option<DbResult<Value>>>,
}

/// Handle to a database operation.
///
/// Cloning the handle shares the same request. Use [`Request::copy`] to
/// derive a sibling request on the same transaction.
#[derive(Clone)]
pub struct Request {
    shared: Arc<Shared>,
}

impl Request {
    /// Creates a pending, unattached request.
    pub fn new(method: Method, label: impl Into<String>) -> Self {
        let (outcome, _) = watch::channel(None);
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    method,
                    label: label.into(),
                    tx: None,
                    txbacks: Vec::new(),
                    transforms: VecDeque::new(),
                    listeners: Vec::new(),
                    progbacks: Vec::new(),
                    state: RequestState::Pending,
                    observed: false,
                    copies: 0,
                    report_unhandled: true,
                    metrics: None,
                    issued_at: Instant::now(),
                }),
                outcome,
            }),
        }
    }

    /// Enables or disables unhandled rejection reporting for this request.
    #[must_use]
    pub fn report_unhandled(self, report: bool) -> Self {
        self.shared.inner.lock().report_unhandled = report;
        self
    }

    pub(crate) fn with_metrics(self, metrics: Metrics) -> Self {
        {
            let mut inner = self.shared.inner.lock();
            metrics.record_issued(inner.method);
            inner.metrics = Some(metrics);
        }
        self
    }

    /// Operation tag.
    #[must_use]
    pub fn method(&self) -> Method {
        self.shared.inner.lock().method
    }

    /// Diagnostic label.
    #[must_use]
    pub fn label(&self) -> String {
        self.shared.inner.lock().label.clone()
    }

    /// Current resolution state.
    #[must_use]
    pub fn state(&self) -> RequestState {
        self.shared.inner.lock().state
    }

    /// Creates a sibling request of the same method on the same transaction,
    /// labelled `<label>C<n>` where `n` counts the copies made so far.
    #[must_use]
    pub fn copy(&self) -> Request {
        let (method, label, tx, metrics, report) = {
            let mut inner = self.shared.inner.lock();
            inner.copies += 1;
            (
                inner.method,
                format!("{}C{}", inner.label, inner.copies),
                inner.tx.clone(),
                inner.metrics.clone(),
                inner.report_unhandled,
            )
        };
        let copy = Request::new(method, label);
        {
            let mut inner = copy.shared.inner.lock();
            inner.tx = tx;
            inner.metrics = metrics;
            inner.report_unhandled = report;
        }
        copy
    }

    /// Appends a transform that maps a successful value and passes failures
    /// through untouched.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::InvalidState`] once the request has resolved.
    pub fn map<F>(&self, f: F) -> DbResult<()>
    where
        F: FnOnce(Value) -> DbResult<Value> + Send + 'static,
    {
        self.await_with(move |outcome, next| next.resume(outcome.and_then(f)))
    }

    /// Waits for the final outcome.
    ///
    /// Calling this marks the request as observed, so its rejection is not
    /// reported as unhandled.
    ///
    /// # Errors
    ///
    /// Returns the request's rejection.
    pub async fn outcome(&self) -> DbResult<Value> {
        let mut rx = {
            self.shared.inner.lock().observed = true;
            self.shared.outcome.subscribe()
        };
        let settled: Option<DbResult<Value>> = {
            let guard = rx
                .wait_for(Option::is_some)
                .await
                .map_err(|_| DbError::internal("request dropped before resolving"))?;
            (*guard).clone()
        };
        settled.unwrap_or_else(|| Err(DbError::internal("request resolved without an outcome")))
    }

    /// Returns the final outcome if already known. Marks the request observed.
    #[must_use]
    pub fn peek(&self) -> Option<DbResult<Value>> {
        self.shared.inner.lock().observed = true;
        self.shared.outcome.borrow().clone()
    }

    pub(crate) fn drain(&self, outcome: DbResult<Value>) {
        let next = self.shared.inner.lock().transforms.pop_front();
        match next {
            Some(transform) => transform(outcome, Continuation::new(self.clone())),
            None => self.finish(outcome),
        }
    }

    fn finish(&self, outcome: DbResult<Value>) {
        let (listeners, observed, report, metrics, elapsed) = {
            let mut inner = self.shared.inner.lock();
            inner.state = RequestState::Resolved;
            inner.progbacks.clear();
            (
                mem::take(&mut inner.listeners),
                inner.observed,
                inner.report_unhandled,
                inner.metrics.clone(),
                inner.issued_at.elapsed(),
            )
        };

        if let Some(metrics) = &metrics {
            match &outcome {
                Ok(_) => metrics.record_resolved(elapsed),
                Err(_) => metrics.record_rejected(elapsed),
            }
        }
        trace!(label = %self.label(), ok = outcome.is_ok(), "Request resolved");

        let mut errback_ran = false;
        for listener in listeners {
            match (listener, &outcome) {
                (Listener::Success(callback), Ok(value)) => callback(value),
                (Listener::Failure(errback), Err(err)) => {
                    errback_ran = true;
                    errback(err);
                },
                _ => {},
            }
        }

        let rejection = outcome.as_ref().err().cloned();
        self.shared.outcome.send_replace(Some(outcome));

        if let Some(err) = rejection {
            if report && !observed && !errback_ran {
                self.schedule_unhandled_check(err);
            }
        }
    }

    fn schedule_unhandled_check(&self, err: DbError) {
        let request = self.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    tokio::task::yield_now().await;
                    request.report_if_unobserved(&err);
                });
            },
            Err(_) => request.report_if_unobserved(&err),
        }
    }

    fn report_if_unobserved(&self, err: &DbError) {
        let (observed, method, label, metrics) = {
            let inner = self.shared.inner.lock();
            (inner.observed, inner.method, inner.label.clone(), inner.metrics.clone())
        };
        if observed {
            return;
        }
        if let Some(metrics) = metrics {
            metrics.record_unhandled_rejection();
        }
        let hook = UNHANDLED_REJECTION_HOOK.read().clone();
        let report = UnhandledRejection { method, label: &label, error: err };
        match hook {
            Some(hook) => hook(&report),
            None => {
                error!(
                    method = %method,
                    label = %label,
                    error = %err,
                    "Unhandled request rejection"
                );
            },
        }
    }
}

impl Deferred for Request {
    fn await_with<F>(&self, transform: F) -> DbResult<()>
    where
        F: FnOnce(DbResult<Value>, Continuation) + Send + 'static,
    {
        let mut inner = self.shared.inner.lock();
        if inner.state == RequestState::Resolved {
            return Err(DbError::invalid_state(format!(
                "cannot add a transform to resolved request {}",
                inner.label
            )));
        }
        inner.transforms.push_back(Box::new(transform));
        Ok(())
    }

    fn set_db_value(&self, outcome: DbResult<Value>) -> DbResult<()> {
        {
            let mut inner = self.shared.inner.lock();
            if inner.state != RequestState::Pending {
                warn!(label = %inner.label, state = ?inner.state, "Ignoring repeated resolution");
                return Err(DbError::invalid_state(format!(
                    "request {} already received its outcome",
                    inner.label
                )));
            }
            inner.state = RequestState::Resolving;
            debug!(
                label = %inner.label,
                ok = outcome.is_ok(),
                transforms = inner.transforms.len(),
                "Request resolving"
            );
        }
        self.drain(outcome);
        Ok(())
    }

    fn has_fired(&self) -> bool {
        self.state() == RequestState::Resolved
    }

    fn add_callback<F>(&self, callback: F)
    where
        F: FnOnce(&Value) + Send + 'static,
    {
        {
            let mut inner = self.shared.inner.lock();
            if inner.state != RequestState::Resolved {
                inner.listeners.push(Listener::Success(Box::new(callback)));
                return;
            }
        }
        let settled = self.shared.outcome.borrow().clone();
        if let Some(Ok(value)) = settled {
            callback(&value);
        }
    }

    fn add_errback<F>(&self, errback: F)
    where
        F: FnOnce(&DbError) + Send + 'static,
    {
        {
            let mut inner = self.shared.inner.lock();
            inner.observed = true;
            if inner.state != RequestState::Resolved {
                inner.listeners.push(Listener::Failure(Box::new(errback)));
                return;
            }
        }
        let settled = self.shared.outcome.borrow().clone();
        if let Some(Err(err)) = settled {
            errback(&err);
        }
    }

    fn notify(&self, progress: &Value) -> DbResult<()> {
        let mut progbacks = {
            let mut inner = self.shared.inner.lock();
            if inner.state == RequestState::Resolved {
                return Err(DbError::invalid_state(format!(
                    "cannot report progress on resolved request {}",
                    inner.label
                )));
            }
            mem::take(&mut inner.progbacks)
        };
        for progback in &mut progbacks {
            progback(progress);
        }
        let mut inner = self.shared.inner.lock();
        if inner.state != RequestState::Resolved {
            // Listeners registered while these ran go after them.
            let added = mem::replace(&mut inner.progbacks, progbacks);
            inner.progbacks.extend(added);
        }
        Ok(())
    }

    fn add_progback<F>(&self, progback: F)
    where
        F: FnMut(&Value) + Send + 'static,
    {
        let mut inner = self.shared.inner.lock();
        if inner.state != RequestState::Resolved {
            inner.progbacks.push(Box::new(progback));
        }
    }
}

impl Transactional for Request {
    fn set_tx(&self, tx: Arc<dyn TxHandle>, label: &str) -> DbResult<()> {
        let txbacks = {
            let mut inner = self.shared.inner.lock();
            if let Some(current) = &inner.tx {
                return Err(DbError::invalid_state(format!(
                    "request {} is already bound to transaction {}",
                    inner.label,
                    current.label()
                )));
            }
            inner.tx = Some(Arc::clone(&tx));
            if !label.is_empty() {
                label.clone_into(&mut inner.label);
            }
            debug!(
                label = %inner.label,
                tx = %tx.label(),
                mode = ?tx.mode(),
                "Transaction attached"
            );
            mem::take(&mut inner.txbacks)
        };
        for txback in txbacks {
            txback(&tx);
        }
        Ok(())
    }

    fn add_txback<F>(&self, callback: F)
    where
        F: FnOnce(&Arc<dyn TxHandle>) + Send + 'static,
    {
        let tx = {
            let mut inner = self.shared.inner.lock();
            match &inner.tx {
                Some(tx) => Arc::clone(tx),
                None => {
                    inner.txbacks.push(Box::new(callback));
                    return;
                },
            }
        };
        callback(&tx);
    }

    fn tx(&self) -> Option<Arc<dyn TxHandle>> {
        self.shared.inner.lock().tx.clone()
    }

    fn remove_tx(&self) {
        let mut inner = self.shared.inner.lock();
        if inner.tx.take().is_some() {
            trace!(label = %inner.label, "Transaction detached");
        }
    }

    fn abort(&self) -> DbResult<()> {
        let (tx, label, metrics) = {
            let inner = self.shared.inner.lock();
            (inner.tx.clone(), inner.label.clone(), inner.metrics.clone())
        };
        let Some(tx) = tx else {
            return Err(DbError::invalid_state(format!(
                "cannot abort request {label}: no transaction attached"
            )));
        };

        let aborted = match tx.abort() {
            Err(err) if err.is_not_supported() => {
                // Statement engines roll back when a statement fails, so a
                // deliberately invalid statement stands in for abort. This is
                // best effort: it is up to the engine whether statements
                // already queued in the transaction are discarded too.
                match tx.execute_statement("ABORT") {
                    Some(Err(_)) => Ok(()),
                    Some(Ok(())) => Err(DbError::internal(format!(
                        "ABORT statement unexpectedly succeeded on transaction {}",
                        tx.label()
                    ))),
                    None => Err(DbError::not_supported(format!(
                        "transaction {} supports neither abort nor statements",
                        tx.label()
                    ))),
                }
            },
            other => other,
        };

        if aborted.is_ok() {
            debug!(label = %label, tx = %tx.label(), "Transaction aborted");
            if let Some(metrics) = metrics {
                metrics.record_aborted();
            }
        }
        aborted
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.shared.inner.lock();
        f.debug_struct("Request")
            .field("method", &inner.method)
            .field("label", &inner.label)
            .field("state", &inner.state)
            .field("tx", &inner.tx.as_ref().map(|tx| tx.label().to_owned()))
            .field("transforms", &inner.transforms.len())
            .field("progbacks", &inner.progbacks.len())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;
    use crate::deferred::TransactionMode;

    #[derive(Debug)]
    struct NativeTx {
        label: String,
        aborted: AtomicBool,
    }

    impl NativeTx {
        fn new(label: &str) -> Arc<Self> {
            Arc::new(Self { label: label.to_owned(), aborted: AtomicBool::new(false) })
        }
    }

    impl TxHandle for NativeTx {
        fn label(&self) -> &str {
            &self.label
        }

        fn mode(&self) -> TransactionMode {
            TransactionMode::ReadWrite
        }

        fn is_active(&self) -> bool {
            !self.aborted.load(Ordering::SeqCst)
        }

        fn abort(&self) -> DbResult<()> {
            self.aborted.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Statement engine whose `ABORT` statement behaves as configured.
    #[derive(Debug)]
    struct StatementTx {
        abort_statement_fails: bool,
        statements: Mutex<Vec<String>>,
    }

    impl TxHandle for StatementTx {
        fn label(&self) -> &str {
            "sql-tx"
        }

        fn mode(&self) -> TransactionMode {
            TransactionMode::ReadWrite
        }

        fn is_active(&self) -> bool {
            true
        }

        fn execute_statement(&self, statement: &str) -> Option<DbResult<()>> {
            self.statements.lock().push(statement.to_owned());
            if self.abort_statement_fails {
                Some(Err(DbError::internal("syntax error near ABORT")))
            } else {
                Some(Ok(()))
            }
        }
    }

    #[derive(Debug)]
    struct BareTx;

    impl TxHandle for BareTx {
        fn label(&self) -> &str {
            "bare"
        }

        fn mode(&self) -> TransactionMode {
            TransactionMode::ReadOnly
        }

        fn is_active(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn resolution_is_single_fire() {
        let req = Request::new(Method::Get, "get");
        req.set_db_value(Ok(json!(1))).unwrap();
        let err = req.set_db_value(Ok(json!(2))).unwrap_err();
        assert!(err.is_invalid_state());
        assert_eq!(req.outcome().await.unwrap(), json!(1));
        assert!(req.has_fired());
    }

    #[tokio::test]
    async fn second_resolution_is_rejected_while_transforms_run() {
        let req = Request::new(Method::Get, "get");
        let parked = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&parked);
        req.await_with(move |outcome, next| *slot.lock() = Some((outcome, next))).unwrap();

        req.set_db_value(Ok(json!("first"))).unwrap();
        assert_eq!(req.state(), RequestState::Resolving);
        assert!(req.set_db_value(Ok(json!("second"))).unwrap_err().is_invalid_state());

        let (outcome, next) = parked.lock().take().unwrap();
        next.resume(outcome);
        assert_eq!(req.outcome().await.unwrap(), json!("first"));
    }

    #[tokio::test]
    async fn transforms_run_in_registration_order() {
        let req = Request::new(Method::Values, "values");
        let seen = Arc::new(Mutex::new(Vec::new()));

        let log = Arc::clone(&seen);
        req.await_with(move |outcome, next| {
            let v = outcome.unwrap();
            log.lock().push(format!("t1:{v}"));
            next.succeed(json!(v.as_i64().unwrap() + 1));
        })
        .unwrap();

        let log = Arc::clone(&seen);
        req.await_with(move |outcome, next| {
            let v = outcome.unwrap();
            log.lock().push(format!("t2:{v}"));
            // Resume from another task to make the pipeline asynchronous.
            tokio::spawn(async move { next.succeed(json!(v.as_i64().unwrap() * 10)) });
        })
        .unwrap();

        let log = Arc::clone(&seen);
        req.await_with(move |outcome, next| {
            let v = outcome.unwrap();
            log.lock().push(format!("t3:{v}"));
            next.succeed(v);
        })
        .unwrap();

        req.set_db_value(Ok(json!(1))).unwrap();
        assert_eq!(req.outcome().await.unwrap(), json!(20));
        assert_eq!(*seen.lock(), vec!["t1:1", "t2:2", "t3:20"]);
    }

    #[tokio::test]
    async fn transform_can_recover_a_failure() {
        let req = Request::new(Method::Get, "get");
        req.await_with(|outcome, next| match outcome {
            Err(_) => next.succeed(Value::Null),
            ok => next.resume(ok),
        })
        .unwrap();
        req.set_db_value(Err(DbError::not_found("record 7"))).unwrap();
        assert_eq!(req.outcome().await.unwrap(), Value::Null);
    }

    #[tokio::test]
    async fn failure_passes_through_map_unchanged() {
        let req = Request::new(Method::Count, "count");
        req.map(|_| panic!("map must not run on failure")).unwrap();
        req.set_db_value(Err(DbError::constraint("dup"))).unwrap();
        assert!(matches!(req.outcome().await, Err(DbError::Constraint { .. })));
    }

    #[tokio::test]
    async fn await_after_resolution_is_rejected() {
        let req = Request::new(Method::Get, "get");
        req.set_db_value(Ok(Value::Null)).unwrap();
        let err = req.await_with(|o, next| next.resume(o)).unwrap_err();
        assert!(err.is_invalid_state());
    }

    #[tokio::test]
    async fn dropped_continuation_rejects() {
        let req = Request::new(Method::Get, "get");
        req.await_with(|_, next| drop(next)).unwrap();
        req.set_db_value(Ok(json!(1))).unwrap();
        assert!(matches!(req.outcome().await, Err(DbError::Internal { .. })));
    }

    #[test]
    fn txbacks_queue_until_attached() {
        let req = Request::new(Method::Put, "put");
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&calls);
        req.add_txback(move |tx| {
            assert_eq!(tx.label(), "tx-1");
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        req.set_tx(NativeTx::new("tx-1"), "tx-1").unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Already attached: runs synchronously.
        let counter = Arc::clone(&calls);
        req.add_txback(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(req.label(), "tx-1");
    }

    #[test]
    fn set_tx_twice_is_invalid_state() {
        let req = Request::new(Method::Put, "put");
        req.set_tx(NativeTx::new("a"), "a").unwrap();
        assert!(req.set_tx(NativeTx::new("b"), "b").unwrap_err().is_invalid_state());
    }

    #[test]
    fn abort_requires_attachment() {
        let req = Request::new(Method::Put, "put");
        assert!(req.abort().unwrap_err().is_invalid_state());

        let tx = NativeTx::new("tx");
        req.set_tx(tx.clone(), "tx").unwrap();
        req.remove_tx();
        assert!(req.abort().unwrap_err().is_invalid_state());
        assert!(tx.is_active());
    }

    #[test]
    fn abort_uses_native_primitive() {
        let req = Request::new(Method::Put, "put");
        let tx = NativeTx::new("tx");
        req.set_tx(tx.clone(), "tx").unwrap();
        req.abort().unwrap();
        assert!(!tx.is_active());
    }

    #[test]
    fn abort_falls_back_to_failing_statement() {
        let tx =
            Arc::new(StatementTx { abort_statement_fails: true, statements: Mutex::new(vec![]) });
        let req = Request::new(Method::Put, "put");
        req.set_tx(tx.clone(), "").unwrap();
        req.abort().unwrap();
        assert_eq!(*tx.statements.lock(), vec!["ABORT".to_owned()]);
    }

    #[test]
    fn abort_statement_that_succeeds_is_an_error() {
        let tx =
            Arc::new(StatementTx { abort_statement_fails: false, statements: Mutex::new(vec![]) });
        let req = Request::new(Method::Put, "put");
        req.set_tx(tx, "").unwrap();
        assert!(matches!(req.abort(), Err(DbError::Internal { .. })));
    }

    #[test]
    fn abort_without_any_primitive_is_not_supported() {
        let req = Request::new(Method::Get, "get");
        req.set_tx(Arc::new(BareTx), "").unwrap();
        assert!(req.abort().unwrap_err().is_not_supported());
    }

    #[test]
    fn copy_shares_transaction_with_numbered_label() {
        let req = Request::new(Method::Open, "cursor");
        let tx = NativeTx::new("tx-9");
        req.set_tx(tx, "tx-9").unwrap();

        let first = req.copy();
        let second = req.copy();
        assert_eq!(first.label(), "tx-9C1");
        assert_eq!(second.label(), "tx-9C2");
        assert_eq!(first.method(), Method::Open);
        assert_eq!(second.tx().unwrap().label(), "tx-9");
        assert_eq!(first.state(), RequestState::Pending);
    }

    #[tokio::test]
    async fn progress_reaches_listeners_in_order_until_resolved() {
        let req = Request::new(Method::Open, "scan");
        let seen = Arc::new(Mutex::new(Vec::new()));

        let log = Arc::clone(&seen);
        req.add_progback(move |p| log.lock().push(format!("a:{p}")));
        let log = Arc::clone(&seen);
        req.add_progback(move |p| log.lock().push(format!("b:{p}")));

        req.notify(&json!(1)).unwrap();
        req.notify(&json!(2)).unwrap();
        req.set_db_value(Ok(json!("done"))).unwrap();

        assert!(req.notify(&json!(3)).unwrap_err().is_invalid_state());
        let log = Arc::clone(&seen);
        req.add_progback(move |p| log.lock().push(format!("late:{p}")));
        assert_eq!(*seen.lock(), vec!["a:1", "b:1", "a:2", "b:2"]);
        assert_eq!(req.outcome().await.unwrap(), json!("done"));
    }

    #[test]
    fn progback_registered_during_notify_runs_next_time() {
        let req = Request::new(Method::Open, "scan");
        let hits = Arc::new(AtomicUsize::new(0));
        let handle = req.clone();
        let counter = Arc::clone(&hits);
        let mut registered = false;
        req.add_progback(move |_| {
            if !registered {
                registered = true;
                let counter = Arc::clone(&counter);
                handle.add_progback(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                });
            }
        });
        req.notify(&Value::Null).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        req.notify(&Value::Null).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn callbacks_fire_on_matching_outcome() {
        let req = Request::new(Method::Get, "get");
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        req.add_callback(move |v| {
            assert_eq!(v, &json!("x"));
            counter.fetch_add(1, Ordering::SeqCst);
        });
        req.add_errback(|_| panic!("errback must not run on success"));
        req.set_db_value(Ok(json!("x"))).unwrap();

        let counter = Arc::clone(&hits);
        req.add_callback(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unobserved_rejection_reaches_hook() {
        static REPORTED: Mutex<Vec<String>> = parking_lot::const_mutex(Vec::new());
        set_unhandled_rejection_hook(Some(Arc::new(|r: &UnhandledRejection<'_>| {
            REPORTED.lock().push(r.label.to_owned());
        })));

        let unobserved = Request::new(Method::Get, "unobserved-get");
        unobserved.set_db_value(Err(DbError::not_found("x"))).unwrap();

        let observed = Request::new(Method::Get, "observed-get");
        observed.add_errback(|_| {});
        observed.set_db_value(Err(DbError::not_found("x"))).unwrap();

        let silenced = Request::new(Method::Get, "silenced-get").report_unhandled(false);
        silenced.set_db_value(Err(DbError::not_found("x"))).unwrap();

        for _ in 0..4 {
            tokio::task::yield_now().await;
        }

        let reported = REPORTED.lock().clone();
        assert!(reported.contains(&"unobserved-get".to_owned()));
        assert!(!reported.contains(&"observed-get".to_owned()));
        assert!(!reported.contains(&"silenced-get".to_owned()));
    }

    #[tokio::test]
    async fn metrics_track_settlement() {
        let metrics = Metrics::new();
        let ok = Request::new(Method::Get, "get").with_metrics(metrics.clone());
        let failed = Request::new(Method::Put, "put").with_metrics(metrics.clone());
        ok.set_db_value(Ok(Value::Null)).unwrap();
        failed.add_errback(|_| {});
        failed.set_db_value(Err(DbError::aborted("tx"))).unwrap();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.read_count, 1);
        assert_eq!(snapshot.write_count, 1);
        assert_eq!(snapshot.resolved_count, 1);
        assert_eq!(snapshot.rejected_count, 1);
    }
}
