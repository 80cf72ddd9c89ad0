//! Capabilities composed into [`Request`](crate::Request).
//!
//! [`Deferred`] is the single-resolution result with an ordered transform
//! pipeline and a progress channel. [`Transactional`] is the ability to be bound to, and abort, a
//! back-end transaction. [`TxHandle`] is what a back-end hands to a request
//! when it schedules the operation.

use std::{fmt, sync::Arc};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{DbError, DbResult};

/// Transaction access mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionMode {
    /// Reads only.
    ReadOnly,
    /// Reads and writes.
    ReadWrite,
}

/// A back-end transaction as seen by a request.
///
/// Requests hold an `Arc<dyn TxHandle>` but do not own the transaction's
/// lifetime; the back-end commits or rolls it back independently.
pub trait TxHandle: Send + Sync + fmt::Debug {
    /// Diagnostic label of the transaction.
    fn label(&self) -> &str;

    /// Access mode.
    fn mode(&self) -> TransactionMode;

    /// Returns `false` once the transaction has committed or aborted.
    fn is_active(&self) -> bool;

    /// Native abort.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::NotSupported`] when the engine has no native abort
    /// primitive. That is the default.
    fn abort(&self) -> DbResult<()> {
        Err(DbError::not_supported(format!("transaction {} has no native abort", self.label())))
    }

    /// Executes a raw statement inside the transaction.
    ///
    /// Returns `None` when the engine is not statement based. Statement based
    /// engines use this to simulate an abort by issuing a statement that is
    /// guaranteed to fail, which makes the engine roll the transaction back.
    fn execute_statement(&self, _statement: &str) -> Option<DbResult<()>> {
        None
    }
}

/// A single-resolution result with an ordered transform pipeline.
pub trait Deferred {
    /// Appends a transform to the pipeline.
    ///
    /// The transform receives the current outcome and a [`Continuation`] it
    /// must resume, synchronously or later, with the next outcome. A
    /// transform may turn a failure into a success or the reverse.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::InvalidState`] once the request has resolved.
    fn await_with<F>(&self, transform: F) -> DbResult<()>
    where
        F: FnOnce(DbResult<Value>, Continuation) + Send + 'static;

    /// Delivers the raw outcome from the back-end and starts draining the
    /// transform pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::InvalidState`] if an outcome was already delivered.
    fn set_db_value(&self, outcome: DbResult<Value>) -> DbResult<()>;

    /// Returns `true` once the final outcome is known.
    fn has_fired(&self) -> bool;

    /// Registers a listener for a successful final outcome. Runs immediately
    /// if the request already resolved with a value.
    fn add_callback<F>(&self, callback: F)
    where
        F: FnOnce(&Value) + Send + 'static;

    /// Registers a listener for a failed final outcome. Runs immediately if
    /// the request already failed. Registering an errback counts as observing
    /// the rejection.
    fn add_errback<F>(&self, errback: F)
    where
        F: FnOnce(&DbError) + Send + 'static;

    /// Reports intermediate progress to the progress listeners, in
    /// registration order.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::InvalidState`] once the request has resolved.
    fn notify(&self, progress: &Value) -> DbResult<()>;

    /// Registers a listener for progress reports. It runs for every
    /// [`notify`](Self::notify) until the request resolves and is dropped
    /// afterwards.
    fn add_progback<F>(&self, progback: F)
    where
        F: FnMut(&Value) + Send + 'static;
}

/// Ability to be bound to a back-end transaction.
pub trait Transactional {
    /// Attaches the transaction that will execute this request and runs the
    /// queued txbacks.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::InvalidState`] if a transaction is already attached.
    fn set_tx(&self, tx: Arc<dyn TxHandle>, label: &str) -> DbResult<()>;

    /// Runs `callback` with the transaction once one is attached, or right
    /// away if it already is.
    fn add_txback<F>(&self, callback: F)
    where
        F: FnOnce(&Arc<dyn TxHandle>) + Send + 'static;

    /// Currently attached transaction.
    fn tx(&self) -> Option<Arc<dyn TxHandle>>;

    /// Detaches the transaction once it is no longer active.
    fn remove_tx(&self);

    /// Aborts the whole enclosing transaction.
    ///
    /// # Errors
    ///
    /// - [`DbError::InvalidState`] if no transaction is attached.
    /// - [`DbError::NotSupported`] if the engine can neither abort natively nor
    ///   execute statements.
    fn abort(&self) -> DbResult<()>;
}

/// Handle a transform uses to pass the next outcome down the pipeline.
///
/// Dropping a continuation without resuming it rejects the request, so a
/// transform that forgets to forward cannot leave the request pending.
pub struct Continuation {
    request: Option<crate::request::Request>,
}

impl Continuation {
    pub(crate) fn new(request: crate::request::Request) -> Self {
        Self { request: Some(request) }
    }

    /// Passes `outcome` to the next transform, or resolves the request when
    /// the pipeline is empty.
    pub fn resume(mut self, outcome: DbResult<Value>) {
        if let Some(request) = self.request.take() {
            request.drain(outcome);
        }
    }

    /// Shorthand for `resume(Ok(value))`.
    pub fn succeed(self, value: Value) {
        self.resume(Ok(value));
    }

    /// Shorthand for `resume(Err(err))`.
    pub fn fail(self, err: DbError) {
        self.resume(Err(err));
    }
}

impl Drop for Continuation {
    fn drop(&mut self) {
        if let Some(request) = self.request.take() {
            tracing::warn!(label = %request.label(), "Transform dropped its continuation");
            request.drain(Err(DbError::internal("transform dropped its continuation")));
        }
    }
}

impl fmt::Debug for Continuation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Continuation")
            .field("request", &self.request.as_ref().map(crate::request::Request::label))
            .finish()
    }
}
