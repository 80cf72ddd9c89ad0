//! Transactional request/deferred model and query engine for record stores.
//!
//! Every database call returns a [`Request`]: a single-resolution result
//! that knows which back-end transaction runs it. Callers chain transforms
//! on the request, can abort the whole transaction from any of them, and
//! observe the final outcome through callbacks or by awaiting it. Queries
//! are immutable builders that compile to key-range scans over a store or an
//! index and keep a shared cursor position for pagination.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │        Query builder            │     SQL statements        │
//! │ (where/select/order/and/patch)  │ (select, aggregates)      │
//! ├─────────────────────────────────────────────────────────────┤
//! │                        Storage façade                       │
//! │        get, put, remove, list, open, count, clear           │
//! ├─────────────────────────────────────────────────────────────┤
//! │       Request (Deferred + Transactional), DbIterator        │
//! ├─────────────────────────────────────────────────────────────┤
//! │                        Backend trait                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │                  MemoryBackend (reference)                  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```
//! use cursordb_storage::{
//!     DatabaseSchema, IndexSchema, KeyRange, MemoryBackend, Storage, StoreSchema,
//! };
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let schema = DatabaseSchema::new(vec![
//!         StoreSchema::new("notes", "id").with_index(IndexSchema::new("tag", "tag")),
//!     ]);
//!     let storage = Storage::new(MemoryBackend::new(schema));
//!
//!     storage
//!         .put_all("notes", vec![
//!             json!({"id": 1, "tag": "work"}),
//!             json!({"id": 2, "tag": "home"}),
//!             json!({"id": 3, "tag": "work"}),
//!         ])
//!         .outcome()
//!         .await?;
//!
//!     let work = storage.from("notes")?.where_range("tag", KeyRange::only("work"))?;
//!     let ids = work.select(&["id"])?.list(None).outcome().await?;
//!     assert_eq!(ids, json!([1, 3]));
//!     Ok(())
//! }
//! ```
//!
//! # Implementing a Backend
//!
//! 1. Implement the [`Backend`] trait.
//! 2. Implement [`TxHandle`] for the engine's transaction.
//! 3. Map engine errors to [`DbError`].
//! 4. Run the `conformance` suite against it.
//!
//! See the [`memory`] module source for a reference implementation.
//!
//! # Error Handling
//!
//! Malformed input is reported synchronously as [`DbError::Argument`]; only
//! engine-side failures travel through the request. All fallible calls
//! return [`DbResult<T>`].
//!
//! # Feature Flags
//!
//! - **`testutil`**: Enables the `testutil` module (sample schema and records, storage factories,
//!   assertion macros) and the `conformance` suite for back-end authors.
//! - **`failpoints`**: Enables `fail` injection points in the memory back-end.

#![deny(unsafe_code)]

pub mod backend;
pub mod config;
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used)]
pub mod conformance;
pub mod deferred;
pub mod error;
pub mod iterator;
pub mod key;
pub mod key_range;
pub mod memory;
pub mod metrics;
pub mod query;
pub mod request;
pub mod schema;
pub mod sql;
pub mod storage;
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used)]
pub mod testutil;

// Re-export primary types at crate root for convenience
pub use backend::{
    Backend, CursorCallback, CursorEntry, CursorStep, CursorWrite, ListScan, PendingWrite,
    PositionReport, QueryMethod, Scope,
};
pub use config::{DEFAULT_RESULT_LIMIT, StorageConfig};
pub use deferred::{Continuation, Deferred, TransactionMode, Transactional, TxHandle};
pub use error::{BoxError, ConfigError, DbError, DbResult};
pub use iterator::{CursorPosition, DbIterator};
pub use key::Key;
pub use key_range::{Comparison, KeyRange};
pub use memory::{MemoryBackend, MemoryTx};
pub use metrics::{LatencyPercentiles, Metrics, MetricsSnapshot};
pub use query::{Patch, Query, QueryType};
pub use request::{
    Method, MethodFamily, Request, RequestState, UnhandledRejection, UnhandledRejectionHook,
    set_unhandled_rejection_hook,
};
pub use schema::{DatabaseSchema, IndexSchema, StoreSchema};
pub use storage::Storage;
