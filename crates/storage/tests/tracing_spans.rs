//! Integration test verifying that `#[instrument]` annotations on the
//! `Storage` façade produce one span per operation.

#![allow(clippy::expect_used)]

use std::sync::{Arc, Mutex};

use cursordb_storage::{
    DbIterator, KeyRange, MemoryBackend, Storage, StorageConfig, TransactionMode,
    backend::CursorStep,
    sql::SqlStatement,
    testutil::{sample_records, sample_schema},
};
use serde_json::json;
use tracing::{
    Subscriber,
    field::{Field, Visit},
};
use tracing_subscriber::{layer::SubscriberExt, registry::LookupSpan};

// ---------------------------------------------------------------------------
// Collecting layer: records span names and their `db` field as they are created
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
struct SpanCollector {
    spans: Arc<Mutex<Vec<(String, Option<String>)>>>,
}

#[derive(Default)]
struct DbField(Option<String>);

impl Visit for DbField {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "db" {
            self.0 = Some(format!("{value:?}"));
        }
    }
}

impl<S> tracing_subscriber::Layer<S> for SpanCollector
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(
        &self,
        attrs: &tracing::span::Attributes<'_>,
        id: &tracing::span::Id,
        ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        if let Some(span) = ctx.span(id) {
            let mut db = DbField::default();
            attrs.record(&mut db);
            self.spans.lock().expect("lock poisoned").push((span.name().to_owned(), db.0));
        }
    }
}

impl SpanCollector {
    fn names(&self) -> Vec<String> {
        self.spans.lock().expect("lock poisoned").iter().map(|(name, _)| name.clone()).collect()
    }
}

fn storage(name: &str) -> Storage {
    let config = StorageConfig::builder().name(name).build();
    Storage::with_config(MemoryBackend::new(sample_schema()), config).expect("valid config")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn put_creates_span_with_database_name() {
    let collector = SpanCollector::default();
    let spans = Arc::clone(&collector.spans);

    let subscriber = tracing_subscriber::registry().with(collector);
    let _guard = tracing::subscriber::set_default(subscriber);

    let storage = storage("library");
    storage.put("articles", json!({"id": 1})).outcome().await.expect("put should succeed");

    let recorded = spans.lock().expect("lock poisoned");
    assert!(
        recorded.iter().any(|(name, db)| name == "put" && db.as_deref() == Some("library")),
        "expected a 'put' span tagged with the database name, got: {recorded:?}"
    );
}

#[tokio::test]
async fn get_creates_span() {
    let collector = SpanCollector::default();
    let subscriber = tracing_subscriber::registry().with(collector.clone());
    let _guard = tracing::subscriber::set_default(subscriber);

    let storage = storage("library");
    let _ = storage.get("articles", 1).outcome().await;

    let recorded = collector.names();
    assert!(recorded.iter().any(|s| s == "get"), "expected a 'get' span, got: {recorded:?}");
}

#[tokio::test]
async fn remove_creates_nested_range_span() {
    let collector = SpanCollector::default();
    let subscriber = tracing_subscriber::registry().with(collector.clone());
    let _guard = tracing::subscriber::set_default(subscriber);

    let storage = storage("library");
    storage.remove("articles", 1).outcome().await.expect("remove should succeed");

    let recorded = collector.names();
    assert!(recorded.iter().any(|s| s == "remove"), "expected a 'remove' span, got: {recorded:?}");
    assert!(
        recorded.iter().any(|s| s == "remove_range"),
        "expected a 'remove_range' span, got: {recorded:?}"
    );
}

#[tokio::test]
async fn sql_creates_span() {
    let collector = SpanCollector::default();
    let subscriber = tracing_subscriber::registry().with(collector.clone());
    let _guard = tracing::subscriber::set_default(subscriber);

    let storage = storage("library");
    let req = storage.execute_sql(&SqlStatement::select("articles")).expect("valid statement");
    req.outcome().await.expect("select should succeed");

    let recorded = collector.names();
    assert!(
        recorded.iter().any(|s| s == "execute_sql"),
        "expected an 'execute_sql' span, got: {recorded:?}"
    );
}

#[tokio::test]
async fn all_operations_produce_distinct_spans() {
    let collector = SpanCollector::default();
    let subscriber = tracing_subscriber::registry().with(collector.clone());
    let _guard = tracing::subscriber::set_default(subscriber);

    let storage = storage("library");
    let iter = DbIterator::values("articles", None);

    // Exercise every façade operation
    storage.put_all("articles", sample_records()).outcome().await.expect("put_all");
    storage.put("articles", json!({"id": 8})).outcome().await.expect("put");
    let _ = storage.get("articles", 8).outcome().await;
    let _ = storage.keys(&iter, None, 0).outcome().await;
    let _ = storage.values(&iter, Some(2), 0).outcome().await;
    let _ = storage.keys_in("articles", None, None).outcome().await;
    let _ = storage.values_in("articles", Some(KeyRange::only(1)), None).outcome().await;
    let _ = storage
        .open(&iter, TransactionMode::ReadOnly, |_| Ok(CursorStep::Stop))
        .outcome()
        .await;
    let _ = storage.map(&iter, |_| {}).outcome().await;
    let _ = storage.reduce(&iter, |acc, _, _| acc, json!(0)).outcome().await;
    let _ = storage.count("articles", None).outcome().await;
    let _ = storage.count_index("articles", "type", None).outcome().await;
    let _ = storage.clear_index("articles", "type", Some(KeyRange::only("c"))).outcome().await;
    let _ = storage.clear("articles", None).outcome().await;

    let recorded = collector.names();
    let expected = [
        "put_all",
        "put",
        "get",
        "keys",
        "values",
        "keys_in",
        "values_in",
        "open",
        "map",
        "reduce",
        "count",
        "count_index",
        "clear_index",
        "clear",
    ];

    for name in &expected {
        assert!(
            recorded.iter().any(|s| s == name),
            "missing span '{name}', recorded: {recorded:?}"
        );
    }
}
