//! Request lifecycle metrics.
//!
//! Counts requests issued per method family, how they settled, and how long
//! they took from issue to resolution.
//!
//! # Memory Ordering
//!
//! All counters use `Ordering::Relaxed`. Each counter is independent and
//! monotonically increasing; `snapshot()` reads them one after another, so a
//! snapshot may show a resolution before the matching issue. That is fine for
//! telemetry.
//!
//! # Usage
//!
//! ```
//! use std::time::Duration;
//! use cursordb_storage::{Method, metrics::Metrics};
//!
//! let metrics = Metrics::new();
//! metrics.record_issued(Method::Values);
//! metrics.record_resolved(Duration::from_micros(120));
//!
//! let snapshot = metrics.snapshot();
//! assert_eq!(snapshot.read_count, 1);
//! assert_eq!(snapshot.resolved_count, 1);
//! assert_eq!(snapshot.settle_percentiles.p50, 120);
//! ```

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;
use tracing::warn;

use crate::request::{Method, MethodFamily};

/// Number of settle-latency samples retained.
const HISTOGRAM_WINDOW_SIZE: usize = 1024;

/// Latency percentiles in microseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LatencyPercentiles {
    /// 50th percentile (median).
    pub p50: u64,
    /// 95th percentile.
    pub p95: u64,
    /// 99th percentile.
    pub p99: u64,
}

/// A bounded circular buffer of latency samples.
///
/// Keeps the most recent `capacity` values; percentiles are computed on
/// demand by sorting a copy.
struct LatencyHistogram {
    inner: Mutex<HistogramInner>,
}

struct HistogramInner {
    buf: Vec<u64>,
    pos: usize,
    capacity: usize,
}

impl LatencyHistogram {
    fn new(capacity: usize) -> Self {
        let buf = Vec::with_capacity(capacity);
        Self { inner: Mutex::new(HistogramInner { buf, pos: 0, capacity }) }
    }

    fn record(&self, value_us: u64) {
        let mut inner = self.inner.lock();
        let pos = inner.pos;
        if inner.buf.len() < inner.capacity {
            inner.buf.push(value_us);
        } else {
            inner.buf[pos] = value_us;
        }
        inner.pos = (pos + 1) % inner.capacity;
    }

    fn percentiles(&self) -> LatencyPercentiles {
        let inner = self.inner.lock();
        if inner.buf.is_empty() {
            return LatencyPercentiles::default();
        }
        let mut sorted = inner.buf.clone();
        sorted.sort_unstable();
        let len = sorted.len();
        LatencyPercentiles {
            p50: sorted[percentile_index(len, 50)],
            p95: sorted[percentile_index(len, 95)],
            p99: sorted[percentile_index(len, 99)],
        }
    }

    fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.buf.clear();
        inner.pos = 0;
    }
}

/// Nearest-rank index: `ceil(percentile/100 * len) - 1`, clamped.
fn percentile_index(len: usize, percentile: u32) -> usize {
    if len == 0 {
        return 0;
    }
    let rank = (u64::from(percentile) * len as u64).div_ceil(100) as usize;
    rank.saturating_sub(1).min(len - 1)
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, bon::Builder)]
pub struct MetricsSnapshot {
    /// Read requests issued (get, keys, values, count, list).
    #[builder(default)]
    pub read_count: u64,
    /// Write requests issued (put, remove, clear).
    #[builder(default)]
    pub write_count: u64,
    /// Cursor requests issued (open, patch).
    #[builder(default)]
    pub cursor_count: u64,
    /// SQL statements executed.
    #[builder(default)]
    pub sql_count: u64,

    /// Requests that resolved with a value.
    #[builder(default)]
    pub resolved_count: u64,
    /// Requests that resolved with an error.
    #[builder(default)]
    pub rejected_count: u64,
    /// Successful `abort()` calls.
    #[builder(default)]
    pub aborted_count: u64,
    /// Rejections no observer saw.
    #[builder(default)]
    pub unhandled_rejection_count: u64,
    /// Records rewritten by `patch`.
    #[builder(default)]
    pub patched_records: u64,

    /// Issue-to-resolution latency percentiles in microseconds.
    #[builder(default)]
    pub settle_percentiles: LatencyPercentiles,
}

impl MetricsSnapshot {
    /// Total requests issued.
    #[must_use]
    pub fn total_issued(&self) -> u64 {
        self.read_count + self.write_count + self.cursor_count + self.sql_count
    }

    /// Fraction of settled requests that were rejected.
    #[must_use]
    pub fn rejection_rate(&self) -> f64 {
        let settled = self.resolved_count + self.rejected_count;
        if settled == 0 { 0.0 } else { self.rejected_count as f64 / settled as f64 }
    }
}

/// Lock-free request counters shared by a [`Storage`](crate::Storage) and
/// its requests.
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    read_count: AtomicU64,
    write_count: AtomicU64,
    cursor_count: AtomicU64,
    sql_count: AtomicU64,

    resolved_count: AtomicU64,
    rejected_count: AtomicU64,
    aborted_count: AtomicU64,
    unhandled_rejection_count: AtomicU64,
    patched_records: AtomicU64,

    settle_histogram: LatencyHistogram,
}

impl Metrics {
    /// Creates a zeroed collector.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                read_count: AtomicU64::new(0),
                write_count: AtomicU64::new(0),
                cursor_count: AtomicU64::new(0),
                sql_count: AtomicU64::new(0),
                resolved_count: AtomicU64::new(0),
                rejected_count: AtomicU64::new(0),
                aborted_count: AtomicU64::new(0),
                unhandled_rejection_count: AtomicU64::new(0),
                patched_records: AtomicU64::new(0),
                settle_histogram: LatencyHistogram::new(HISTOGRAM_WINDOW_SIZE),
            }),
        }
    }

    /// Records a newly issued request.
    pub fn record_issued(&self, method: Method) {
        let counter = match method.family() {
            MethodFamily::Read => &self.inner.read_count,
            MethodFamily::Write => &self.inner.write_count,
            MethodFamily::Cursor => &self.inner.cursor_count,
            MethodFamily::Sql => &self.inner.sql_count,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a successful resolution.
    pub fn record_resolved(&self, elapsed: Duration) {
        self.inner.resolved_count.fetch_add(1, Ordering::Relaxed);
        self.inner.settle_histogram.record(elapsed.as_micros() as u64);
    }

    /// Records a rejection.
    pub fn record_rejected(&self, elapsed: Duration) {
        self.inner.rejected_count.fetch_add(1, Ordering::Relaxed);
        self.inner.settle_histogram.record(elapsed.as_micros() as u64);
    }

    /// Records a successful abort.
    pub fn record_aborted(&self) {
        self.inner.aborted_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a rejection that had no observer.
    pub fn record_unhandled_rejection(&self) {
        self.inner.unhandled_rejection_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Records `n` records rewritten by a patch.
    pub fn record_patched(&self, n: u64) {
        self.inner.patched_records.fetch_add(n, Ordering::Relaxed);
    }

    /// Returns the current counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            read_count: self.inner.read_count.load(Ordering::Relaxed),
            write_count: self.inner.write_count.load(Ordering::Relaxed),
            cursor_count: self.inner.cursor_count.load(Ordering::Relaxed),
            sql_count: self.inner.sql_count.load(Ordering::Relaxed),
            resolved_count: self.inner.resolved_count.load(Ordering::Relaxed),
            rejected_count: self.inner.rejected_count.load(Ordering::Relaxed),
            aborted_count: self.inner.aborted_count.load(Ordering::Relaxed),
            unhandled_rejection_count: self.inner.unhandled_rejection_count.load(Ordering::Relaxed),
            patched_records: self.inner.patched_records.load(Ordering::Relaxed),
            settle_percentiles: self.inner.settle_histogram.percentiles(),
        }
    }

    /// Resets every counter to zero.
    pub fn reset(&self) {
        self.inner.read_count.store(0, Ordering::Relaxed);
        self.inner.write_count.store(0, Ordering::Relaxed);
        self.inner.cursor_count.store(0, Ordering::Relaxed);
        self.inner.sql_count.store(0, Ordering::Relaxed);
        self.inner.resolved_count.store(0, Ordering::Relaxed);
        self.inner.rejected_count.store(0, Ordering::Relaxed);
        self.inner.aborted_count.store(0, Ordering::Relaxed);
        self.inner.unhandled_rejection_count.store(0, Ordering::Relaxed);
        self.inner.patched_records.store(0, Ordering::Relaxed);
        self.inner.settle_histogram.reset();
    }

    /// Logs the current counters at INFO level.
    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        if snapshot.total_issued() == 0 {
            return;
        }

        tracing::info!(
            read_count = snapshot.read_count,
            write_count = snapshot.write_count,
            cursor_count = snapshot.cursor_count,
            sql_count = snapshot.sql_count,
            resolved_count = snapshot.resolved_count,
            rejected_count = snapshot.rejected_count,
            aborted_count = snapshot.aborted_count,
            patched_records = snapshot.patched_records,
            settle_p50 = snapshot.settle_percentiles.p50,
            settle_p99 = snapshot.settle_percentiles.p99,
            "Request metrics snapshot"
        );

        if snapshot.unhandled_rejection_count > 0 {
            warn!(
                unhandled_rejection_count = snapshot.unhandled_rejection_count,
                "Requests were rejected without an observer"
            );
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").field("snapshot", &self.snapshot()).finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn issued_requests_are_counted_by_family() {
        let metrics = Metrics::new();
        metrics.record_issued(Method::Get);
        metrics.record_issued(Method::ValuesIter);
        metrics.record_issued(Method::Put);
        metrics.record_issued(Method::Open);
        metrics.record_issued(Method::Sql);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.read_count, 2);
        assert_eq!(snapshot.write_count, 1);
        assert_eq!(snapshot.cursor_count, 1);
        assert_eq!(snapshot.sql_count, 1);
        assert_eq!(snapshot.total_issued(), 5);
    }

    #[test]
    fn rejection_rate() {
        let metrics = Metrics::new();
        assert_eq!(metrics.snapshot().rejection_rate(), 0.0);
        metrics.record_resolved(Duration::from_micros(10));
        metrics.record_resolved(Duration::from_micros(10));
        metrics.record_resolved(Duration::from_micros(10));
        metrics.record_rejected(Duration::from_micros(10));
        assert!((metrics.snapshot().rejection_rate() - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn percentiles_use_nearest_rank() {
        let metrics = Metrics::new();
        for us in 1..=100 {
            metrics.record_resolved(Duration::from_micros(us));
        }
        let p = metrics.snapshot().settle_percentiles;
        assert_eq!(p, LatencyPercentiles { p50: 50, p95: 95, p99: 99 });
    }

    #[test]
    fn histogram_window_overwrites_oldest() {
        let histogram = LatencyHistogram::new(4);
        for v in [100, 100, 100, 100, 1, 1, 1, 1] {
            histogram.record(v);
        }
        assert_eq!(histogram.percentiles().p99, 1);
    }

    #[test]
    fn reset_zeroes_everything() {
        let metrics = Metrics::new();
        metrics.record_issued(Method::Count);
        metrics.record_aborted();
        metrics.record_patched(3);
        metrics.record_resolved(Duration::from_micros(5));
        metrics.reset();
        assert_eq!(metrics.snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn clones_share_counters() {
        let metrics = Metrics::new();
        let clone = metrics.clone();
        clone.record_unhandled_rejection();
        assert_eq!(metrics.snapshot().unhandled_rejection_count, 1);
    }

    #[test]
    fn snapshot_builder_defaults() {
        let snapshot = MetricsSnapshot::builder().read_count(2).build();
        assert_eq!(snapshot.read_count, 2);
        assert_eq!(snapshot.rejected_count, 0);
    }
}
