//! Performance metrics for the similarity engine
//!
//! Lightweight, thread-safe collection of query and build timings.
//! One `Metrics` is shared (via `Arc`) by an engine and whoever reports
//! on it.
//!
//! # Overview
//!
//! - Query latencies with percentiles (p50, p95, p99) over a rolling window
//! - Slow query detection
//! - Per-operation counts and average latency
//! - Last rebuild/update statistics
//!
//! # Example
//!
//! ```
//! use simgraph::metrics::{Metrics, Operation};
//!
//! let metrics = Metrics::new();
//! metrics.record_query(Operation::Neighbors, 15);
//!
//! let stats = metrics.snapshot();
//! assert_eq!(stats.query_count, 1);
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use serde::Serialize;

/// Rolling window of recent latencies used for percentiles.
const LATENCY_WINDOW_SIZE: usize = 1000;

/// Only the most recent slow queries are kept.
const MAX_SLOW_QUERIES: usize = 10;

/// Queries at or above this many milliseconds are recorded as slow.
pub const SLOW_QUERY_THRESHOLD_MS: u64 = 100;

/// Engine operations tracked individually.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Neighbors,
    ExtendedNeighbors,
    PatternQuery,
    Rebuild,
    Update,
    Prune,
    Other,
}

impl Operation {
    pub const ALL: [Operation; 7] = [
        Operation::Neighbors,
        Operation::ExtendedNeighbors,
        Operation::PatternQuery,
        Operation::Rebuild,
        Operation::Update,
        Operation::Prune,
        Operation::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Neighbors => "Neighbors",
            Operation::ExtendedNeighbors => "ExtendedNeighbors",
            Operation::PatternQuery => "PatternQuery",
            Operation::Rebuild => "Rebuild",
            Operation::Update => "Update",
            Operation::Prune => "Prune",
            Operation::Other => "Other",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Count and latency sum for one operation.
#[derive(Default)]
struct OperationCounter {
    count: AtomicU64,
    latency_sum_ms: AtomicU64,
}

/// Thread-safe metrics collector.
///
/// Counters are atomics; the latency window and slow query buffer sit
/// behind mutexes. Memory use is bounded by the window sizes.
pub struct Metrics {
    query_count: AtomicU64,
    slow_query_count: AtomicU64,

    /// Rolling window of recent latencies
    latencies_ms: Mutex<VecDeque<u64>>,

    /// Sum of the latencies currently in the window
    latency_sum_ms: AtomicU64,

    ops: [OperationCounter; 7],

    build_count: AtomicU64,
    build_total_ms: AtomicU64,
    last_build_ms: AtomicU64,
    last_build_nodes: AtomicU64,
    last_build_edges: AtomicU64,

    slow_queries: Mutex<VecDeque<SlowQuery>>,

    started_at: Instant,
}

/// A query that took at least `SLOW_QUERY_THRESHOLD_MS`.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SlowQuery {
    pub operation: String,
    pub duration_ms: u64,
    /// Milliseconds since the collector started
    pub timestamp_ms: u64,
}

/// Point-in-time copy of all metrics.
#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub query_count: u64,
    pub slow_query_count: u64,
    pub query_p50_ms: u64,
    pub query_p95_ms: u64,
    pub query_p99_ms: u64,
    pub query_avg_ms: u64,

    pub build_count: u64,
    pub build_avg_ms: u64,
    pub last_build_ms: u64,
    /// Image nodes created by the most recent rebuild/update
    pub last_build_nodes: u64,
    /// Similarity edges created by the most recent rebuild/update
    pub last_build_edges: u64,

    pub top_slow_queries: Vec<SlowQuery>,
    pub uptime_secs: u64,

    /// Operations with at least one call, most frequent first (top 5)
    pub op_stats: Vec<OperationStat>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationStat {
    pub operation: String,
    pub count: u64,
    pub avg_ms: u64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            query_count: AtomicU64::new(0),
            slow_query_count: AtomicU64::new(0),
            latencies_ms: Mutex::new(VecDeque::with_capacity(LATENCY_WINDOW_SIZE)),
            latency_sum_ms: AtomicU64::new(0),
            ops: Default::default(),
            build_count: AtomicU64::new(0),
            build_total_ms: AtomicU64::new(0),
            last_build_ms: AtomicU64::new(0),
            last_build_nodes: AtomicU64::new(0),
            last_build_edges: AtomicU64::new(0),
            slow_queries: Mutex::new(VecDeque::with_capacity(MAX_SLOW_QUERIES)),
            started_at: Instant::now(),
        }
    }

    /// Record one completed operation.
    ///
    /// O(1) amortized: atomic increments plus bounded deque updates.
    pub fn record_query(&self, operation: Operation, duration_ms: u64) {
        self.query_count.fetch_add(1, Ordering::Relaxed);

        let op = &self.ops[operation.index()];
        op.count.fetch_add(1, Ordering::Relaxed);
        op.latency_sum_ms.fetch_add(duration_ms, Ordering::Relaxed);

        {
            let mut latencies = lock(&self.latencies_ms);
            if latencies.len() >= LATENCY_WINDOW_SIZE {
                if let Some(old) = latencies.pop_front() {
                    self.latency_sum_ms.fetch_sub(old, Ordering::Relaxed);
                }
            }
            latencies.push_back(duration_ms);
            self.latency_sum_ms.fetch_add(duration_ms, Ordering::Relaxed);
        }

        if duration_ms >= SLOW_QUERY_THRESHOLD_MS {
            self.slow_query_count.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("slow {} query: {}ms", operation.as_str(), duration_ms);

            let slow_query = SlowQuery {
                operation: operation.as_str().to_string(),
                duration_ms,
                timestamp_ms: self.started_at.elapsed().as_millis() as u64,
            };
            let mut slow_queries = lock(&self.slow_queries);
            if slow_queries.len() >= MAX_SLOW_QUERIES {
                slow_queries.pop_front();
            }
            slow_queries.push_back(slow_query);
        }
    }

    /// Record a finished rebuild or update.
    pub fn record_build(&self, duration_ms: u64, nodes_created: u64, edges_created: u64) {
        self.build_count.fetch_add(1, Ordering::Relaxed);
        self.build_total_ms.fetch_add(duration_ms, Ordering::Relaxed);
        self.last_build_ms.store(duration_ms, Ordering::Relaxed);
        self.last_build_nodes.store(nodes_created, Ordering::Relaxed);
        self.last_build_edges.store(edges_created, Ordering::Relaxed);
    }

    /// Number of recorded calls of `operation`
    pub fn operation_count(&self, operation: Operation) -> u64 {
        self.ops[operation.index()].count.load(Ordering::Relaxed)
    }

    /// Point-in-time copy. Sorts the latency window, so O(window) per call.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let (p50, p95, p99, avg) = {
            let latencies = lock(&self.latencies_ms);
            if latencies.is_empty() {
                (0, 0, 0, 0)
            } else {
                let mut sorted: Vec<u64> = latencies.iter().copied().collect();
                sorted.sort_unstable();

                let len = sorted.len();
                let p50 = sorted[len * 50 / 100];
                let p95 = sorted[len * 95 / 100];
                let p99 = sorted.get(len * 99 / 100).copied().unwrap_or(sorted[len - 1]);
                let avg = self.latency_sum_ms.load(Ordering::Relaxed) / len as u64;
                (p50, p95, p99, avg)
            }
        };

        let build_count = self.build_count.load(Ordering::Relaxed);
        let build_avg = if build_count > 0 {
            self.build_total_ms.load(Ordering::Relaxed) / build_count
        } else {
            0
        };

        let top_slow = lock(&self.slow_queries).iter().cloned().collect();

        MetricsSnapshot {
            query_count: self.query_count.load(Ordering::Relaxed),
            slow_query_count: self.slow_query_count.load(Ordering::Relaxed),
            query_p50_ms: p50,
            query_p95_ms: p95,
            query_p99_ms: p99,
            query_avg_ms: avg,
            build_count,
            build_avg_ms: build_avg,
            last_build_ms: self.last_build_ms.load(Ordering::Relaxed),
            last_build_nodes: self.last_build_nodes.load(Ordering::Relaxed),
            last_build_edges: self.last_build_edges.load(Ordering::Relaxed),
            top_slow_queries: top_slow,
            uptime_secs: self.started_at.elapsed().as_secs(),
            op_stats: self.top_operations(5),
        }
    }

    fn top_operations(&self, n: usize) -> Vec<OperationStat> {
        let mut stats: Vec<OperationStat> = Operation::ALL
            .iter()
            .filter_map(|op| {
                let counter = &self.ops[op.index()];
                let count = counter.count.load(Ordering::Relaxed);
                (count > 0).then(|| OperationStat {
                    operation: op.as_str().to_string(),
                    count,
                    avg_ms: counter.latency_sum_ms.load(Ordering::Relaxed) / count,
                })
            })
            .collect();

        stats.sort_by(|a, b| b.count.cmp(&a.count));
        stats.truncate(n);
        stats
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_empty_snapshot() {
        let snap = Metrics::new().snapshot();

        assert_eq!(snap.query_count, 0);
        assert_eq!(snap.slow_query_count, 0);
        assert_eq!(snap.query_p50_ms, 0);
        assert_eq!(snap.query_p99_ms, 0);
        assert_eq!(snap.query_avg_ms, 0);
        assert_eq!(snap.build_count, 0);
        assert_eq!(snap.build_avg_ms, 0);
        assert!(snap.top_slow_queries.is_empty());
        assert!(snap.op_stats.is_empty());
    }

    #[test]
    fn test_slow_query_tracking() {
        let m = Metrics::new();

        m.record_query(Operation::Neighbors, 50);
        m.record_query(Operation::Neighbors, 99);
        assert_eq!(m.snapshot().slow_query_count, 0);

        m.record_query(Operation::ExtendedNeighbors, 100);
        let snap = m.snapshot();
        assert_eq!(snap.slow_query_count, 1);
        assert_eq!(snap.top_slow_queries[0].operation, "ExtendedNeighbors");
        assert_eq!(snap.top_slow_queries[0].duration_ms, 100);
    }

    #[test]
    fn test_percentile_calculation() {
        let m = Metrics::new();
        for i in 1..=100 {
            m.record_query(Operation::Neighbors, i);
        }

        let snap = m.snapshot();
        // Floor-based: sorted[len * p / 100]
        assert_eq!(snap.query_p50_ms, 51);
        assert_eq!(snap.query_p95_ms, 96);
        assert_eq!(snap.query_p99_ms, 100);
        assert_eq!(snap.query_avg_ms, 50);
    }

    #[test]
    fn test_latency_window_eviction() {
        let m = Metrics::new();
        for _ in 0..LATENCY_WINDOW_SIZE {
            m.record_query(Operation::Neighbors, 10);
        }
        assert_eq!(m.snapshot().query_p50_ms, 10);

        for _ in 0..LATENCY_WINDOW_SIZE {
            m.record_query(Operation::Neighbors, 20);
        }
        let snap = m.snapshot();
        assert_eq!(snap.query_p50_ms, 20);
        assert_eq!(snap.query_avg_ms, 20);
        assert_eq!(snap.query_count, 2 * LATENCY_WINDOW_SIZE as u64);
    }

    #[test]
    fn test_build_recording() {
        let m = Metrics::new();
        m.record_build(100, 50, 120);
        m.record_build(300, 10, 4);

        let snap = m.snapshot();
        assert_eq!(snap.build_count, 2);
        assert_eq!(snap.build_avg_ms, 200);
        assert_eq!(snap.last_build_ms, 300);
        assert_eq!(snap.last_build_nodes, 10);
        assert_eq!(snap.last_build_edges, 4);
    }

    #[test]
    fn test_operation_stats_sorted_and_limited() {
        let m = Metrics::new();
        let plan = [
            (Operation::Neighbors, 60),
            (Operation::ExtendedNeighbors, 50),
            (Operation::PatternQuery, 40),
            (Operation::Prune, 30),
            (Operation::Update, 20),
            (Operation::Rebuild, 10),
        ];
        for (op, n) in plan {
            for _ in 0..n {
                m.record_query(op, 4);
            }
        }

        let snap = m.snapshot();
        assert_eq!(snap.op_stats.len(), 5);
        assert_eq!(snap.op_stats[0].operation, "Neighbors");
        assert_eq!(snap.op_stats[0].count, 60);
        assert_eq!(snap.op_stats[0].avg_ms, 4);
        assert!(snap.op_stats.iter().all(|s| s.operation != "Rebuild"));
        assert_eq!(m.operation_count(Operation::Rebuild), 10);
    }

    #[test]
    fn test_slow_queries_limited() {
        let m = Metrics::new();
        for i in 0..15 {
            m.record_query(Operation::Other, 100 + i);
        }

        let snap = m.snapshot();
        assert_eq!(snap.top_slow_queries.len(), MAX_SLOW_QUERIES);
        assert_eq!(snap.top_slow_queries[0].duration_ms, 105);
        assert_eq!(snap.top_slow_queries[9].duration_ms, 114);
    }

    #[test]
    fn test_snapshot_serializes_camel_case() {
        let m = Metrics::new();
        m.record_query(Operation::Neighbors, 3);
        let json = serde_json::to_value(m.snapshot()).unwrap();
        assert_eq!(json["queryCount"], 1);
        assert_eq!(json["opStats"][0]["operation"], "Neighbors");
    }

    #[test]
    fn test_thread_safety() {
        let m = Arc::new(Metrics::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let m = Arc::clone(&m);
                thread::spawn(move || {
                    for _ in 0..100 {
                        m.record_query(Operation::Neighbors, 10);
                    }
                    m.record_build(5, 1, 1);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let snap = m.snapshot();
        assert_eq!(snap.query_count, 800);
        assert_eq!(snap.build_count, 8);
    }
}
