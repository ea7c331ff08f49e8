//! Request and commit metrics for the server.
//!
//! Server-wide rather than per database. Counters are atomics; the latency
//! window and the slow-request log sit behind mutexes and are bounded, so
//! memory stays fixed however long the server runs.
//!
//! ```
//! use std::time::Duration;
//! use cgdb::metrics::Metrics;
//!
//! let metrics = Metrics::new();
//! metrics.record_request("bfs", Duration::from_millis(15));
//! let snapshot = metrics.snapshot();
//! assert_eq!(snapshot.request_count, 1);
//! assert_eq!(snapshot.latency_p50_ms, 15);
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::storage::types::CommitDelta;

/// Latencies kept for percentiles.
const LATENCY_WINDOW_SIZE: usize = 1000;

const MAX_SLOW_REQUESTS: usize = 10;

/// Operations listed in [`MetricsSnapshot::top_operations`].
const TOP_OPERATIONS: usize = 5;

pub const DEFAULT_SLOW_THRESHOLD_MS: u64 = 100;

#[derive(Debug, Default)]
struct OpTotals {
    count: u64,
    total_ms: u64,
}

#[derive(Debug)]
pub struct Metrics {
    slow_threshold_ms: u64,
    started: Instant,

    request_count: AtomicU64,
    slow_request_count: AtomicU64,
    latencies_ms: Mutex<VecDeque<u64>>,
    per_op: Mutex<HashMap<&'static str, OpTotals>>,
    slow_requests: Mutex<VecDeque<SlowRequest>>,

    commit_count: AtomicU64,
    commit_total_ms: AtomicU64,
    last_commit_ms: AtomicU64,
    last_commit_nodes: AtomicU64,
    last_commit_edges: AtomicU64,
}

/// One request that took at least the slow threshold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SlowRequest {
    pub operation: String,
    pub duration_ms: u64,
    /// Milliseconds since the server started.
    pub at_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationStats {
    pub operation: String,
    pub count: u64,
    pub avg_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub request_count: u64,
    pub slow_request_count: u64,
    pub slow_threshold_ms: u64,
    pub latency_avg_ms: u64,
    pub latency_p50_ms: u64,
    pub latency_p95_ms: u64,
    pub latency_p99_ms: u64,
    /// Most frequent operations, busiest first.
    pub top_operations: Vec<OperationStats>,
    /// Newest last.
    pub slow_requests: Vec<SlowRequest>,
    pub commit_count: u64,
    pub commit_avg_ms: u64,
    pub last_commit_ms: u64,
    pub last_commit_nodes: u64,
    pub last_commit_edges: u64,
    pub uptime_secs: u64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self::with_slow_threshold(DEFAULT_SLOW_THRESHOLD_MS)
    }

    pub fn with_slow_threshold(slow_threshold_ms: u64) -> Self {
        Self {
            slow_threshold_ms,
            started: Instant::now(),
            request_count: AtomicU64::new(0),
            slow_request_count: AtomicU64::new(0),
            latencies_ms: Mutex::new(VecDeque::with_capacity(LATENCY_WINDOW_SIZE)),
            per_op: Mutex::new(HashMap::new()),
            slow_requests: Mutex::new(VecDeque::with_capacity(MAX_SLOW_REQUESTS)),
            commit_count: AtomicU64::new(0),
            commit_total_ms: AtomicU64::new(0),
            last_commit_ms: AtomicU64::new(0),
            last_commit_nodes: AtomicU64::new(0),
            last_commit_edges: AtomicU64::new(0),
        }
    }

    // -- Recording ----------------------------------------------------------

    pub fn record_request(&self, operation: &'static str, elapsed: Duration) {
        let ms = elapsed.as_millis() as u64;
        self.request_count.fetch_add(1, Ordering::Relaxed);

        if let Ok(mut window) = self.latencies_ms.lock() {
            if window.len() == LATENCY_WINDOW_SIZE {
                window.pop_front();
            }
            window.push_back(ms);
        }
        if let Ok(mut per_op) = self.per_op.lock() {
            let totals = per_op.entry(operation).or_default();
            totals.count += 1;
            totals.total_ms += ms;
        }

        if ms >= self.slow_threshold_ms {
            self.slow_request_count.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(operation, duration_ms = ms, threshold_ms = self.slow_threshold_ms, "slow request");
            if let Ok(mut slow) = self.slow_requests.lock() {
                if slow.len() == MAX_SLOW_REQUESTS {
                    slow.pop_front();
                }
                slow.push_back(SlowRequest {
                    operation: operation.to_string(),
                    duration_ms: ms,
                    at_ms: self.started.elapsed().as_millis() as u64,
                });
            }
        }
    }

    pub fn record_commit(&self, elapsed: Duration, delta: &CommitDelta) {
        let ms = elapsed.as_millis() as u64;
        self.commit_count.fetch_add(1, Ordering::Relaxed);
        self.commit_total_ms.fetch_add(ms, Ordering::Relaxed);
        self.last_commit_ms.store(ms, Ordering::Relaxed);
        self.last_commit_nodes
            .store(delta.nodes_added + delta.nodes_modified, Ordering::Relaxed);
        self.last_commit_edges
            .store(delta.edges_added + delta.edges_modified, Ordering::Relaxed);
    }

    // -- Reporting ----------------------------------------------------------

    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut sorted: Vec<u64> = match self.latencies_ms.lock() {
            Ok(window) => window.iter().copied().collect(),
            Err(_) => Vec::new(),
        };
        sorted.sort_unstable();
        let latency_avg_ms = match sorted.len() {
            0 => 0,
            n => sorted.iter().sum::<u64>() / n as u64,
        };

        let mut top_operations: Vec<OperationStats> = match self.per_op.lock() {
            Ok(per_op) => per_op
                .iter()
                .map(|(op, t)| OperationStats {
                    operation: op.to_string(),
                    count: t.count,
                    avg_ms: t.total_ms / t.count.max(1),
                })
                .collect(),
            Err(_) => Vec::new(),
        };
        top_operations.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.operation.cmp(&b.operation)));
        top_operations.truncate(TOP_OPERATIONS);

        let slow_requests = match self.slow_requests.lock() {
            Ok(slow) => slow.iter().cloned().collect(),
            Err(_) => Vec::new(),
        };

        let commit_count = self.commit_count.load(Ordering::Relaxed);
        MetricsSnapshot {
            request_count: self.request_count.load(Ordering::Relaxed),
            slow_request_count: self.slow_request_count.load(Ordering::Relaxed),
            slow_threshold_ms: self.slow_threshold_ms,
            latency_avg_ms,
            latency_p50_ms: percentile(&sorted, 50),
            latency_p95_ms: percentile(&sorted, 95),
            latency_p99_ms: percentile(&sorted, 99),
            top_operations,
            slow_requests,
            commit_count,
            commit_avg_ms: self.commit_total_ms.load(Ordering::Relaxed) / commit_count.max(1),
            last_commit_ms: self.last_commit_ms.load(Ordering::Relaxed),
            last_commit_nodes: self.last_commit_nodes.load(Ordering::Relaxed),
            last_commit_edges: self.last_commit_edges.load(Ordering::Relaxed),
            uptime_secs: self.started.elapsed().as_secs(),
        }
    }
}

/// Nearest-rank percentile of an ascending slice. 0 when empty.
fn percentile(sorted: &[u64], p: usize) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = (p * sorted.len()).div_ceil(100).max(1);
    sorted[rank.min(sorted.len()) - 1]
}
