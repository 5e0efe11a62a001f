//! Per-coordinator query metrics: atomic counters and a bounded window of
//! query durations summarized as p50/p95/p99.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

const MAX_QUERY_TIMES: usize = 1000;

/// One row of `trex_query_metrics()`.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricEntry {
    pub name: String,
    pub metric_type: String,
    pub value: String,
}

impl MetricEntry {
    fn new(name: &str, metric_type: &str, value: String) -> Self {
        MetricEntry {
            name: name.to_string(),
            metric_type: metric_type.to_string(),
            value,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct HistogramSummary {
    pub count: u64,
    pub sum: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

impl std::fmt::Display for HistogramSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "sum={:.3} count={} p50={:.3} p95={:.3} p99={:.3}",
            self.sum, self.count, self.p50, self.p95, self.p99,
        )
    }
}

#[derive(Debug, Default)]
pub struct QueryMetrics {
    pub queries_submitted: AtomicU64,
    pub queries_finished: AtomicU64,
    pub queries_failed: AtomicU64,
    pub queries_cancelled: AtomicU64,
    pub queries_rejected: AtomicU64,
    pub queries_pruned: AtomicU64,

    pub active_queries: AtomicU64,

    query_times: Mutex<VecDeque<f64>>,
}

impl QueryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_query_submitted(&self) {
        self.queries_submitted.fetch_add(1, Ordering::Relaxed);
        self.active_queries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_query_finished(&self, elapsed: Duration) {
        self.queries_finished.fetch_add(1, Ordering::Relaxed);
        self.record_end(elapsed);
    }

    /// A killed query counts as both failed and cancelled.
    pub fn record_query_failed(&self, elapsed: Duration, cancelled: bool) {
        self.queries_failed.fetch_add(1, Ordering::Relaxed);
        if cancelled {
            self.queries_cancelled.fetch_add(1, Ordering::Relaxed);
        }
        self.record_end(elapsed);
    }

    pub fn record_query_rejected(&self) {
        self.queries_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_queries_pruned(&self, n: usize) {
        self.queries_pruned.fetch_add(n as u64, Ordering::Relaxed);
    }

    fn record_end(&self, elapsed: Duration) {
        let _ = self
            .active_queries
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));

        if let Ok(mut times) = self.query_times.lock() {
            if times.len() >= MAX_QUERY_TIMES {
                times.pop_front();
            }
            times.push_back(elapsed.as_secs_f64());
        }
    }

    pub fn get_all_metrics(&self) -> Vec<MetricEntry> {
        let counter = |name: &str, v: &AtomicU64| {
            MetricEntry::new(name, "counter", v.load(Ordering::Relaxed).to_string())
        };

        vec![
            counter("queries_submitted", &self.queries_submitted),
            counter("queries_finished", &self.queries_finished),
            counter("queries_failed", &self.queries_failed),
            counter("queries_cancelled", &self.queries_cancelled),
            counter("queries_rejected", &self.queries_rejected),
            counter("queries_pruned", &self.queries_pruned),
            MetricEntry::new(
                "active_queries",
                "gauge",
                self.active_queries.load(Ordering::Relaxed).to_string(),
            ),
            MetricEntry::new(
                "query_elapsed_time_seconds",
                "histogram",
                self.get_query_time_histogram().to_string(),
            ),
        ]
    }

    pub fn get_query_time_histogram(&self) -> HistogramSummary {
        let times = match self.query_times.lock() {
            Ok(t) => t.clone(),
            Err(_) => return HistogramSummary::default(),
        };
        if times.is_empty() {
            return HistogramSummary::default();
        }

        let count = times.len() as u64;
        let sum: f64 = times.iter().sum();

        let mut sorted: Vec<f64> = times.into_iter().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        HistogramSummary {
            count,
            sum,
            p50: percentile(&sorted, 50.0),
            p95: percentile(&sorted, 95.0),
            p99: percentile(&sorted, 99.0),
        }
    }
}

/// Nearest-rank percentile from a sorted slice.
fn percentile(sorted: &[f64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (pct / 100.0 * (sorted.len() as f64 - 1.0)).round() as usize;
    sorted[rank.min(sorted.len() - 1)]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value<'a>(entries: &'a [MetricEntry], name: &str) -> &'a str {
        entries
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.value.as_str())
            .unwrap()
    }

    #[test]
    fn new_metrics_are_zero() {
        let m = QueryMetrics::new();
        assert_eq!(m.queries_submitted.load(Ordering::Relaxed), 0);
        assert_eq!(m.active_queries.load(Ordering::Relaxed), 0);
        assert_eq!(m.get_query_time_histogram().count, 0);
    }

    #[test]
    fn lifecycle_updates_counters_and_gauge() {
        let m = QueryMetrics::new();
        m.record_query_submitted();
        m.record_query_submitted();
        m.record_query_submitted();
        m.record_query_finished(Duration::from_millis(10));
        m.record_query_failed(Duration::from_millis(20), true);
        m.record_query_rejected();

        let entries = m.get_all_metrics();
        assert_eq!(value(&entries, "queries_submitted"), "3");
        assert_eq!(value(&entries, "queries_finished"), "1");
        assert_eq!(value(&entries, "queries_failed"), "1");
        assert_eq!(value(&entries, "queries_cancelled"), "1");
        assert_eq!(value(&entries, "queries_rejected"), "1");
        assert_eq!(value(&entries, "active_queries"), "1");
    }

    #[test]
    fn active_gauge_never_underflows() {
        let m = QueryMetrics::new();
        m.record_query_finished(Duration::ZERO);
        assert_eq!(m.active_queries.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn histogram_percentiles() {
        let m = QueryMetrics::new();
        for i in 1..=100 {
            m.record_query_finished(Duration::from_secs(i));
        }
        let h = m.get_query_time_histogram();
        assert_eq!(h.count, 100);
        assert!((h.sum - 5050.0).abs() < 1e-6);
        assert!((h.p50 - 50.0).abs() < 1.5);
        assert!((h.p95 - 95.0).abs() < 1.5);
        assert!((h.p99 - 99.0).abs() < 1.5);
    }

    #[test]
    fn histogram_window_is_bounded() {
        let m = QueryMetrics::new();
        for _ in 0..(MAX_QUERY_TIMES + 50) {
            m.record_query_finished(Duration::from_millis(1));
        }
        assert_eq!(m.get_query_time_histogram().count, MAX_QUERY_TIMES as u64);
    }

    #[test]
    fn metric_types() {
        let entries = QueryMetrics::new().get_all_metrics();
        assert_eq!(entries.len(), 8);
        for e in &entries {
            let expected = match e.name.as_str() {
                "active_queries" => "gauge",
                "query_elapsed_time_seconds" => "histogram",
                _ => "counter",
            };
            assert_eq!(e.metric_type, expected, "{}", e.name);
        }
    }

    #[test]
    fn percentile_edge_cases() {
        assert_eq!(percentile(&[], 50.0), 0.0);
        assert_eq!(percentile(&[42.0], 99.0), 42.0);
        let data = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(percentile(&data, 0.0), 1.0);
        assert_eq!(percentile(&data, 100.0), 5.0);
    }
}
