//! In-process metrics collection
//!
//! A small keyed metric store backing the monitoring endpoints: counters
//! accumulate, gauges overwrite, histograms track count/sum/average. The
//! HTTP middleware in the server feeds request counts and latencies here.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Instant;

/// Metric families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
}

/// Running aggregate for a histogram metric.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HistogramStats {
    pub count: u64,
    pub sum: f64,
    pub avg: f64,
}

/// One named metric with labels.
#[derive(Debug, Clone, Serialize)]
pub struct Metric {
    pub name: String,
    pub kind: MetricKind,
    pub value: f64,
    pub labels: HashMap<String, String>,
    pub timestamp: DateTime<Utc>,
    pub help: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub histogram: Option<HistogramStats>,
}

/// Keyed in-memory metric store.
pub struct MetricsCollector {
    metrics: RwLock<HashMap<String, Metric>>,
    started_at: Instant,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            metrics: RwLock::new(HashMap::new()),
            started_at: Instant::now(),
        }
    }

    /// Record a metric sample. Counters accumulate; gauges overwrite.
    pub fn record(
        &self,
        name: &str,
        kind: MetricKind,
        value: f64,
        labels: HashMap<String, String>,
        help: &str,
    ) {
        let key = metric_key(name, &labels);
        let mut metrics = self.metrics.write();

        match kind {
            MetricKind::Counter => {
                let entry = metrics.entry(key).or_insert_with(|| Metric {
                    name: name.to_string(),
                    kind,
                    value: 0.0,
                    labels,
                    timestamp: Utc::now(),
                    help: help.to_string(),
                    histogram: None,
                });
                entry.value += value;
                entry.timestamp = Utc::now();
            }
            MetricKind::Gauge => {
                metrics.insert(
                    key,
                    Metric {
                        name: name.to_string(),
                        kind,
                        value,
                        labels,
                        timestamp: Utc::now(),
                        help: help.to_string(),
                        histogram: None,
                    },
                );
            }
            MetricKind::Histogram => {
                let entry = metrics.entry(key).or_insert_with(|| Metric {
                    name: name.to_string(),
                    kind,
                    value: 0.0,
                    labels,
                    timestamp: Utc::now(),
                    help: help.to_string(),
                    histogram: Some(HistogramStats::default()),
                });
                let stats = entry.histogram.get_or_insert_with(HistogramStats::default);
                stats.count += 1;
                stats.sum += value;
                stats.avg = stats.sum / stats.count as f64;
                entry.value = value;
                entry.timestamp = Utc::now();
            }
        }
    }

    /// Bump a counter by one.
    pub fn increment_counter(&self, name: &str, labels: HashMap<String, String>, help: &str) {
        self.record(name, MetricKind::Counter, 1.0, labels, help);
    }

    /// Set a gauge.
    pub fn set_gauge(&self, name: &str, value: f64, labels: HashMap<String, String>, help: &str) {
        self.record(name, MetricKind::Gauge, value, labels, help);
    }

    /// Record a histogram observation.
    pub fn observe(&self, name: &str, value: f64, labels: HashMap<String, String>, help: &str) {
        self.record(name, MetricKind::Histogram, value, labels, help);
    }

    /// Every metric, sorted by name for stable output.
    pub fn snapshot(&self) -> Vec<Metric> {
        let mut all: Vec<Metric> = self.metrics.read().values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Metrics sharing a name (across label sets).
    pub fn by_name(&self, name: &str) -> Vec<Metric> {
        self.metrics
            .read()
            .values()
            .filter(|m| m.name == name)
            .cloned()
            .collect()
    }

    /// Process-level stats for the monitoring surface.
    pub fn system_stats(&self) -> serde_json::Value {
        serde_json::json!({
            "uptime_seconds": self.started_at.elapsed().as_secs(),
            "tracked_metrics": self.metrics.read().len(),
            "cpus": std::thread::available_parallelism().map(|n| n.get()).unwrap_or(0),
            "timestamp": Utc::now().to_rfc3339(),
        })
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

fn metric_key(name: &str, labels: &HashMap<String, String>) -> String {
    let mut pairs: Vec<String> = labels.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
    pairs.sort();
    format!("{}{{{}}}", name, pairs.join(","))
}
