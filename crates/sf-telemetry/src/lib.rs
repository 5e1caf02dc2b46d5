// SPDX-License-Identifier: MIT OR Apache-2.0
//! Structured telemetry and metrics collection for skillforge runs.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::info;

// ---------------------------------------------------------------------------
// RunMetrics
// ---------------------------------------------------------------------------

/// Metrics captured for a single run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RunMetrics {
    /// Tenant the run belongs to.
    pub tenant_id: String,
    /// Name of the workflow executed.
    pub workflow_name: String,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
    /// Total number of steps executed.
    pub steps_count: u64,
    /// Number of steps satisfied from the step cache.
    pub cache_hits_count: u64,
    /// Number of retry attempts across all steps.
    pub retries_count: u64,
    /// Number of steps that terminated in failure.
    pub errors_count: u64,
    /// Number of steps skipped due to an upstream failure.
    pub skipped_count: u64,
}

// ---------------------------------------------------------------------------
// MetricsSummary
// ---------------------------------------------------------------------------

/// Aggregated statistics across multiple runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricsSummary {
    /// Number of runs recorded.
    pub count: usize,
    /// Mean duration in milliseconds.
    pub mean_duration_ms: f64,
    /// Median (p50) duration in milliseconds.
    pub p50_duration_ms: f64,
    /// 99th-percentile duration in milliseconds.
    pub p99_duration_ms: f64,
    /// Fraction of steps satisfied from cache across all runs.
    pub cache_hit_rate: f64,
    /// Error rate (runs with at least one failed step / total runs).
    pub error_rate: f64,
    /// Per-workflow run counts (deterministic ordering).
    pub workflow_counts: BTreeMap<String, usize>,
}

impl Default for MetricsSummary {
    fn default() -> Self {
        Self {
            count: 0,
            mean_duration_ms: 0.0,
            p50_duration_ms: 0.0,
            p99_duration_ms: 0.0,
            cache_hit_rate: 0.0,
            error_rate: 0.0,
            workflow_counts: BTreeMap::new(),
        }
    }
}

/// Compute a percentile value from a **sorted** slice.
fn percentile(sorted: &[u64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    if sorted.len() == 1 {
        return sorted[0] as f64;
    }
    let rank = pct / 100.0 * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let frac = rank - lower as f64;
    sorted[lower] as f64 * (1.0 - frac) + sorted[upper] as f64 * frac
}

// ---------------------------------------------------------------------------
// MetricsCollector
// ---------------------------------------------------------------------------

/// Thread-safe collector for run metrics.
///
/// Wrap in an `Arc` to share across tasks (the inner storage is already
/// behind a `Mutex`).
#[derive(Debug, Clone)]
pub struct MetricsCollector {
    inner: Arc<Mutex<Vec<RunMetrics>>>,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    /// Create a new, empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Record a completed run's metrics.
    pub fn record(&self, metrics: RunMetrics) {
        let mut data = self.inner.lock().expect("metrics lock poisoned");
        data.push(metrics);
    }

    /// Return all recorded run metrics.
    #[must_use]
    pub fn runs(&self) -> Vec<RunMetrics> {
        let data = self.inner.lock().expect("metrics lock poisoned");
        data.clone()
    }

    /// Number of runs recorded so far.
    #[must_use]
    pub fn len(&self) -> usize {
        let data = self.inner.lock().expect("metrics lock poisoned");
        data.len()
    }

    /// Whether the collector has no recorded runs.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Compute an aggregated summary of all recorded runs.
    #[must_use]
    pub fn summary(&self) -> MetricsSummary {
        let data = self.inner.lock().expect("metrics lock poisoned");
        if data.is_empty() {
            return MetricsSummary::default();
        }

        let count = data.len();
        let mut durations: Vec<u64> = data.iter().map(|r| r.duration_ms).collect();
        durations.sort_unstable();

        let total_duration: u64 = durations.iter().sum();
        let mean_duration_ms = total_duration as f64 / count as f64;
        let p50_duration_ms = percentile(&durations, 50.0);
        let p99_duration_ms = percentile(&durations, 99.0);

        let total_steps: u64 = data.iter().map(|r| r.steps_count).sum();
        let total_cache_hits: u64 = data.iter().map(|r| r.cache_hits_count).sum();
        let cache_hit_rate = if total_steps == 0 {
            0.0
        } else {
            total_cache_hits as f64 / total_steps as f64
        };

        let runs_with_errors = data.iter().filter(|r| r.errors_count > 0).count();
        let error_rate = runs_with_errors as f64 / count as f64;

        let mut workflow_counts: BTreeMap<String, usize> = BTreeMap::new();
        for r in data.iter() {
            *workflow_counts.entry(r.workflow_name.clone()).or_insert(0) += 1;
        }

        MetricsSummary {
            count,
            mean_duration_ms,
            p50_duration_ms,
            p99_duration_ms,
            cache_hit_rate,
            error_rate,
            workflow_counts,
        }
    }

    /// Clear all recorded metrics.
    pub fn clear(&self) {
        let mut data = self.inner.lock().expect("metrics lock poisoned");
        data.clear();
    }
}

// ---------------------------------------------------------------------------
// TelemetrySpan
// ---------------------------------------------------------------------------

/// A structured span for tracing integration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetrySpan {
    /// Span name / operation.
    pub name: String,
    /// Arbitrary key-value attributes (deterministic ordering).
    pub attributes: BTreeMap<String, String>,
}

impl TelemetrySpan {
    /// Create a new span with the given name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: BTreeMap::new(),
        }
    }

    /// Insert an attribute.
    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Emit the span via `tracing::info!`.
    pub fn emit(&self) {
        info!(
            span_name = %self.name,
            attributes = ?self.attributes,
            "telemetry_span"
        );
    }
}

// ---------------------------------------------------------------------------
// TelemetryExporter
// ---------------------------------------------------------------------------

/// Trait for exporting collected metrics.
pub trait TelemetryExporter: Send + Sync {
    /// Export the given summary. Returns the serialized output on success.
    fn export(&self, summary: &MetricsSummary) -> Result<String, String>;
}

/// Exports metrics as pretty-printed JSON to a string.
#[derive(Debug, Default)]
pub struct JsonExporter;

impl TelemetryExporter for JsonExporter {
    fn export(&self, summary: &MetricsSummary) -> Result<String, String> {
        serde_json::to_string_pretty(summary).map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(workflow: &str, duration_ms: u64, errors: u64) -> RunMetrics {
        RunMetrics {
            tenant_id: "acme".into(),
            workflow_name: workflow.into(),
            duration_ms,
            steps_count: 10,
            cache_hits_count: 3,
            retries_count: 1,
            errors_count: errors,
            skipped_count: 0,
        }
    }

    #[test]
    fn empty_collector_has_zeroed_summary() {
        let collector = MetricsCollector::new();
        assert!(collector.is_empty());
        let summary = collector.summary();
        assert_eq!(summary.count, 0);
        assert_eq!(summary.mean_duration_ms, 0.0);
    }

    #[test]
    fn records_accumulate() {
        let collector = MetricsCollector::new();
        collector.record(sample("launch-campaign", 100, 0));
        collector.record(sample("launch-campaign", 200, 1));
        assert_eq!(collector.len(), 2);
        assert_eq!(collector.runs().len(), 2);
    }

    #[test]
    fn summary_computes_percentiles_and_rates() {
        let collector = MetricsCollector::new();
        collector.record(sample("a", 100, 0));
        collector.record(sample("a", 200, 1));
        collector.record(sample("b", 300, 0));

        let summary = collector.summary();
        assert_eq!(summary.count, 3);
        assert_eq!(summary.mean_duration_ms, 200.0);
        assert_eq!(summary.p50_duration_ms, 200.0);
        assert!((summary.error_rate - (1.0 / 3.0)).abs() < 1e-9);
        assert_eq!(summary.cache_hit_rate, 0.3);
        assert_eq!(summary.workflow_counts.get("a"), Some(&2));
        assert_eq!(summary.workflow_counts.get("b"), Some(&1));
    }

    #[test]
    fn clear_resets_collector() {
        let collector = MetricsCollector::new();
        collector.record(sample("a", 100, 0));
        collector.clear();
        assert!(collector.is_empty());
    }

    #[test]
    fn json_exporter_round_trips() {
        let collector = MetricsCollector::new();
        collector.record(sample("a", 100, 0));
        let summary = collector.summary();
        let exported = JsonExporter.export(&summary).expect("export should succeed");
        let parsed: MetricsSummary = serde_json::from_str(&exported).expect("valid json");
        assert_eq!(parsed, summary);
    }

    #[test]
    fn telemetry_span_builder() {
        let span = TelemetrySpan::new("step.execute")
            .with_attribute("skill", "generate-image")
            .with_attribute("tenant", "acme");
        assert_eq!(span.name, "step.execute");
        assert_eq!(span.attributes.get("skill"), Some(&"generate-image".to_string()));
    }
}
