//! Metrics port for the hook engine.
//!
//! The engine reports counters and durations through `MetricsSink`; storage
//! is up to the implementation. The engine discards observations unless a
//! sink is attached; `InMemoryMetrics` aggregates them per series.

use dashmap::DashMap;

pub const HOOK_EXECUTIONS_TOTAL: &str = "hook_executions_total";
pub const HOOK_ERRORS_TOTAL: &str = "hook_errors_total";
pub const HOOK_TIMEOUTS_TOTAL: &str = "hook_timeouts_total";
pub const HOOK_BUDGET_REJECTIONS_TOTAL: &str = "hook_budget_rejections_total";
pub const HOOK_DURATION_MS: &str = "hook_duration_ms";

/// Receives metric observations.
pub trait MetricsSink: Send + Sync {
    /// Record one observation of `value` for the series `name` + `labels`.
    fn record(&self, name: &str, labels: &[(&str, &str)], value: f64);
}

/// Discards every observation.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record(&self, _name: &str, _labels: &[(&str, &str)], _value: f64) {}
}

/// Aggregate of one metric series.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricSeries {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
}

impl MetricSeries {
    fn new(value: f64) -> Self {
        Self {
            count: 1,
            sum: value,
            min: value,
            max: value,
        }
    }

    fn observe(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

type SeriesKey = (String, Vec<(String, String)>);

fn series_key(name: &str, labels: &[(&str, &str)]) -> SeriesKey {
    let mut labels: Vec<(String, String)> = labels
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    labels.sort();
    (name.to_string(), labels)
}

/// In-process metric aggregation keyed by name and sorted label set.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    series: DashMap<SeriesKey, MetricSeries>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Aggregate for an exact series. Label order does not matter.
    pub fn series(&self, name: &str, labels: &[(&str, &str)]) -> Option<MetricSeries> {
        self.series.get(&series_key(name, labels)).map(|s| *s)
    }

    /// Sum of observations across every label set of `name`.
    pub fn total(&self, name: &str) -> f64 {
        self.series
            .iter()
            .filter(|entry| entry.key().0 == name)
            .map(|entry| entry.value().sum)
            .sum()
    }

    /// Observation count across every label set of `name`.
    pub fn count(&self, name: &str) -> u64 {
        self.series
            .iter()
            .filter(|entry| entry.key().0 == name)
            .map(|entry| entry.value().count)
            .sum()
    }
}

impl MetricsSink for InMemoryMetrics {
    fn record(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        self.series
            .entry(series_key(name, labels))
            .and_modify(|s| s.observe(value))
            .or_insert_with(|| MetricSeries::new(value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_and_aggregates_series() {
        let metrics = InMemoryMetrics::new();
        let labels = [("hook", "audit"), ("status", "success")];
        metrics.record(HOOK_DURATION_MS, &labels, 10.0);
        metrics.record(HOOK_DURATION_MS, &labels, 30.0);

        let series = metrics.series(HOOK_DURATION_MS, &labels).unwrap();
        assert_eq!(series.count, 2);
        assert_eq!(series.sum, 40.0);
        assert_eq!(series.min, 10.0);
        assert_eq!(series.max, 30.0);
        assert_eq!(series.mean(), 20.0);
    }

    #[test]
    fn test_label_order_is_irrelevant() {
        let metrics = InMemoryMetrics::new();
        metrics.record(HOOK_EXECUTIONS_TOTAL, &[("a", "1"), ("b", "2")], 1.0);
        assert!(metrics
            .series(HOOK_EXECUTIONS_TOTAL, &[("b", "2"), ("a", "1")])
            .is_some());
    }

    #[test]
    fn test_totals_span_label_sets() {
        let metrics = InMemoryMetrics::new();
        metrics.record(HOOK_EXECUTIONS_TOTAL, &[("hook", "a")], 1.0);
        metrics.record(HOOK_EXECUTIONS_TOTAL, &[("hook", "b")], 1.0);
        metrics.record(HOOK_ERRORS_TOTAL, &[("hook", "b")], 1.0);

        assert_eq!(metrics.total(HOOK_EXECUTIONS_TOTAL), 2.0);
        assert_eq!(metrics.count(HOOK_EXECUTIONS_TOTAL), 2);
        assert_eq!(metrics.count(HOOK_TIMEOUTS_TOTAL), 0);
    }

    #[test]
    fn test_noop_sink_accepts_anything() {
        NoopMetrics.record(HOOK_DURATION_MS, &[], 1.0);
    }
}
