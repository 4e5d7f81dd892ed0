//! Labeled metric registry with Prometheus text exposition (C1).
//!
//! Series are keyed by `(name, label-set)`, not by name alone — two calls
//! with the same metric name but different labels render as distinct
//! series sharing one `HELP`/`TYPE` pair.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use parking_lot::RwLock;
use thiserror::Error;

/// Default histogram bucket boundaries, matching Prometheus client defaults.
pub const DEFAULT_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

#[derive(Debug, Error)]
pub enum MetricError {
    #[error("counter {0} cannot be decremented by a negative delta")]
    NegativeIncrement(String),
    #[error("metric {name} already registered as {existing:?}, cannot reuse as {requested:?}")]
    KindMismatch {
        name: String,
        existing: MetricKind,
        requested: MetricKind,
    },
}

pub type MetricResult<T> = Result<T, MetricError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
}

impl MetricKind {
    fn prometheus_type(&self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
            MetricKind::Histogram => "histogram",
        }
    }
}

/// An unordered label set; serialized in sorted key order for stable series
/// identity and exposition output.
pub type Labels = BTreeMap<String, String>;

fn labels_key(labels: &Labels) -> Vec<(String, String)> {
    labels.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
}

#[derive(Debug, Clone, Default)]
struct HistogramState {
    bucket_bounds: Vec<f64>,
    bucket_counts: Vec<u64>,
    sum: f64,
    count: u64,
}

impl HistogramState {
    fn new(bounds: Vec<f64>) -> Self {
        let len = bounds.len();
        Self {
            bucket_bounds: bounds,
            bucket_counts: vec![0; len],
            sum: 0.0,
            count: 0,
        }
    }

    fn observe(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
        for (bound, count) in self.bucket_bounds.iter().zip(self.bucket_counts.iter_mut()) {
            if value <= *bound {
                *count += 1;
            }
        }
    }
}

#[derive(Debug, Clone)]
enum MetricValue {
    Counter(f64),
    Gauge { value: f64, set_at: u64 },
    Histogram(HistogramState),
}

struct MetricDef {
    kind: MetricKind,
    help: String,
}

/// A series key: metric name plus its sorted label set.
type SeriesKey = (String, Vec<(String, String)>);

/// Labeled counter/gauge/histogram registry with Prometheus exposition.
///
/// Write-heavy paths lock at the (name, label-set) granularity via
/// `DashMap`; reads for exposition take a consistent snapshot iteration.
pub struct MetricRegistry {
    definitions: Arc<DashMap<String, MetricDef>>,
    series: Arc<DashMap<SeriesKey, MetricValue>>,
    default_labels: Arc<RwLock<Labels>>,
}

impl MetricRegistry {
    pub fn new() -> Self {
        Self {
            definitions: Arc::new(DashMap::new()),
            series: Arc::new(DashMap::new()),
            default_labels: Arc::new(RwLock::new(Labels::new())),
        }
    }

    /// Labels merged into every series at exposition time (e.g. `service`,
    /// `env`).
    pub fn set_default_labels(&self, labels: Labels) {
        *self.default_labels.write() = labels;
    }

    fn define(&self, name: &str, kind: MetricKind, help: &str) -> MetricResult<()> {
        if let Some(existing) = self.definitions.get(name) {
            if existing.kind != kind {
                return Err(MetricError::KindMismatch {
                    name: name.to_string(),
                    existing: existing.kind,
                    requested: kind,
                });
            }
            return Ok(());
        }
        self.definitions.insert(
            name.to_string(),
            MetricDef {
                kind,
                help: help.to_string(),
            },
        );
        Ok(())
    }

    /// Register (or reuse) help text for a metric name without recording a
    /// value — useful when `# HELP` must exist even before first use.
    pub fn register_help(&self, name: &str, kind: MetricKind, help: &str) -> MetricResult<()> {
        self.define(name, kind, help)
    }

    /// Increment a monotonic counter. Negative deltas are rejected.
    pub fn increment(&self, name: &str, value: f64, labels: Labels) -> MetricResult<()> {
        if value < 0.0 {
            return Err(MetricError::NegativeIncrement(name.to_string()));
        }
        self.define(name, MetricKind::Counter, "")?;

        let key = (name.to_string(), labels_key(&labels));
        self.series
            .entry(key)
            .and_modify(|v| {
                if let MetricValue::Counter(c) = v {
                    *c += value;
                }
            })
            .or_insert(MetricValue::Counter(value));
        Ok(())
    }

    /// Last-write-wins gauge update.
    pub fn set_gauge(&self, name: &str, value: f64, labels: Labels) -> MetricResult<()> {
        self.define(name, MetricKind::Gauge, "")?;

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        let key = (name.to_string(), labels_key(&labels));
        self.series
            .insert(key, MetricValue::Gauge { value, set_at: now });
        Ok(())
    }

    /// Observe a value into a histogram, updating `count`, `sum`, and every
    /// bucket whose boundary is `>=` the value.
    pub fn observe(&self, name: &str, value: f64, labels: Labels) -> MetricResult<()> {
        self.observe_with_buckets(name, value, labels, DEFAULT_BUCKETS.to_vec())
    }

    pub fn observe_with_buckets(
        &self,
        name: &str,
        value: f64,
        labels: Labels,
        buckets: Vec<f64>,
    ) -> MetricResult<()> {
        self.define(name, MetricKind::Histogram, "")?;

        let key = (name.to_string(), labels_key(&labels));
        self.series
            .entry(key)
            .and_modify(|v| {
                if let MetricValue::Histogram(h) = v {
                    h.observe(value);
                }
            })
            .or_insert_with(|| {
                let mut h = HistogramState::new(buckets);
                h.observe(value);
                MetricValue::Histogram(h)
            });
        Ok(())
    }

    /// Render the registry in Prometheus text exposition format
    /// (`Content-Type: text/plain; version=0.0.4`).
    pub fn prometheus_export(&self) -> String {
        let default_labels = self.default_labels.read().clone();
        let mut out = String::new();

        for def_entry in self.definitions.iter() {
            let name = def_entry.key();
            let def = def_entry.value();

            out.push_str(&format!("# HELP {} {}\n", name, def.help));
            out.push_str(&format!("# TYPE {} {}\n", name, def.kind.prometheus_type()));

            for series_entry in self.series.iter() {
                let (series_name, label_pairs) = series_entry.key();
                if series_name != name {
                    continue;
                }

                let mut merged: Labels = default_labels.clone();
                for (k, v) in label_pairs {
                    merged.insert(k.clone(), v.clone());
                }
                let label_str = render_labels(&merged);

                match series_entry.value() {
                    MetricValue::Counter(v) => {
                        out.push_str(&format!("{}{} {}\n", name, label_str, v));
                    }
                    MetricValue::Gauge { value, .. } => {
                        out.push_str(&format!("{}{} {}\n", name, label_str, value));
                    }
                    MetricValue::Histogram(h) => {
                        let mut cumulative = 0u64;
                        for (bound, count) in h.bucket_bounds.iter().zip(h.bucket_counts.iter()) {
                            cumulative = cumulative.max(*count);
                            let bucket_labels = with_label(&merged, "le", &format_bound(*bound));
                            out.push_str(&format!(
                                "{}_bucket{} {}\n",
                                name,
                                render_labels(&bucket_labels),
                                cumulative
                            ));
                        }
                        let inf_labels = with_label(&merged, "le", "+Inf");
                        out.push_str(&format!(
                            "{}_bucket{} {}\n",
                            name,
                            render_labels(&inf_labels),
                            h.count
                        ));
                        out.push_str(&format!("{}_sum{} {}\n", name, label_str, h.sum));
                        out.push_str(&format!("{}_count{} {}\n", name, label_str, h.count));
                    }
                }
            }
        }

        out
    }
}

impl Default for MetricRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn with_label(base: &Labels, key: &str, value: &str) -> Labels {
    let mut out = base.clone();
    out.insert(key.to_string(), value.to_string());
    out
}

fn format_bound(bound: f64) -> String {
    format!("{}", bound)
}

fn render_labels(labels: &Labels) -> String {
    if labels.is_empty() {
        return String::new();
    }
    let body: Vec<String> = labels
        .iter()
        .map(|(k, v)| format!("{}=\"{}\"", k, v))
        .collect();
    format!("{{{}}}", body.join(","))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> Labels {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn distinct_label_sets_produce_distinct_series() {
        let registry = MetricRegistry::new();
        registry
            .increment("http_requests", 1.0, labels(&[("method", "GET")]))
            .unwrap();
        registry
            .increment("http_requests", 1.0, labels(&[("method", "POST")]))
            .unwrap();

        let export = registry.prometheus_export();
        assert!(export.contains("http_requests{method=\"GET\"} 1"));
        assert!(export.contains("http_requests{method=\"POST\"} 1"));
        assert_eq!(export.matches("# HELP http_requests").count(), 1);
        assert_eq!(export.matches("# TYPE http_requests").count(), 1);
    }

    #[test]
    fn negative_increment_rejected() {
        let registry = MetricRegistry::new();
        let err = registry.increment("c", -1.0, Labels::new());
        assert!(err.is_err());
    }

    #[test]
    fn gauge_last_write_wins() {
        let registry = MetricRegistry::new();
        registry.set_gauge("g", 1.0, Labels::new()).unwrap();
        registry.set_gauge("g", 5.0, Labels::new()).unwrap();

        let export = registry.prometheus_export();
        assert!(export.contains("g 5"));
        assert!(!export.contains("g 1\n"));
    }

    #[test]
    fn histogram_buckets_are_monotone_and_bounded_by_count() {
        let registry = MetricRegistry::new();
        for v in [0.001, 0.02, 0.3, 3.0, 20.0] {
            registry.observe("h", v, Labels::new()).unwrap();
        }

        let export = registry.prometheus_export();
        let bucket_lines: Vec<u64> = export
            .lines()
            .filter(|l| l.starts_with("h_bucket"))
            .map(|l| l.rsplit(' ').next().unwrap().parse().unwrap())
            .collect();

        for pair in bucket_lines.windows(2) {
            assert!(pair[0] <= pair[1]);
        }
        assert_eq!(*bucket_lines.last().unwrap(), 5);
    }

    #[test]
    fn default_labels_merge_into_every_series() {
        let registry = MetricRegistry::new();
        registry.set_default_labels(labels(&[("service", "engines")]));
        registry.increment("c", 1.0, Labels::new()).unwrap();

        let export = registry.prometheus_export();
        assert!(export.contains("c{service=\"engines\"} 1"));
    }
}
