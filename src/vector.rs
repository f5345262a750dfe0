//! Vector metrics: families of children sharing a name and a label-name
//! schema, keyed by label-value tuples.
//!
//! Children are internally synchronized so the scrape path can read them
//! while the event-handling worker writes. Counter and gauge children are an
//! f64 stored in an `AtomicU64`; summary and histogram children hold their
//! sketch behind a mutex.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use metrics_util::{Histogram as BucketedHistogram, Summary as QuantileSketch};
use parking_lot::{Mutex, RwLock};

use crate::event::Labels;
use crate::mapper::SummaryObjective;
use crate::registry::{Collector, FamilyKind, MetricFamily, Sample};

/// The canonical default histogram bucket ladder, in seconds.
pub const DEFAULT_BUCKETS: &[f64] =
    &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

const DEFAULT_SKETCH_ERROR: f64 = 0.0001;
const SKETCH_MAX_BUCKETS: u32 = 32_768;
const SKETCH_MIN_VALUE: f64 = 1.0e-9;

fn child_values(label_names: &[String], labels: &Labels) -> Vec<String> {
    label_names.iter().map(|name| labels.get(name).cloned().unwrap_or_default()).collect()
}

fn label_pairs(label_names: &[String], values: &[String]) -> Vec<(String, String)> {
    label_names.iter().cloned().zip(values.iter().cloned()).collect()
}

/// Child storage shared by all four vector kinds.
struct Children<T> {
    map: RwLock<HashMap<Vec<String>, Arc<T>>>,
}

impl<T> Children<T> {
    fn new() -> Children<T> {
        Children { map: RwLock::new(HashMap::new()) }
    }

    fn get_or_create(&self, key: Vec<String>, make: impl FnOnce() -> T) -> Arc<T> {
        if let Some(existing) = self.map.read().get(&key) {
            return existing.clone();
        }
        self.map.write().entry(key).or_insert_with(|| Arc::new(make())).clone()
    }

    fn remove(&self, key: &[String]) -> bool {
        self.map.write().remove(key).is_some()
    }

    fn sorted(&self) -> Vec<(Vec<String>, Arc<T>)> {
        let map = self.map.read();
        let mut entries: Vec<_> = map.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}

/// A single counter child.
pub struct CounterCell {
    bits: AtomicU64,
}

impl CounterCell {
    fn new() -> CounterCell {
        CounterCell { bits: AtomicU64::new(0) }
    }

    /// Adds a delta to the counter. Negative deltas are rejected upstream
    /// and never reach the cell.
    pub fn add(&self, value: f64) {
        let _ = self.bits.fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
            Some((f64::from_bits(bits) + value).to_bits())
        });
    }

    /// The current counter value.
    pub fn get(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Acquire))
    }
}

/// A single gauge child.
#[derive(Debug)]
pub struct GaugeCell {
    bits: AtomicU64,
}

impl GaugeCell {
    fn new() -> GaugeCell {
        GaugeCell { bits: AtomicU64::new(0) }
    }

    /// Replaces the gauge value.
    pub fn set(&self, value: f64) {
        self.bits.store(value.to_bits(), Ordering::Release);
    }

    /// Adjusts the gauge by a (possibly negative) delta.
    pub fn add(&self, value: f64) {
        let _ = self.bits.fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
            Some((f64::from_bits(bits) + value).to_bits())
        });
    }

    /// The current gauge value.
    pub fn get(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Acquire))
    }
}

struct SummaryState {
    sketch: QuantileSketch,
    sum: f64,
    count: u64,
}

impl std::fmt::Debug for SummaryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SummaryState")
            .field("sum", &self.sum)
            .field("count", &self.count)
            .finish()
    }
}

/// A single summary child: a quantile sketch plus the running sum and count
/// the exposition format synthesizes into `_sum`/`_count`.
#[derive(Debug)]
pub struct SummaryCell {
    inner: Mutex<SummaryState>,
}

impl SummaryCell {
    fn new(alpha: f64) -> SummaryCell {
        SummaryCell {
            inner: Mutex::new(SummaryState {
                sketch: QuantileSketch::new(alpha, SKETCH_MAX_BUCKETS, SKETCH_MIN_VALUE),
                sum: 0.0,
                count: 0,
            }),
        }
    }

    /// Records an observation.
    pub fn observe(&self, value: f64) {
        let mut state = self.inner.lock();
        state.sketch.add(value);
        state.sum += value;
        state.count += 1;
    }
}

/// A single histogram child.
pub struct HistogramCell {
    inner: Mutex<BucketedHistogram>,
}

impl HistogramCell {
    fn new(bounds: &[f64]) -> HistogramCell {
        let histogram =
            BucketedHistogram::new(bounds).expect("bucket bounds were already validated");
        HistogramCell { inner: Mutex::new(histogram) }
    }

    /// Records an observation.
    pub fn observe(&self, value: f64) {
        self.inner.lock().record(value);
    }
}

/// A vector of counters.
pub struct CounterVec {
    name: String,
    help: String,
    label_names: Vec<String>,
    children: Children<CounterCell>,
}

impl CounterVec {
    /// Creates a counter vector with the given label dimensions.
    pub fn new(name: impl Into<String>, help: impl Into<String>, label_names: Vec<String>) -> CounterVec {
        CounterVec { name: name.into(), help: help.into(), label_names, children: Children::new() }
    }

    /// Returns the child for the given labels, creating it on first use.
    pub fn with_labels(&self, labels: &Labels) -> Arc<CounterCell> {
        self.children.get_or_create(child_values(&self.label_names, labels), CounterCell::new)
    }

    /// Returns the child for the given label values, positionally matching
    /// the vector's label names.
    pub fn with_label_values(&self, values: &[&str]) -> Arc<CounterCell> {
        let key = values.iter().map(|v| v.to_string()).collect();
        self.children.get_or_create(key, CounterCell::new)
    }

    /// Removes the child for the given labels. The vector itself stays
    /// registered.
    pub fn remove(&self, labels: &Labels) -> bool {
        self.children.remove(&child_values(&self.label_names, labels))
    }
}

impl Collector for CounterVec {
    fn describe(&self) -> Vec<String> {
        vec![self.name.clone()]
    }

    fn collect(&self) -> MetricFamily {
        let samples = self
            .children
            .sorted()
            .into_iter()
            .map(|(values, cell)| Sample {
                suffix: None,
                labels: label_pairs(&self.label_names, &values),
                extra_label: None,
                value: cell.get(),
            })
            .collect();

        MetricFamily {
            name: self.name.clone(),
            help: self.help.clone(),
            kind: FamilyKind::Counter,
            samples,
        }
    }
}

/// A vector of gauges.
pub struct GaugeVec {
    name: String,
    help: String,
    label_names: Vec<String>,
    children: Children<GaugeCell>,
}

impl GaugeVec {
    /// Creates a gauge vector with the given label dimensions.
    pub fn new(name: impl Into<String>, help: impl Into<String>, label_names: Vec<String>) -> GaugeVec {
        GaugeVec { name: name.into(), help: help.into(), label_names, children: Children::new() }
    }

    /// Returns the child for the given labels, creating it on first use.
    pub fn with_labels(&self, labels: &Labels) -> Arc<GaugeCell> {
        self.children.get_or_create(child_values(&self.label_names, labels), GaugeCell::new)
    }

    /// Returns the child for the given label values.
    pub fn with_label_values(&self, values: &[&str]) -> Arc<GaugeCell> {
        let key = values.iter().map(|v| v.to_string()).collect();
        self.children.get_or_create(key, GaugeCell::new)
    }

    /// Removes the child for the given labels.
    pub fn remove(&self, labels: &Labels) -> bool {
        self.children.remove(&child_values(&self.label_names, labels))
    }
}

impl Collector for GaugeVec {
    fn describe(&self) -> Vec<String> {
        vec![self.name.clone()]
    }

    fn collect(&self) -> MetricFamily {
        let samples = self
            .children
            .sorted()
            .into_iter()
            .map(|(values, cell)| Sample {
                suffix: None,
                labels: label_pairs(&self.label_names, &values),
                extra_label: None,
                value: cell.get(),
            })
            .collect();

        MetricFamily {
            name: self.name.clone(),
            help: self.help.clone(),
            kind: FamilyKind::Gauge,
            samples,
        }
    }
}

/// A vector of summaries.
///
/// All children share the vector's objectives. The sketch's relative error
/// is the tightest allowed error across the objectives, since the sketch has
/// a single precision knob.
pub struct SummaryVec {
    name: String,
    help: String,
    label_names: Vec<String>,
    objectives: Vec<SummaryObjective>,
    alpha: f64,
    children: Children<SummaryCell>,
}

impl SummaryVec {
    /// Creates a summary vector with the given label dimensions and
    /// objectives.
    pub fn new(
        name: impl Into<String>,
        help: impl Into<String>,
        label_names: Vec<String>,
        objectives: Vec<SummaryObjective>,
    ) -> SummaryVec {
        let alpha = objectives
            .iter()
            .map(|o| o.error)
            .filter(|e| e.is_finite() && *e > 0.0)
            .fold(DEFAULT_SKETCH_ERROR, f64::min);

        SummaryVec {
            name: name.into(),
            help: help.into(),
            label_names,
            objectives,
            alpha,
            children: Children::new(),
        }
    }

    /// Returns the child for the given labels, creating it on first use.
    pub fn with_labels(&self, labels: &Labels) -> Arc<SummaryCell> {
        let alpha = self.alpha;
        self.children
            .get_or_create(child_values(&self.label_names, labels), || SummaryCell::new(alpha))
    }

    /// Removes the child for the given labels.
    pub fn remove(&self, labels: &Labels) -> bool {
        self.children.remove(&child_values(&self.label_names, labels))
    }
}

impl Collector for SummaryVec {
    fn describe(&self) -> Vec<String> {
        vec![
            self.name.clone(),
            format!("{}_sum", self.name),
            format!("{}_count", self.name),
        ]
    }

    fn collect(&self) -> MetricFamily {
        let mut samples = Vec::new();
        for (values, cell) in self.children.sorted() {
            let labels = label_pairs(&self.label_names, &values);
            let state = cell.inner.lock();

            for objective in &self.objectives {
                samples.push(Sample {
                    suffix: None,
                    labels: labels.clone(),
                    extra_label: Some(("quantile", objective.quantile.to_string())),
                    value: state.sketch.quantile(objective.quantile).unwrap_or(0.0),
                });
            }
            samples.push(Sample {
                suffix: Some("sum"),
                labels: labels.clone(),
                extra_label: None,
                value: state.sum,
            });
            samples.push(Sample {
                suffix: Some("count"),
                labels,
                extra_label: None,
                value: state.count as f64,
            });
        }

        MetricFamily {
            name: self.name.clone(),
            help: self.help.clone(),
            kind: FamilyKind::Summary,
            samples,
        }
    }
}

/// A vector of histograms. All children share the vector's bucket bounds.
pub struct HistogramVec {
    name: String,
    help: String,
    label_names: Vec<String>,
    buckets: Vec<f64>,
    children: Children<HistogramCell>,
}

impl HistogramVec {
    /// Creates a histogram vector with the given label dimensions and bucket
    /// bounds. Empty bounds fall back to [`DEFAULT_BUCKETS`].
    pub fn new(
        name: impl Into<String>,
        help: impl Into<String>,
        label_names: Vec<String>,
        buckets: Vec<f64>,
    ) -> HistogramVec {
        let buckets = if buckets.is_empty() { DEFAULT_BUCKETS.to_vec() } else { buckets };
        HistogramVec {
            name: name.into(),
            help: help.into(),
            label_names,
            buckets,
            children: Children::new(),
        }
    }

    /// Returns the child for the given labels, creating it on first use.
    pub fn with_labels(&self, labels: &Labels) -> Arc<HistogramCell> {
        self.children.get_or_create(child_values(&self.label_names, labels), || {
            HistogramCell::new(&self.buckets)
        })
    }

    /// Removes the child for the given labels.
    pub fn remove(&self, labels: &Labels) -> bool {
        self.children.remove(&child_values(&self.label_names, labels))
    }
}

impl Collector for HistogramVec {
    fn describe(&self) -> Vec<String> {
        vec![
            self.name.clone(),
            format!("{}_bucket", self.name),
            format!("{}_sum", self.name),
            format!("{}_count", self.name),
        ]
    }

    fn collect(&self) -> MetricFamily {
        let mut samples = Vec::new();
        for (values, cell) in self.children.sorted() {
            let labels = label_pairs(&self.label_names, &values);
            let histogram = cell.inner.lock();

            for (le, count) in histogram.buckets() {
                samples.push(Sample {
                    suffix: Some("bucket"),
                    labels: labels.clone(),
                    extra_label: Some(("le", le.to_string())),
                    value: count as f64,
                });
            }
            samples.push(Sample {
                suffix: Some("bucket"),
                labels: labels.clone(),
                extra_label: Some(("le", "+Inf".to_string())),
                value: histogram.count() as f64,
            });
            samples.push(Sample {
                suffix: Some("sum"),
                labels: labels.clone(),
                extra_label: None,
                value: histogram.sum(),
            });
            samples.push(Sample {
                suffix: Some("count"),
                labels,
                extra_label: None,
                value: histogram.count() as f64,
            });
        }

        MetricFamily {
            name: self.name.clone(),
            help: self.help.clone(),
            kind: FamilyKind::Histogram,
            samples,
        }
    }
}
