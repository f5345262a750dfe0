//! The label-value index: the authority on which series are alive, what
//! kind they are, and when they expire.

use std::collections::HashMap;
use std::hash::Hasher;
use std::time::Duration;

use fnv::FnvHasher;
use quanta::Instant;

use crate::containers::MetricChecker;
use crate::event::Labels;

/// The exposition-side kind of a registered series.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum MetricKind {
    /// Counter kind.
    Counter,
    /// Gauge kind.
    Gauge,
    /// Summary kind.
    Summary,
    /// Histogram kind.
    Histogram,
}

impl MetricKind {
    /// The `type` label value for per-kind gauges.
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
            MetricKind::Summary => "summary",
            MetricKind::Histogram => "histogram",
        }
    }
}

// Separates name and label fragments in the hashed byte sequence so that
// ("ab", "c") and ("a", "bc") cannot collide.
const SEPARATOR: u8 = 0xff;

/// Hashes a series identity: FNV-1a/64 over the name and every label pair,
/// label names iterated in the caller-provided (sorted) order.
///
/// The scratch buffer is caller-owned and reused across calls to avoid
/// per-event allocation; the index's mutating operations are serialized on
/// the worker, so a single buffer suffices.
pub fn hash_name_and_labels(
    buf: &mut Vec<u8>,
    name: &str,
    label_names: &[String],
    labels: &Labels,
) -> u64 {
    buf.clear();
    buf.extend_from_slice(name.as_bytes());
    buf.push(SEPARATOR);

    for label_name in label_names {
        buf.extend_from_slice(label_name.as_bytes());
        buf.push(SEPARATOR);
        if let Some(value) = labels.get(label_name) {
            buf.extend_from_slice(value.as_bytes());
        }
        buf.push(SEPARATOR);
    }

    let mut hasher = FnvHasher::default();
    hasher.write(buf);
    hasher.finish()
}

/// The descriptor tracked for every live series.
#[derive(Clone, Debug)]
pub struct LabelValues {
    /// The series' label values.
    pub labels: Labels,
    /// The kind the series was created as. All descriptors under one name
    /// share it.
    pub kind: MetricKind,
    /// Inactivity window; zero means never expire.
    pub ttl: Duration,
    /// When the series was last observed.
    pub last_registered_at: Instant,
}

/// A two-level table, metric name to identity hash to descriptor, tracking
/// recency and TTL for every active series, and the authority for
/// type-conflict decisions.
#[derive(Default)]
pub struct LabelIndex {
    entries: HashMap<String, HashMap<u64, LabelValues>>,
    hash_buf: Vec<u8>,
}

impl LabelIndex {
    /// Creates an empty index.
    pub fn new() -> LabelIndex {
        LabelIndex::default()
    }

    /// Inserts or refreshes the descriptor for a series identity.
    ///
    /// `last_registered_at` is always advanced to `now`, and the TTL is
    /// overwritten with the mapping's current value: the TTL may change over
    /// a series' life, and the last write wins.
    pub fn save(
        &mut self,
        name: &str,
        kind: MetricKind,
        label_names: &[String],
        labels: &Labels,
        ttl: Duration,
        now: Instant,
    ) {
        let hash = hash_name_and_labels(&mut self.hash_buf, name, label_names, labels);
        let by_hash = self.entries.entry(name.to_string()).or_default();
        let descriptor = by_hash.entry(hash).or_insert_with(|| LabelValues {
            labels: labels.clone(),
            kind,
            ttl,
            last_registered_at: now,
        });
        descriptor.last_registered_at = now;
        descriptor.ttl = ttl;
    }

    /// Removes every descriptor whose TTL has lapsed at `now` and returns
    /// them, paired with their metric name, so the caller can cascade the
    /// deletes into the containers.
    ///
    /// A name whose last descriptor expires is dropped from the index
    /// entirely, so the name reads as absent afterwards and a later
    /// observation with any label set starts fresh.
    pub fn take_expired(&mut self, now: Instant) -> Vec<(String, LabelValues)> {
        let mut expired = Vec::new();

        for (name, by_hash) in &mut self.entries {
            by_hash.retain(|_, descriptor| {
                if descriptor.ttl == Duration::ZERO {
                    return true;
                }
                if descriptor.last_registered_at + descriptor.ttl < now {
                    expired.push((name.clone(), descriptor.clone()));
                    false
                } else {
                    true
                }
            });
        }
        self.entries.retain(|_, by_hash| !by_hash.is_empty());

        expired
    }

    /// The number of live descriptors across all names.
    pub fn len(&self) -> usize {
        self.entries.values().map(HashMap::len).sum()
    }

    /// Whether the index holds no descriptors at all.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl MetricChecker for LabelIndex {
    fn metric_conflicts(&self, name: &str, kind: MetricKind) -> bool {
        match self.entries.get(name) {
            // No series with this name exists.
            None => false,
            // All descriptors under one name share a kind, so inspecting any
            // one of them answers the question.
            Some(by_hash) => match by_hash.values().next() {
                Some(descriptor) => descriptor.kind != kind,
                None => false,
            },
        }
    }
}
