//! The exposition registry shared between the event-handling worker and the
//! scrape path.

use std::collections::HashSet;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::RwLock;
use thiserror::Error;

use crate::formatting::{write_help_line, write_metric_line, write_type_line};

/// The exposed kind of a metric family.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FamilyKind {
    /// A monotonically increasing counter.
    Counter,
    /// A gauge.
    Gauge,
    /// A quantile summary with `_sum`/`_count` synthetics.
    Summary,
    /// A bucketed histogram with `_bucket`/`_sum`/`_count` synthetics.
    Histogram,
}

impl FamilyKind {
    fn as_str(&self) -> &'static str {
        match self {
            FamilyKind::Counter => "counter",
            FamilyKind::Gauge => "gauge",
            FamilyKind::Summary => "summary",
            FamilyKind::Histogram => "histogram",
        }
    }
}

/// A single sample line within a family.
#[derive(Clone, Debug)]
pub struct Sample {
    /// Name suffix (`sum`, `count`, `bucket`) or `None` for the base name.
    pub suffix: Option<&'static str>,
    /// Label pairs, sorted by label name.
    pub labels: Vec<(String, String)>,
    /// Kind-specific label (`le`, `quantile`) with a pre-formatted value.
    pub extra_label: Option<(&'static str, String)>,
    /// The sample value.
    pub value: f64,
}

/// Everything a collector exposes for one metric name.
#[derive(Clone, Debug)]
pub struct MetricFamily {
    /// The exposed metric name.
    pub name: String,
    /// Help text for the `# HELP` line.
    pub help: String,
    /// The exposed kind.
    pub kind: FamilyKind,
    /// The family's samples.
    pub samples: Vec<Sample>,
}

/// A source of samples for the scrape path.
///
/// `describe` returns the metric names the collector claims for
/// duplicate-registration checks; an empty claim set opts out of the check
/// entirely, which is how multiple vectors sharing one logical name (with
/// different label-name sets) coexist in a single registry.
pub trait Collector: Send + Sync {
    /// The metric names claimed by this collector.
    fn describe(&self) -> Vec<String>;

    /// Collects the current samples.
    fn collect(&self) -> MetricFamily;
}

/// Wraps a collector so its `describe` claims nothing.
///
/// Registration through `Unchecked` trades duplicate-registration protection
/// for label-set flexibility: vectors that share a name but differ in their
/// label dimensions can all be registered.
pub struct Unchecked<C> {
    inner: Arc<C>,
}

impl<C> Unchecked<C> {
    /// Wraps a collector.
    pub fn new(inner: Arc<C>) -> Unchecked<C> {
        Unchecked { inner }
    }
}

impl<C: Collector> Collector for Unchecked<C> {
    fn describe(&self) -> Vec<String> {
        Vec::new()
    }

    fn collect(&self) -> MetricFamily {
        self.inner.collect()
    }
}

/// Errors registering a collector.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum RegistryError {
    /// A checked collector claimed a name that is already taken.
    #[error("metric with name {0} is already registered")]
    AlreadyRegistered(String),
}

#[derive(Default)]
struct Inner {
    collectors: Vec<Arc<dyn Collector>>,
    claimed: HashSet<String>,
}

/// The registry the scrape endpoint renders from.
///
/// Registration happens on the worker side as vectors come into existence;
/// rendering happens on the scrape side. The registry itself is only a list
/// of collectors plus the claimed-name set, so the lock is held briefly on
/// both paths and the samples themselves are read through the collectors'
/// own synchronization.
#[derive(Default)]
pub struct Registry {
    inner: RwLock<Inner>,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Registry {
        Registry::default()
    }

    /// Registers a collector.
    ///
    /// Collectors with a non-empty claim set are checked against all names
    /// claimed so far; a clash fails with
    /// [`RegistryError::AlreadyRegistered`] and registers nothing.
    pub fn register(&self, collector: Arc<dyn Collector>) -> Result<(), RegistryError> {
        let claims = collector.describe();

        let mut inner = self.inner.write();
        for name in &claims {
            if inner.claimed.contains(name) {
                return Err(RegistryError::AlreadyRegistered(name.clone()));
            }
        }
        for name in claims {
            inner.claimed.insert(name);
        }
        inner.collectors.push(collector);
        Ok(())
    }

    /// Renders all live samples in the Prometheus text exposition format.
    ///
    /// Families are merged by name, so multiple vectors sharing a logical
    /// name render under a single `# HELP`/`# TYPE` header; the first
    /// registered vector's help text and kind win. Families without samples
    /// are omitted.
    pub fn render(&self) -> String {
        let collectors = self.inner.read().collectors.clone();

        let mut families: IndexMap<String, MetricFamily> = IndexMap::new();
        for collector in collectors {
            let family = collector.collect();
            match families.get_mut(&family.name) {
                Some(merged) => merged.samples.extend(family.samples),
                None => {
                    families.insert(family.name.clone(), family);
                }
            }
        }

        let mut output = String::new();
        for (_, family) in &families {
            if family.samples.is_empty() {
                continue;
            }

            write_help_line(&mut output, &family.name, &family.help);
            write_type_line(&mut output, &family.name, family.kind.as_str());
            for sample in &family.samples {
                write_metric_line(
                    &mut output,
                    &family.name,
                    sample.suffix,
                    &sample.labels,
                    sample.extra_label.as_ref().map(|(k, v)| (*k, v.as_str())),
                    sample.value,
                );
            }
            output.push('\n');
        }

        output
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{Collector, FamilyKind, MetricFamily, Registry, RegistryError, Sample, Unchecked};

    struct FixedCollector {
        name: String,
        value: f64,
    }

    impl Collector for FixedCollector {
        fn describe(&self) -> Vec<String> {
            vec![self.name.clone()]
        }

        fn collect(&self) -> MetricFamily {
            MetricFamily {
                name: self.name.clone(),
                help: "help".to_string(),
                kind: FamilyKind::Counter,
                samples: vec![Sample {
                    suffix: None,
                    labels: Vec::new(),
                    extra_label: None,
                    value: self.value,
                }],
            }
        }
    }

    #[test]
    fn test_checked_registration_rejects_duplicates() {
        let registry = Registry::new();
        let first = Arc::new(FixedCollector { name: "foo".to_string(), value: 1.0 });
        let second = Arc::new(FixedCollector { name: "foo".to_string(), value: 2.0 });

        assert!(registry.register(first).is_ok());
        assert_eq!(
            registry.register(second).unwrap_err(),
            RegistryError::AlreadyRegistered("foo".to_string())
        );
    }

    #[test]
    fn test_unchecked_registration_allows_shared_names() {
        let registry = Registry::new();
        let first = Arc::new(FixedCollector { name: "foo".to_string(), value: 1.0 });
        let second = Arc::new(FixedCollector { name: "foo".to_string(), value: 2.0 });

        registry.register(Arc::new(Unchecked::new(first))).unwrap();
        registry.register(Arc::new(Unchecked::new(second))).unwrap();

        let output = registry.render();
        assert!(output.contains("foo 1\n"));
        assert!(output.contains("foo 2\n"));
        // One header for the merged family.
        assert_eq!(output.matches("# TYPE foo counter").count(), 1);
    }

    #[test]
    fn test_empty_families_are_omitted() {
        struct EmptyCollector;
        impl Collector for EmptyCollector {
            fn describe(&self) -> Vec<String> {
                vec!["empty".to_string()]
            }
            fn collect(&self) -> MetricFamily {
                MetricFamily {
                    name: "empty".to_string(),
                    help: "help".to_string(),
                    kind: FamilyKind::Gauge,
                    samples: Vec::new(),
                }
            }
        }

        let registry = Registry::new();
        registry.register(Arc::new(EmptyCollector)).unwrap();
        assert_eq!(registry.render(), "");
    }
}
