//! The four typed containers owning the live vector metrics.
//!
//! Containers are keyed by `name,label1,label2,…` so two vectors sharing a
//! name but differing in label dimensions are distinct entries. Each vector
//! is registered with the exposition registry exactly once, behind the
//! unchecked wrapper, when its key is first used.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use crate::event::Labels;
use crate::index::MetricKind;
use crate::mapper::{MapperDefaults, MetricMapping, SummaryObjective};
use crate::registry::{Registry, RegistryError, Unchecked};
use crate::telemetry::Telemetry;
use crate::vector::{
    CounterCell, CounterVec, GaugeCell, GaugeVec, HistogramCell, HistogramVec, SummaryCell,
    SummaryVec, DEFAULT_BUCKETS,
};

/// The summary objectives used when neither the mapping nor the mapper
/// defaults specify any.
const FALLBACK_OBJECTIVES: [SummaryObjective; 3] = [
    SummaryObjective { quantile: 0.5, error: 0.05 },
    SummaryObjective { quantile: 0.9, error: 0.01 },
    SummaryObjective { quantile: 0.99, error: 0.001 },
];

/// Answers whether a metric name is already in use as a different kind.
pub trait MetricChecker {
    /// `false` when the name is unknown or already lives as `kind`; `true`
    /// when it lives as any other kind.
    fn metric_conflicts(&self, name: &str, kind: MetricKind) -> bool;
}

/// Errors creating a container entry.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ContainerError {
    /// The name is already registered as a different kind, or the registry
    /// rejected the vector.
    #[error("metric with name {0} is already registered")]
    Conflict(String),
}

impl From<RegistryError> for ContainerError {
    fn from(err: RegistryError) -> ContainerError {
        match err {
            RegistryError::AlreadyRegistered(name) => ContainerError::Conflict(name),
        }
    }
}

fn container_key(name: &str, label_names: &[String]) -> String {
    format!("{},{}", name, label_names.join(","))
}

/// The counter container.
pub struct CounterContainer {
    elements: HashMap<String, Arc<CounterVec>>,
    registry: Arc<Registry>,
    telemetry: Arc<Telemetry>,
}

impl CounterContainer {
    /// Creates an empty container registering its vectors into `registry`.
    pub fn new(registry: Arc<Registry>, telemetry: Arc<Telemetry>) -> CounterContainer {
        CounterContainer { elements: HashMap::new(), registry, telemetry }
    }

    /// Returns the counter child for the given identity, creating and
    /// registering the vector on first use of its key.
    pub fn get(
        &mut self,
        name: &str,
        label_names: &[String],
        labels: &Labels,
        checker: &dyn MetricChecker,
        help: &str,
    ) -> Result<Arc<CounterCell>, ContainerError> {
        let key = container_key(name, label_names);
        if !self.elements.contains_key(&key) {
            if checker.metric_conflicts(name, MetricKind::Counter) {
                return Err(ContainerError::Conflict(name.to_string()));
            }
            let vec = Arc::new(CounterVec::new(name, help, label_names.to_vec()));
            self.registry.register(Arc::new(Unchecked::new(vec.clone())))?;
            self.telemetry.inc_active(MetricKind::Counter);
            self.elements.insert(key.clone(), vec);
        }
        Ok(self.elements[&key].with_labels(labels))
    }

    /// Removes the child row; the vector itself stays registered. No-op for
    /// unknown keys.
    pub fn delete(&mut self, name: &str, label_names: &[String], labels: &Labels) {
        if let Some(vec) = self.elements.get(&container_key(name, label_names)) {
            vec.remove(labels);
            self.telemetry.dec_active(MetricKind::Counter);
        }
    }
}

/// The gauge container.
pub struct GaugeContainer {
    elements: HashMap<String, Arc<GaugeVec>>,
    registry: Arc<Registry>,
    telemetry: Arc<Telemetry>,
}

impl GaugeContainer {
    /// Creates an empty container registering its vectors into `registry`.
    pub fn new(registry: Arc<Registry>, telemetry: Arc<Telemetry>) -> GaugeContainer {
        GaugeContainer { elements: HashMap::new(), registry, telemetry }
    }

    /// Returns the gauge child for the given identity, creating and
    /// registering the vector on first use of its key.
    pub fn get(
        &mut self,
        name: &str,
        label_names: &[String],
        labels: &Labels,
        checker: &dyn MetricChecker,
        help: &str,
    ) -> Result<Arc<GaugeCell>, ContainerError> {
        let key = container_key(name, label_names);
        if !self.elements.contains_key(&key) {
            if checker.metric_conflicts(name, MetricKind::Gauge) {
                return Err(ContainerError::Conflict(name.to_string()));
            }
            let vec = Arc::new(GaugeVec::new(name, help, label_names.to_vec()));
            self.registry.register(Arc::new(Unchecked::new(vec.clone())))?;
            self.telemetry.inc_active(MetricKind::Gauge);
            self.elements.insert(key.clone(), vec);
        }
        Ok(self.elements[&key].with_labels(labels))
    }

    /// Removes the child row; no-op for unknown keys.
    pub fn delete(&mut self, name: &str, label_names: &[String], labels: &Labels) {
        if let Some(vec) = self.elements.get(&container_key(name, label_names)) {
            vec.remove(labels);
            self.telemetry.dec_active(MetricKind::Gauge);
        }
    }
}

/// The summary container.
pub struct SummaryContainer {
    elements: HashMap<String, Arc<SummaryVec>>,
    registry: Arc<Registry>,
    telemetry: Arc<Telemetry>,
}

impl SummaryContainer {
    /// Creates an empty container registering its vectors into `registry`.
    pub fn new(registry: Arc<Registry>, telemetry: Arc<Telemetry>) -> SummaryContainer {
        SummaryContainer { elements: HashMap::new(), registry, telemetry }
    }

    /// Returns the summary child for the given identity.
    ///
    /// The conflict check also covers the `_sum` and `_count` names the
    /// exposition format synthesizes. Objectives come from the mapping if it
    /// sets any, else the mapper defaults, else a hard-coded set.
    pub fn get(
        &mut self,
        name: &str,
        label_names: &[String],
        labels: &Labels,
        checker: &dyn MetricChecker,
        help: &str,
        mapping: Option<&MetricMapping>,
        defaults: &MapperDefaults,
    ) -> Result<Arc<SummaryCell>, ContainerError> {
        let key = container_key(name, label_names);
        if !self.elements.contains_key(&key) {
            for claimed in [name.to_string(), format!("{name}_sum"), format!("{name}_count")] {
                if checker.metric_conflicts(&claimed, MetricKind::Summary) {
                    return Err(ContainerError::Conflict(name.to_string()));
                }
            }

            let mut objectives: &[SummaryObjective] = &defaults.quantiles;
            if let Some(mapping) = mapping {
                if !mapping.quantiles.is_empty() {
                    objectives = &mapping.quantiles;
                }
            }
            // Without a mapping configuration there are no defaults either;
            // fall back to an explicit set.
            let objectives = if objectives.is_empty() {
                FALLBACK_OBJECTIVES.to_vec()
            } else {
                objectives.to_vec()
            };

            let vec = Arc::new(SummaryVec::new(name, help, label_names.to_vec(), objectives));
            self.registry.register(Arc::new(Unchecked::new(vec.clone())))?;
            self.telemetry.inc_active(MetricKind::Summary);
            self.elements.insert(key.clone(), vec);
        }
        Ok(self.elements[&key].with_labels(labels))
    }

    /// Removes the child row; no-op for unknown keys.
    pub fn delete(&mut self, name: &str, label_names: &[String], labels: &Labels) {
        if let Some(vec) = self.elements.get(&container_key(name, label_names)) {
            vec.remove(labels);
            self.telemetry.dec_active(MetricKind::Summary);
        }
    }
}

/// The histogram container.
pub struct HistogramContainer {
    elements: HashMap<String, Arc<HistogramVec>>,
    registry: Arc<Registry>,
    telemetry: Arc<Telemetry>,
}

impl HistogramContainer {
    /// Creates an empty container registering its vectors into `registry`.
    pub fn new(registry: Arc<Registry>, telemetry: Arc<Telemetry>) -> HistogramContainer {
        HistogramContainer { elements: HashMap::new(), registry, telemetry }
    }

    /// Returns the histogram child for the given identity.
    ///
    /// The conflict check also covers the `_sum`, `_count`, and `_bucket`
    /// names. Buckets come from the mapping if it sets any, else the mapper
    /// defaults, else the canonical default ladder.
    pub fn get(
        &mut self,
        name: &str,
        label_names: &[String],
        labels: &Labels,
        checker: &dyn MetricChecker,
        help: &str,
        mapping: Option<&MetricMapping>,
        defaults: &MapperDefaults,
    ) -> Result<Arc<HistogramCell>, ContainerError> {
        let key = container_key(name, label_names);
        if !self.elements.contains_key(&key) {
            for claimed in [
                name.to_string(),
                format!("{name}_sum"),
                format!("{name}_count"),
                format!("{name}_bucket"),
            ] {
                if checker.metric_conflicts(&claimed, MetricKind::Histogram) {
                    return Err(ContainerError::Conflict(name.to_string()));
                }
            }

            let mut buckets: &[f64] = &defaults.buckets;
            if let Some(mapping) = mapping {
                if !mapping.buckets.is_empty() {
                    buckets = &mapping.buckets;
                }
            }
            let buckets =
                if buckets.is_empty() { DEFAULT_BUCKETS.to_vec() } else { buckets.to_vec() };

            let vec = Arc::new(HistogramVec::new(name, help, label_names.to_vec(), buckets));
            self.registry.register(Arc::new(Unchecked::new(vec.clone())))?;
            self.telemetry.inc_active(MetricKind::Histogram);
            self.elements.insert(key.clone(), vec);
        }
        Ok(self.elements[&key].with_labels(labels))
    }

    /// Removes the child row; no-op for unknown keys.
    pub fn delete(&mut self, name: &str, label_names: &[String], labels: &Labels) {
        if let Some(vec) = self.elements.get(&container_key(name, label_names)) {
            vec.remove(labels);
            self.telemetry.dec_active(MetricKind::Histogram);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{
        ContainerError, CounterContainer, GaugeContainer, MetricChecker, SummaryContainer,
    };
    use crate::event::Labels;
    use crate::index::MetricKind;
    use crate::mapper::{MapperDefaults, MetricMapping, SummaryObjective};
    use crate::registry::Registry;
    use crate::telemetry::Telemetry;

    struct NoConflicts;
    impl MetricChecker for NoConflicts {
        fn metric_conflicts(&self, _name: &str, _kind: MetricKind) -> bool {
            false
        }
    }

    struct ConflictsOn(&'static str);
    impl MetricChecker for ConflictsOn {
        fn metric_conflicts(&self, name: &str, _kind: MetricKind) -> bool {
            name == self.0
        }
    }

    fn fixtures() -> (Arc<Registry>, Arc<Telemetry>) {
        let registry = Arc::new(Registry::new());
        let telemetry = Arc::new(Telemetry::register(&registry).unwrap());
        (registry, telemetry)
    }

    #[test]
    fn test_get_creates_once_and_reuses() {
        let (registry, telemetry) = fixtures();
        let mut counters = CounterContainer::new(registry.clone(), telemetry);

        let names = vec!["env".to_string()];
        let labels: Labels = [("env".to_string(), "prod".to_string())].into_iter().collect();

        let first = counters.get("foo", &names, &labels, &NoConflicts, "help").unwrap();
        first.add(1.0);
        let second = counters.get("foo", &names, &labels, &NoConflicts, "help").unwrap();
        second.add(1.0);
        assert_eq!(first.get(), 2.0);

        let output = registry.render();
        assert!(output.contains("foo{env=\"prod\"} 2\n"));
        assert!(output.contains("statsd_bridge_metrics_total{type=\"counter\"} 1\n"));
    }

    #[test]
    fn test_conflicting_name_is_rejected() {
        let (registry, telemetry) = fixtures();
        let mut gauges = GaugeContainer::new(registry, telemetry);

        let err = gauges
            .get("foo", &[], &Labels::new(), &ConflictsOn("foo"), "help")
            .unwrap_err();
        assert_eq!(err, ContainerError::Conflict("foo".to_string()));
    }

    #[test]
    fn test_summary_conflict_covers_synthetic_names() {
        let (registry, telemetry) = fixtures();
        let mut summaries = SummaryContainer::new(registry, telemetry);
        let defaults = MapperDefaults::default();

        let err = summaries
            .get("lat", &[], &Labels::new(), &ConflictsOn("lat_sum"), "help", None, &defaults)
            .unwrap_err();
        assert_eq!(err, ContainerError::Conflict("lat".to_string()));
    }

    #[test]
    fn test_summary_objective_precedence() {
        let (registry, telemetry) = fixtures();
        let mut summaries = SummaryContainer::new(registry.clone(), telemetry);

        let defaults = MapperDefaults {
            quantiles: vec![SummaryObjective { quantile: 0.75, error: 0.01 }],
            ..Default::default()
        };
        let mapping = MetricMapping {
            quantiles: vec![SummaryObjective { quantile: 0.25, error: 0.02 }],
            ..Default::default()
        };

        summaries
            .get("a", &[], &Labels::new(), &NoConflicts, "help", Some(&mapping), &defaults)
            .unwrap()
            .observe(1.0);
        summaries
            .get("b", &[], &Labels::new(), &NoConflicts, "help", None, &defaults)
            .unwrap()
            .observe(1.0);
        summaries
            .get("c", &[], &Labels::new(), &NoConflicts, "help", None, &MapperDefaults::default())
            .unwrap()
            .observe(1.0);

        let output = registry.render();
        // Mapping override wins for a, defaults for b, hard-coded set for c.
        assert!(output.contains("a{quantile=\"0.25\"}"));
        assert!(output.contains("b{quantile=\"0.75\"}"));
        assert!(output.contains("c{quantile=\"0.5\"}"));
        assert!(output.contains("c{quantile=\"0.99\"}"));
    }

    #[test]
    fn test_delete_removes_row_and_decrements_gauge() {
        let (registry, telemetry) = fixtures();
        let mut counters = CounterContainer::new(registry.clone(), telemetry);

        counters.get("foo", &[], &Labels::new(), &NoConflicts, "help").unwrap().add(1.0);
        counters.delete("foo", &[], &Labels::new());

        let output = registry.render();
        assert!(!output.contains("\nfoo "));
        assert!(output.contains("statsd_bridge_metrics_total{type=\"counter\"} 0\n"));

        // Deleting an unknown key is a no-op.
        counters.delete("bar", &[], &Labels::new());
    }
}
