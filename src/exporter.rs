//! The event-handling core: mapping, typed dispatch, recency bookkeeping,
//! and the expiry sweeper, all driven by a single worker.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{select, tick, Receiver};
use quanta::Clock;
use tracing::debug;

use crate::containers::{
    CounterContainer, GaugeContainer, HistogramContainer, SummaryContainer,
};
use crate::event::{Event, Events, Labels, MetricType};
use crate::formatting::escape_metric_name;
use crate::index::{LabelIndex, MetricKind};
use crate::mapper::{Action, MetricMapper, MetricMapping, TimerKind};
use crate::registry::Registry;
use crate::telemetry::{ErrorReason, Telemetry};

/// Help text for metrics without a mapping-provided override.
pub const DEFAULT_HELP: &str = "Metric autogenerated by statsd_bridge.";

/// Returns the label names of a label map, sorted. The sorted tuple is both
/// the container sub-key and part of the series identity hash.
pub(crate) fn sorted_label_names(labels: &Labels) -> Vec<String> {
    let mut names: Vec<String> = labels.keys().cloned().collect();
    names.sort_unstable();
    names
}

/// The translation core.
///
/// Owns the four typed containers, the label-value index, and the mapper.
/// All mutation happens on the single worker driving [`Exporter::run`]; the
/// scrape path only ever touches the registry and the internally
/// synchronized children.
pub struct Exporter {
    counters: CounterContainer,
    gauges: GaugeContainer,
    summaries: SummaryContainer,
    histograms: HistogramContainer,
    index: LabelIndex,
    mapper: Box<dyn MetricMapper + Send>,
    telemetry: Arc<Telemetry>,
    clock: Clock,
}

impl Exporter {
    /// Creates an exporter registering its metrics into `registry`.
    pub fn new(
        mapper: Box<dyn MetricMapper + Send>,
        registry: Arc<Registry>,
        telemetry: Arc<Telemetry>,
        clock: Clock,
    ) -> Exporter {
        Exporter {
            counters: CounterContainer::new(registry.clone(), telemetry.clone()),
            gauges: GaugeContainer::new(registry.clone(), telemetry.clone()),
            summaries: SummaryContainer::new(registry.clone(), telemetry.clone()),
            histograms: HistogramContainer::new(registry, telemetry.clone()),
            index: LabelIndex::new(),
            mapper,
            telemetry,
            clock,
        }
    }

    /// Handles all event batches sent to the given channel, multiplexed with
    /// a one-second expiry tick. Returns when the channel is closed; batches
    /// already received are drained first.
    pub fn run(&mut self, events: Receiver<Events>) {
        let ticker = tick(Duration::from_secs(1));

        loop {
            select! {
                recv(ticker) -> _ => self.remove_stale_metrics(),
                recv(events) -> batch => match batch {
                    Ok(batch) => {
                        for event in batch {
                            self.handle_event(event);
                        }
                    }
                    Err(_) => {
                        debug!("event channel closed, stopping exporter worker");
                        return;
                    }
                },
            }
        }
    }

    /// Processes a single event according to the configured mapping.
    pub fn handle_event(&mut self, event: Event) {
        let (mapping, present) = match self.mapper.lookup(event.name(), event.metric_type()) {
            Some(mapping) => (mapping, true),
            None => {
                let mut mapping = MetricMapping::default();
                if self.mapper.defaults().ttl != Duration::ZERO {
                    mapping.ttl = self.mapper.defaults().ttl;
                }
                (mapping, false)
            }
        };

        if mapping.action == Action::Drop {
            self.telemetry.inc_action(Action::Drop);
            return;
        }

        let help = mapping.help.as_deref().unwrap_or(DEFAULT_HELP);

        let metric_name;
        let mut labels = event.labels().clone();
        if present {
            if mapping.name.is_empty() {
                debug!(metric = event.name(), "mapping generates an empty metric name");
                self.telemetry.inc_sample_error(ErrorReason::EmptyMetricName);
                return;
            }
            metric_name = escape_metric_name(&mapping.name);
            for (key, value) in &mapping.labels {
                labels.insert(key.clone(), value.clone());
            }
            self.telemetry.inc_action(mapping.action);
        } else {
            self.telemetry.events_unmapped.add(1.0);
            metric_name = escape_metric_name(event.name());
        }

        let sorted_label_names = sorted_label_names(&labels);

        match &event {
            Event::Counter { value, .. } => {
                // A negative increment is fatal to the underlying counter
                // primitive, so the event is dropped with an explicit error
                // rather than silently scaled.
                if *value < 0.0 {
                    debug!(
                        metric = metric_name.as_str(),
                        value = *value,
                        "counter increment must be non-negative"
                    );
                    self.telemetry.inc_sample_error(ErrorReason::IllegalNegativeCounter);
                    return;
                }

                match self.counters.get(
                    &metric_name,
                    &sorted_label_names,
                    &labels,
                    &self.index,
                    help,
                ) {
                    Ok(counter) => {
                        counter.add(*value);
                        self.save(
                            &metric_name,
                            MetricKind::Counter,
                            &sorted_label_names,
                            &labels,
                            mapping.ttl,
                        );
                        self.telemetry.inc_event(MetricType::Counter);
                    }
                    Err(err) => {
                        debug!(metric = metric_name.as_str(), %err, "failed to update metric");
                        self.telemetry.inc_conflict(MetricType::Counter);
                    }
                }
            }

            Event::Gauge { value, relative, .. } => {
                match self.gauges.get(
                    &metric_name,
                    &sorted_label_names,
                    &labels,
                    &self.index,
                    help,
                ) {
                    Ok(gauge) => {
                        if *relative {
                            gauge.add(*value);
                        } else {
                            gauge.set(*value);
                        }
                        self.save(
                            &metric_name,
                            MetricKind::Gauge,
                            &sorted_label_names,
                            &labels,
                            mapping.ttl,
                        );
                        self.telemetry.inc_event(MetricType::Gauge);
                    }
                    Err(err) => {
                        debug!(metric = metric_name.as_str(), %err, "failed to update metric");
                        self.telemetry.inc_conflict(MetricType::Gauge);
                    }
                }
            }

            Event::Timer { value, .. } => {
                // The wire carries milliseconds; the registry convention is
                // seconds.
                let seconds = *value / 1000.0;
                let timer_kind =
                    mapping.timer_kind.unwrap_or(self.mapper.defaults().timer_kind);

                match timer_kind {
                    TimerKind::Histogram => {
                        match self.histograms.get(
                            &metric_name,
                            &sorted_label_names,
                            &labels,
                            &self.index,
                            help,
                            Some(&mapping),
                            self.mapper.defaults(),
                        ) {
                            Ok(histogram) => {
                                histogram.observe(seconds);
                                self.save(
                                    &metric_name,
                                    MetricKind::Histogram,
                                    &sorted_label_names,
                                    &labels,
                                    mapping.ttl,
                                );
                                self.telemetry.inc_event(MetricType::Timer);
                            }
                            Err(err) => {
                                debug!(metric = metric_name.as_str(), %err, "failed to update metric");
                                self.telemetry.inc_conflict(MetricType::Timer);
                            }
                        }
                    }
                    TimerKind::Summary => {
                        match self.summaries.get(
                            &metric_name,
                            &sorted_label_names,
                            &labels,
                            &self.index,
                            help,
                            Some(&mapping),
                            self.mapper.defaults(),
                        ) {
                            Ok(summary) => {
                                summary.observe(seconds);
                                self.save(
                                    &metric_name,
                                    MetricKind::Summary,
                                    &sorted_label_names,
                                    &labels,
                                    mapping.ttl,
                                );
                                self.telemetry.inc_event(MetricType::Timer);
                            }
                            Err(err) => {
                                debug!(metric = metric_name.as_str(), %err, "failed to update metric");
                                self.telemetry.inc_conflict(MetricType::Timer);
                            }
                        }
                    }
                }
            }
        }
    }

    /// Drops every series whose TTL has lapsed, from both the index and the
    /// containers.
    ///
    /// Only one container owns any given series, but deletes no-op on
    /// missing keys, so the sweep hits all four instead of tracking the kind
    /// a second time.
    pub fn remove_stale_metrics(&mut self) {
        let now = self.clock.now();
        for (name, descriptor) in self.index.take_expired(now) {
            let sorted_label_names = sorted_label_names(&descriptor.labels);
            self.counters.delete(&name, &sorted_label_names, &descriptor.labels);
            self.gauges.delete(&name, &sorted_label_names, &descriptor.labels);
            self.summaries.delete(&name, &sorted_label_names, &descriptor.labels);
            self.histograms.delete(&name, &sorted_label_names, &descriptor.labels);
        }
    }

    fn save(
        &mut self,
        name: &str,
        kind: MetricKind,
        label_names: &[String],
        labels: &Labels,
        ttl: Duration,
    ) {
        let now = self.clock.now();
        self.index.save(name, kind, label_names, labels, ttl, now);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use quanta::{Clock, Mock};

    use super::Exporter;
    use crate::event::{Event, Labels};
    use crate::mapper::{
        Action, EmptyMapper, MapperDefaults, MappingRule, MetricMapper, MetricMapping, NameMatch,
        RuleMapper, TimerKind,
    };
    use crate::registry::Registry;
    use crate::telemetry::Telemetry;

    fn setup(mapper: Box<dyn MetricMapper + Send>) -> (Exporter, Arc<Registry>, Arc<Mock>) {
        let registry = Arc::new(Registry::new());
        let telemetry = Arc::new(Telemetry::register(&registry).unwrap());
        let (clock, mock) = Clock::mock();
        let exporter = Exporter::new(mapper, registry.clone(), telemetry, clock);
        (exporter, registry, mock)
    }

    fn counter(name: &str, value: f64) -> Event {
        Event::Counter { name: name.to_string(), value, labels: Labels::new() }
    }

    #[test]
    fn test_counter_accumulates_across_events() {
        let (mut exporter, registry, _mock) = setup(Box::<EmptyMapper>::default());

        for _ in 0..3 {
            exporter.handle_event(counter("foo", 1.0));
        }

        let output = registry.render();
        assert!(output.contains("foo 3\n"));
        assert!(output.contains("statsd_bridge_events_total{type=\"counter\"} 3\n"));
        assert!(output.contains("statsd_bridge_events_unmapped_total 3\n"));
    }

    #[test]
    fn test_negative_counter_is_dropped() {
        let (mut exporter, registry, _mock) = setup(Box::<EmptyMapper>::default());

        exporter.handle_event(counter("foo", -1.0));

        let output = registry.render();
        assert!(!output.contains("\nfoo "));
        assert!(output.contains(
            "statsd_bridge_sample_errors_total{reason=\"illegal_negative_counter\"} 1\n"
        ));
    }

    #[test]
    fn test_gauge_relative_and_absolute() {
        let (mut exporter, registry, _mock) = setup(Box::<EmptyMapper>::default());

        exporter.handle_event(Event::Gauge {
            name: "gg".to_string(),
            value: 4.0,
            relative: true,
            labels: Labels::new(),
        });
        exporter.handle_event(Event::Gauge {
            name: "gg".to_string(),
            value: 7.0,
            relative: false,
            labels: Labels::new(),
        });

        assert!(registry.render().contains("gg 7\n"));
    }

    #[test]
    fn test_timer_defaults_to_summary_in_seconds() {
        let (mut exporter, registry, _mock) = setup(Box::<EmptyMapper>::default());

        exporter.handle_event(Event::Timer {
            name: "lat".to_string(),
            value: 320.0,
            labels: Labels::new(),
        });

        let output = registry.render();
        assert!(output.contains("# TYPE lat summary\n"));
        assert!(output.contains("lat_sum 0.32\n"));
        assert!(output.contains("lat_count 1\n"));
    }

    #[test]
    fn test_timer_kind_from_defaults() {
        let defaults = MapperDefaults { timer_kind: TimerKind::Histogram, ..Default::default() };
        let (mut exporter, registry, _mock) =
            setup(Box::new(EmptyMapper::with_defaults(defaults)));

        exporter.handle_event(Event::Timer {
            name: "lat".to_string(),
            value: 500.0,
            labels: Labels::new(),
        });

        let output = registry.render();
        assert!(output.contains("# TYPE lat histogram\n"));
        assert!(output.contains("lat_bucket{le=\"+Inf\"} 1\n"));
    }

    #[test]
    fn test_type_conflict_preserves_existing_series() {
        let (mut exporter, registry, _mock) = setup(Box::<EmptyMapper>::default());

        exporter.handle_event(counter("x", 1.0));
        exporter.handle_event(Event::Gauge {
            name: "x".to_string(),
            value: 9.0,
            relative: false,
            labels: Labels::new(),
        });

        let output = registry.render();
        assert!(output.contains("# TYPE x counter\n"));
        assert!(output.contains("x 1\n"));
        assert!(!output.contains("# TYPE x gauge"));
        assert!(output.contains("statsd_bridge_conflicting_events_total{type=\"gauge\"} 1\n"));
    }

    #[test]
    fn test_mapping_renames_and_merges_labels() {
        let mut extra = Labels::new();
        extra.insert("job".to_string(), "worker".to_string());
        extra.insert("env".to_string(), "mapped".to_string());

        let mapper = RuleMapper::new(MapperDefaults::default()).rule(MappingRule {
            matcher: NameMatch::Full("raw.name".to_string()),
            metric_type: None,
            mapping: MetricMapping {
                name: "clean_name".to_string(),
                labels: extra,
                ..Default::default()
            },
        });
        let (mut exporter, registry, _mock) = setup(Box::new(mapper));

        let mut labels = Labels::new();
        labels.insert("env".to_string(), "wire".to_string());
        exporter.handle_event(Event::Counter { name: "raw.name".to_string(), value: 1.0, labels });

        let output = registry.render();
        // The mapping wins on label collision and the name is rewritten.
        assert!(output.contains("clean_name{env=\"mapped\",job=\"worker\"} 1\n"));
        assert!(output.contains("statsd_bridge_event_actions_total{action=\"map\"} 1\n"));
    }

    #[test]
    fn test_drop_action_discards_event() {
        let mapper = RuleMapper::new(MapperDefaults::default()).rule(MappingRule {
            matcher: NameMatch::Prefix("noise".to_string()),
            metric_type: None,
            mapping: MetricMapping {
                name: "noise".to_string(),
                action: Action::Drop,
                ..Default::default()
            },
        });
        let (mut exporter, registry, _mock) = setup(Box::new(mapper));

        exporter.handle_event(counter("noise.level", 1.0));

        let output = registry.render();
        assert!(!output.contains("\nnoise"));
        assert!(output.contains("statsd_bridge_event_actions_total{action=\"drop\"} 1\n"));
    }

    #[test]
    fn test_empty_mapped_name_is_dropped() {
        let mapper = RuleMapper::new(MapperDefaults::default()).rule(MappingRule {
            matcher: NameMatch::Full("raw".to_string()),
            metric_type: None,
            mapping: MetricMapping::default(),
        });
        let (mut exporter, registry, _mock) = setup(Box::new(mapper));

        exporter.handle_event(counter("raw", 1.0));

        let output = registry.render();
        assert!(output
            .contains("statsd_bridge_sample_errors_total{reason=\"empty_metric_name\"} 1\n"));
    }

    #[test]
    fn test_expiry_removes_and_reobservation_recreates() {
        let defaults = MapperDefaults { ttl: Duration::from_secs(2), ..Default::default() };
        let (mut exporter, registry, mock) =
            setup(Box::new(EmptyMapper::with_defaults(defaults)));

        exporter.handle_event(counter("foo", 1.0));
        assert!(registry.render().contains("foo 1\n"));

        mock.increment(Duration::from_secs(3));
        exporter.remove_stale_metrics();
        assert!(!registry.render().contains("\nfoo "));

        // The identity is not poisoned: a new observation starts fresh.
        exporter.handle_event(counter("foo", 5.0));
        assert!(registry.render().contains("foo 5\n"));
    }

    #[test]
    fn test_sweep_leaves_fresh_series_alone() {
        let defaults = MapperDefaults { ttl: Duration::from_secs(10), ..Default::default() };
        let (mut exporter, registry, mock) =
            setup(Box::new(EmptyMapper::with_defaults(defaults)));

        exporter.handle_event(counter("fresh", 1.0));
        mock.increment(Duration::from_secs(3));
        exporter.remove_stale_metrics();

        assert!(registry.render().contains("fresh 1\n"));
    }
}
