//! Self-observability: the bridge's own behavior exposed as normal metrics
//! in the same registry it serves.
//!
//! All handles are created up front so the hot paths never touch the
//! registry. StatsD is fire-and-forget, so these counters (plus debug logs)
//! are the only place ingress errors become visible.

use std::sync::Arc;

use crate::event::MetricType;
use crate::index::MetricKind;
use crate::mapper::Action;
use crate::registry::{Registry, RegistryError};
use crate::vector::{CounterCell, CounterVec, GaugeVec};

/// Why a sample (or a whole line) was dropped or partially ignored.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorReason {
    /// No `:`, empty metric name, or invalid UTF-8.
    MalformedLine,
    /// Wrong pipe-component count or an empty trailing component.
    MalformedComponent,
    /// The value did not parse as a finite float.
    MalformedValue,
    /// A sampling factor on a type that takes none; the factor is ignored
    /// but the sample is kept.
    IllegalSampleFactor,
    /// A sampling factor that did not parse; the factor is dropped.
    InvalidSampleFactor,
    /// An unknown stat type, including the unsupported `s` (set) type.
    IllegalEvent,
    /// A negative counter increment.
    IllegalNegativeCounter,
    /// A mapping rewrote the metric name to the empty string.
    EmptyMetricName,
}

impl ErrorReason {
    /// The `reason` label value.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorReason::MalformedLine => "malformed_line",
            ErrorReason::MalformedComponent => "malformed_component",
            ErrorReason::MalformedValue => "malformed_value",
            ErrorReason::IllegalSampleFactor => "illegal_sample_factor",
            ErrorReason::InvalidSampleFactor => "invalid_sample_factor",
            ErrorReason::IllegalEvent => "illegal_event",
            ErrorReason::IllegalNegativeCounter => "illegal_negative_counter",
            ErrorReason::EmptyMetricName => "empty_metric_name",
        }
    }
}

/// The bridge's self-observability handles.
pub struct Telemetry {
    pub(crate) lines_received: Arc<CounterCell>,
    pub(crate) samples_received: Arc<CounterCell>,
    pub(crate) tags_received: Arc<CounterCell>,
    pub(crate) tag_errors: Arc<CounterCell>,
    pub(crate) events_unmapped: Arc<CounterCell>,
    pub(crate) udp_packets: Arc<CounterCell>,
    #[cfg(unix)]
    pub(crate) unixgram_packets: Arc<CounterCell>,
    pub(crate) tcp_connections: Arc<CounterCell>,
    pub(crate) tcp_errors: Arc<CounterCell>,
    pub(crate) tcp_too_long_lines: Arc<CounterCell>,
    sample_errors: Arc<CounterVec>,
    events_counter: Arc<CounterCell>,
    events_gauge: Arc<CounterCell>,
    events_timer: Arc<CounterCell>,
    actions_map: Arc<CounterCell>,
    actions_drop: Arc<CounterCell>,
    conflicting_events: Arc<CounterVec>,
    metrics_active: Arc<GaugeVec>,
}

fn scalar_counter(
    registry: &Registry,
    name: &str,
    help: &str,
) -> Result<Arc<CounterCell>, RegistryError> {
    let vec = Arc::new(CounterVec::new(name, help, Vec::new()));
    registry.register(vec.clone())?;
    Ok(vec.with_label_values(&[]))
}

impl Telemetry {
    /// Creates the telemetry set and registers it (checked) in the given
    /// registry.
    pub fn register(registry: &Registry) -> Result<Telemetry, RegistryError> {
        let sample_errors = Arc::new(CounterVec::new(
            "statsd_bridge_sample_errors_total",
            "Total number of errors parsing StatsD samples, by reason.",
            vec!["reason".to_string()],
        ));
        registry.register(sample_errors.clone())?;

        let events = Arc::new(CounterVec::new(
            "statsd_bridge_events_total",
            "Total number of StatsD events processed, by type.",
            vec!["type".to_string()],
        ));
        registry.register(events.clone())?;

        let actions = Arc::new(CounterVec::new(
            "statsd_bridge_event_actions_total",
            "Total number of mapping actions applied to events.",
            vec!["action".to_string()],
        ));
        registry.register(actions.clone())?;

        let conflicting_events = Arc::new(CounterVec::new(
            "statsd_bridge_conflicting_events_total",
            "Total number of events dropped because their name is already registered as a different kind.",
            vec!["type".to_string()],
        ));
        registry.register(conflicting_events.clone())?;

        let metrics_active = Arc::new(GaugeVec::new(
            "statsd_bridge_metrics_total",
            "Number of metric vectors currently registered, by kind.",
            vec!["type".to_string()],
        ));
        registry.register(metrics_active.clone())?;

        Ok(Telemetry {
            lines_received: scalar_counter(
                registry,
                "statsd_bridge_lines_total",
                "Total number of StatsD lines received.",
            )?,
            samples_received: scalar_counter(
                registry,
                "statsd_bridge_samples_total",
                "Total number of StatsD samples received.",
            )?,
            tags_received: scalar_counter(
                registry,
                "statsd_bridge_tags_total",
                "Total number of DogStatsD tag sections received.",
            )?,
            tag_errors: scalar_counter(
                registry,
                "statsd_bridge_tag_errors_total",
                "Total number of DogStatsD tags that could not be parsed.",
            )?,
            events_unmapped: scalar_counter(
                registry,
                "statsd_bridge_events_unmapped_total",
                "Total number of events with no mapping.",
            )?,
            udp_packets: scalar_counter(
                registry,
                "statsd_bridge_udp_packets_total",
                "Total number of UDP packets received.",
            )?,
            #[cfg(unix)]
            unixgram_packets: scalar_counter(
                registry,
                "statsd_bridge_unixgram_packets_total",
                "Total number of Unix datagram packets received.",
            )?,
            tcp_connections: scalar_counter(
                registry,
                "statsd_bridge_tcp_connections_total",
                "Total number of TCP connections accepted.",
            )?,
            tcp_errors: scalar_counter(
                registry,
                "statsd_bridge_tcp_errors_total",
                "Total number of errors reading from TCP connections.",
            )?,
            tcp_too_long_lines: scalar_counter(
                registry,
                "statsd_bridge_tcp_too_long_lines_total",
                "Total number of TCP lines discarded for exceeding the length limit.",
            )?,
            events_counter: events.with_label_values(&[MetricType::Counter.as_str()]),
            events_gauge: events.with_label_values(&[MetricType::Gauge.as_str()]),
            events_timer: events.with_label_values(&[MetricType::Timer.as_str()]),
            actions_map: actions.with_label_values(&[Action::Map.as_str()]),
            actions_drop: actions.with_label_values(&[Action::Drop.as_str()]),
            sample_errors,
            conflicting_events,
            metrics_active,
        })
    }

    pub(crate) fn inc_sample_error(&self, reason: ErrorReason) {
        self.sample_errors.with_label_values(&[reason.as_str()]).add(1.0);
    }

    pub(crate) fn inc_event(&self, metric_type: MetricType) {
        match metric_type {
            MetricType::Counter => self.events_counter.add(1.0),
            MetricType::Gauge => self.events_gauge.add(1.0),
            MetricType::Timer => self.events_timer.add(1.0),
        }
    }

    pub(crate) fn inc_action(&self, action: Action) {
        match action {
            Action::Map => self.actions_map.add(1.0),
            Action::Drop => self.actions_drop.add(1.0),
        }
    }

    pub(crate) fn inc_conflict(&self, metric_type: MetricType) {
        self.conflicting_events.with_label_values(&[metric_type.as_str()]).add(1.0);
    }

    pub(crate) fn inc_active(&self, kind: MetricKind) {
        self.metrics_active.with_label_values(&[kind.as_str()]).add(1.0);
    }

    pub(crate) fn dec_active(&self, kind: MetricKind) {
        self.metrics_active.with_label_values(&[kind.as_str()]).add(-1.0);
    }
}

#[cfg(test)]
mod tests {
    use super::{ErrorReason, Telemetry};
    use crate::registry::Registry;

    #[test]
    fn test_counters_render_through_registry() {
        let registry = Registry::new();
        let telemetry = Telemetry::register(&registry).unwrap();

        telemetry.lines_received.add(1.0);
        telemetry.inc_sample_error(ErrorReason::MalformedLine);
        telemetry.inc_sample_error(ErrorReason::MalformedLine);

        let output = registry.render();
        assert!(output.contains("statsd_bridge_lines_total 1\n"));
        assert!(output
            .contains("statsd_bridge_sample_errors_total{reason=\"malformed_line\"} 2\n"));
    }

    #[test]
    fn test_registration_is_checked() {
        let registry = Registry::new();
        Telemetry::register(&registry).unwrap();
        // A second registration claims the same names and must fail.
        assert!(Telemetry::register(&registry).is_err());
    }
}
