//! Typed events decoded from the StatsD wire format.

use std::collections::HashMap;

use thiserror::Error;

/// A label map attached to an event or a timeseries.
pub type Labels = HashMap<String, String>;

/// A batch of events, delivered as one unit over the event channel.
pub type Events = Vec<Event>;

/// The StatsD-side type of an event, as used for mapping lookups.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum MetricType {
    /// A monotonic counter delta.
    Counter,
    /// A gauge set or adjustment.
    Gauge,
    /// A timer observation.
    Timer,
}

impl MetricType {
    /// The label value used for per-type self-observability counters.
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
            MetricType::Timer => "timer",
        }
    }
}

/// Errors turning a wire stat type into an [`Event`].
#[derive(Debug, Error, Eq, PartialEq)]
pub enum EventError {
    /// The StatsD "set" type is not supported.
    #[error("no support for StatsD sets")]
    SetsUnsupported,

    /// The stat type is not part of the protocol.
    #[error("bad stat type {0}")]
    UnknownType(String),
}

/// A single observation decoded from one wire sample.
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    /// A non-negative delta added to a counter.
    Counter {
        /// Raw metric name from the wire.
        name: String,
        /// Delta, already scaled up by the sampling factor.
        value: f64,
        /// Labels parsed from DogStatsD tags.
        labels: Labels,
    },
    /// A gauge update.
    Gauge {
        /// Raw metric name from the wire.
        name: String,
        /// New value, or delta when `relative` is set.
        value: f64,
        /// `true` when the wire value carried an explicit sign, meaning
        /// "add this delta" rather than "set this value".
        relative: bool,
        /// Labels parsed from DogStatsD tags.
        labels: Labels,
    },
    /// A timer observation, in milliseconds.
    Timer {
        /// Raw metric name from the wire.
        name: String,
        /// Observed duration in milliseconds.
        value: f64,
        /// Labels parsed from DogStatsD tags.
        labels: Labels,
    },
}

impl Event {
    /// Builds an event from a wire stat type.
    ///
    /// `ms`, `h`, and `d` all map to [`Event::Timer`]. The `s` (set) type is
    /// rejected explicitly, anything else as unknown.
    pub fn build(
        stat_type: &str,
        name: &str,
        value: f64,
        relative: bool,
        labels: Labels,
    ) -> Result<Event, EventError> {
        match stat_type {
            "c" => Ok(Event::Counter { name: name.to_string(), value, labels }),
            "g" => Ok(Event::Gauge { name: name.to_string(), value, relative, labels }),
            "ms" | "h" | "d" => Ok(Event::Timer { name: name.to_string(), value, labels }),
            "s" => Err(EventError::SetsUnsupported),
            other => Err(EventError::UnknownType(other.to_string())),
        }
    }

    /// The raw metric name carried by the event.
    pub fn name(&self) -> &str {
        match self {
            Event::Counter { name, .. } => name,
            Event::Gauge { name, .. } => name,
            Event::Timer { name, .. } => name,
        }
    }

    /// The observed value.
    pub fn value(&self) -> f64 {
        match self {
            Event::Counter { value, .. } => *value,
            Event::Gauge { value, .. } => *value,
            Event::Timer { value, .. } => *value,
        }
    }

    /// The labels attached to the event.
    pub fn labels(&self) -> &Labels {
        match self {
            Event::Counter { labels, .. } => labels,
            Event::Gauge { labels, .. } => labels,
            Event::Timer { labels, .. } => labels,
        }
    }

    /// The StatsD-side type, as used for mapping lookups.
    pub fn metric_type(&self) -> MetricType {
        match self {
            Event::Counter { .. } => MetricType::Counter,
            Event::Gauge { .. } => MetricType::Gauge,
            Event::Timer { .. } => MetricType::Timer,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Event, EventError, Labels, MetricType};

    #[test]
    fn test_build_maps_stat_types() {
        let counter = Event::build("c", "foo", 1.0, false, Labels::new()).unwrap();
        assert_eq!(counter.metric_type(), MetricType::Counter);

        let gauge = Event::build("g", "foo", 4.0, true, Labels::new()).unwrap();
        assert_eq!(gauge.metric_type(), MetricType::Gauge);
        assert!(matches!(gauge, Event::Gauge { relative: true, .. }));

        for stat_type in ["ms", "h", "d"] {
            let timer = Event::build(stat_type, "foo", 320.0, false, Labels::new()).unwrap();
            assert_eq!(timer.metric_type(), MetricType::Timer);
        }
    }

    #[test]
    fn test_build_rejects_sets_and_unknown_types() {
        let err = Event::build("s", "foo", 1.0, false, Labels::new()).unwrap_err();
        assert_eq!(err, EventError::SetsUnsupported);

        let err = Event::build("q", "foo", 1.0, false, Labels::new()).unwrap_err();
        assert_eq!(err, EventError::UnknownType("q".to_string()));
    }
}
