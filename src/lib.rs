//! Bridges push-based StatsD/DogStatsD metrics into a pull-based Prometheus
//! exposition registry.
//!
//! StatsD producers emit loosely-typed text events; a scraping collector
//! wants typed, labeled timeseries with immutable identity. The bridge sits
//! between the two: listeners decode lines into typed events, a single
//! worker applies the configured mapping and routes each event into one of
//! four typed containers (counter, gauge, summary, histogram), and a
//! one-second tick evicts series that have been idle past their TTL.
//!
//! The ingress is best-effort and lossy by protocol: malformed input is
//! counted in the bridge's own `statsd_bridge_*` metrics and logged at debug
//! level, never surfaced to producers. Same-name events of a conflicting
//! type are dropped; a series never changes kind while it is alive.
//!
//! # Structure
//!
//! - [`LineParser`] turns one text line into zero or more [`Event`]s.
//! - [`UdpListener`], [`TcpStreamListener`] (and `UnixgramListener` on
//!   Unix) feed event batches into a channel.
//! - [`Exporter`] is the single consumer: it maps, routes, and sweeps.
//! - [`Registry`] is shared with the scrape path and renders the exposition
//!   text via [`Registry::render`].
//! - [`MetricMapper`] is the seam for the mapping rule engine; [`RuleMapper`]
//!   is a small first-match implementation and [`EmptyMapper`] maps nothing.
#![deny(missing_docs)]

mod containers;
mod event;
mod exporter;
mod formatting;
mod index;
mod listener;
mod mapper;
mod parser;
mod registry;
mod telemetry;
mod vector;

pub use self::containers::{
    ContainerError, CounterContainer, GaugeContainer, HistogramContainer, MetricChecker,
    SummaryContainer,
};
pub use self::event::{Event, EventError, Events, Labels, MetricType};
pub use self::exporter::{Exporter, DEFAULT_HELP};
pub use self::formatting::escape_metric_name;
pub use self::index::{hash_name_and_labels, LabelIndex, LabelValues, MetricKind};
#[cfg(unix)]
pub use self::listener::UnixgramListener;
pub use self::listener::{TcpStreamListener, UdpListener};
pub use self::mapper::{
    Action, EmptyMapper, MapperDefaults, MappingRule, MetricMapper, MetricMapping, NameMatch,
    RuleMapper, SummaryObjective, TimerKind,
};
pub use self::parser::LineParser;
pub use self::registry::{
    Collector, FamilyKind, MetricFamily, Registry, RegistryError, Sample, Unchecked,
};
pub use self::telemetry::{ErrorReason, Telemetry};
pub use self::vector::{
    CounterCell, CounterVec, GaugeCell, GaugeVec, HistogramCell, HistogramVec, SummaryCell,
    SummaryVec, DEFAULT_BUCKETS,
};
