//! The mapping contract between inbound StatsD names and outbound series
//! identities, plus a small rule-driven implementation.

use std::time::Duration;

use crate::event::{Labels, MetricType};

/// How a mapped timer is rendered on the exposition side.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TimerKind {
    /// Render as a quantile summary.
    Summary,
    /// Render as a bucketed histogram.
    Histogram,
}

impl Default for TimerKind {
    fn default() -> Self {
        TimerKind::Summary
    }
}

/// What to do with events matched by a mapping.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Action {
    /// Rewrite and emit the event.
    Map,
    /// Discard the event.
    Drop,
}

impl Action {
    /// The label value used for the per-action counter.
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Map => "map",
            Action::Drop => "drop",
        }
    }
}

impl Default for Action {
    fn default() -> Self {
        Action::Map
    }
}

/// A summary quantile paired with its allowed estimation error.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SummaryObjective {
    /// The quantile to expose, in `[0, 1]`.
    pub quantile: f64,
    /// The allowed relative error of the estimate.
    pub error: f64,
}

/// The outcome of a successful mapping lookup.
#[derive(Clone, Debug, Default)]
pub struct MetricMapping {
    /// The rewritten metric name. An empty name is a mapping configuration
    /// error and drops the event.
    pub name: String,
    /// Extra labels merged into the event's labels; the mapping wins on
    /// key collisions.
    pub labels: Labels,
    /// Whether to emit or discard matching events.
    pub action: Action,
    /// Help text override for the exposed metric.
    pub help: Option<String>,
    /// Inactivity window after which the series is evicted; zero means
    /// never expire.
    pub ttl: Duration,
    /// Timer rendering override; `None` falls back to the defaults.
    pub timer_kind: Option<TimerKind>,
    /// Summary objectives override; empty falls back to the defaults.
    pub quantiles: Vec<SummaryObjective>,
    /// Histogram bucket bounds override; empty falls back to the defaults.
    pub buckets: Vec<f64>,
}

/// Global fallbacks applied when a mapping (or any mapping at all) leaves a
/// parameter unset.
#[derive(Clone, Debug, Default)]
pub struct MapperDefaults {
    /// Default TTL for mapped and unmapped series; zero means never expire.
    pub ttl: Duration,
    /// Default timer rendering.
    pub timer_kind: TimerKind,
    /// Default summary objectives.
    pub quantiles: Vec<SummaryObjective>,
    /// Default histogram bucket bounds.
    pub buckets: Vec<f64>,
}

/// The lookup contract the event handler relies on.
pub trait MetricMapper {
    /// Looks up the mapping for an inbound `(name, type)` pair.
    ///
    /// `None` means the event is unmapped and keeps its wire name.
    fn lookup(&self, name: &str, metric_type: MetricType) -> Option<MetricMapping>;

    /// The global default block.
    fn defaults(&self) -> &MapperDefaults;
}

/// Matches an inbound metric name in a specific way.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum NameMatch {
    /// Matches the entire metric name.
    Full(String),
    /// Matches the beginning of the metric name.
    Prefix(String),
    /// Matches the end of the metric name.
    Suffix(String),
}

impl NameMatch {
    /// Checks if the given name matches.
    pub fn matches(&self, name: &str) -> bool {
        match self {
            NameMatch::Full(full) => name == full,
            NameMatch::Prefix(prefix) => name.starts_with(prefix),
            NameMatch::Suffix(suffix) => name.ends_with(suffix),
        }
    }
}

/// One mapping rule: a name matcher, an optional stat-type restriction, and
/// the mapping produced on a match.
#[derive(Clone, Debug)]
pub struct MappingRule {
    /// How inbound names are matched.
    pub matcher: NameMatch,
    /// Restricts the rule to one StatsD type; `None` matches all types.
    pub metric_type: Option<MetricType>,
    /// The mapping handed to the event handler on a match.
    pub mapping: MetricMapping,
}

/// An ordered first-match-wins rule list.
///
/// Rules whose mapping leaves the TTL at zero inherit the default TTL, so a
/// global expiry policy applies to mapped series without repeating it per
/// rule.
#[derive(Debug, Default)]
pub struct RuleMapper {
    rules: Vec<MappingRule>,
    defaults: MapperDefaults,
}

impl RuleMapper {
    /// Creates a mapper with the given defaults and no rules.
    pub fn new(defaults: MapperDefaults) -> RuleMapper {
        RuleMapper { rules: Vec::new(), defaults }
    }

    /// Appends a rule. Rules are consulted in insertion order.
    pub fn rule(mut self, rule: MappingRule) -> RuleMapper {
        self.rules.push(rule);
        self
    }
}

impl MetricMapper for RuleMapper {
    fn lookup(&self, name: &str, metric_type: MetricType) -> Option<MetricMapping> {
        let rule = self.rules.iter().find(|rule| {
            rule.metric_type.map_or(true, |t| t == metric_type) && rule.matcher.matches(name)
        })?;

        let mut mapping = rule.mapping.clone();
        if mapping.ttl == Duration::ZERO {
            mapping.ttl = self.defaults.ttl;
        }
        Some(mapping)
    }

    fn defaults(&self) -> &MapperDefaults {
        &self.defaults
    }
}

/// A mapper that maps nothing: every event keeps its wire name and the
/// defaults apply throughout.
#[derive(Debug, Default)]
pub struct EmptyMapper {
    defaults: MapperDefaults,
}

impl EmptyMapper {
    /// Creates an empty mapper with the given defaults.
    pub fn with_defaults(defaults: MapperDefaults) -> EmptyMapper {
        EmptyMapper { defaults }
    }
}

impl MetricMapper for EmptyMapper {
    fn lookup(&self, _name: &str, _metric_type: MetricType) -> Option<MetricMapping> {
        None
    }

    fn defaults(&self) -> &MapperDefaults {
        &self.defaults
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{
        Action, MapperDefaults, MappingRule, MetricMapper, MetricMapping, NameMatch, RuleMapper,
    };
    use crate::event::MetricType;

    fn rule(matcher: NameMatch, name: &str) -> MappingRule {
        MappingRule {
            matcher,
            metric_type: None,
            mapping: MetricMapping { name: name.to_string(), ..Default::default() },
        }
    }

    #[test]
    fn test_name_match() {
        assert!(NameMatch::Full("foo".to_string()).matches("foo"));
        assert!(!NameMatch::Full("foo".to_string()).matches("foobar"));
        assert!(NameMatch::Prefix("foo".to_string()).matches("foobar"));
        assert!(NameMatch::Suffix("bar".to_string()).matches("foobar"));
    }

    #[test]
    fn test_first_match_wins() {
        let mapper = RuleMapper::new(MapperDefaults::default())
            .rule(rule(NameMatch::Prefix("api_".to_string()), "api"))
            .rule(rule(NameMatch::Full("api_requests".to_string()), "requests"));

        let mapping = mapper.lookup("api_requests", MetricType::Counter).unwrap();
        assert_eq!(mapping.name, "api");
    }

    #[test]
    fn test_type_restriction() {
        let mapper = RuleMapper::new(MapperDefaults::default()).rule(MappingRule {
            matcher: NameMatch::Full("lat".to_string()),
            metric_type: Some(MetricType::Timer),
            mapping: MetricMapping { name: "latency".to_string(), ..Default::default() },
        });

        assert!(mapper.lookup("lat", MetricType::Timer).is_some());
        assert!(mapper.lookup("lat", MetricType::Counter).is_none());
    }

    #[test]
    fn test_zero_ttl_inherits_default() {
        let defaults = MapperDefaults { ttl: Duration::from_secs(60), ..Default::default() };
        let mapper = RuleMapper::new(defaults)
            .rule(rule(NameMatch::Full("a".to_string()), "a_mapped"))
            .rule(MappingRule {
                matcher: NameMatch::Full("b".to_string()),
                metric_type: None,
                mapping: MetricMapping {
                    name: "b_mapped".to_string(),
                    ttl: Duration::from_secs(5),
                    ..Default::default()
                },
            });

        let inherited = mapper.lookup("a", MetricType::Counter).unwrap();
        assert_eq!(inherited.ttl, Duration::from_secs(60));

        let explicit = mapper.lookup("b", MetricType::Counter).unwrap();
        assert_eq!(explicit.ttl, Duration::from_secs(5));
        assert_eq!(explicit.action, Action::Map);
    }
}
