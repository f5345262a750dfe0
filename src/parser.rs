//! The StatsD/DogStatsD line parser.
//!
//! One text line in, zero or more typed events out. Malformed input is
//! counted and dropped, never raised: the protocol is fire-and-forget and
//! producers see nothing.

use std::sync::Arc;

use tracing::debug;

use crate::event::{Event, Events, Labels};
use crate::formatting::escape_metric_name;
use crate::telemetry::{ErrorReason, Telemetry};

/// Parses StatsD/DogStatsD text lines into [`Events`].
#[derive(Clone)]
pub struct LineParser {
    telemetry: Arc<Telemetry>,
}

impl LineParser {
    /// Creates a parser reporting into the given telemetry set.
    pub fn new(telemetry: Arc<Telemetry>) -> LineParser {
        LineParser { telemetry }
    }

    /// Parses one line, without its terminator.
    ///
    /// A line is `METRIC:SAMPLE[:SAMPLE…]` where a sample is
    /// `VALUE|TYPE[|@SAMPLING][|#TAGS]`, the trailing two components in
    /// either order. When the body contains `|#`, multi-sample splitting on
    /// `:` is disabled for the whole line: DogStatsD tag values may contain
    /// colons, so such a line carries exactly one sample.
    pub fn parse(&self, line: &str) -> Events {
        let mut events = Events::new();
        if line.is_empty() {
            return events;
        }

        let (metric, body) = match line.split_once(':') {
            Some((metric, body)) if !metric.is_empty() => (metric, body),
            _ => {
                self.telemetry.inc_sample_error(ErrorReason::MalformedLine);
                debug!(line, "bad line from StatsD");
                return events;
            }
        };

        let samples: Vec<&str> =
            if body.contains("|#") { vec![body] } else { body.split(':').collect() };

        'samples: for sample in samples {
            self.telemetry.samples_received.add(1.0);

            let components: Vec<&str> = sample.split('|').collect();
            if components.len() < 2 || components.len() > 4 {
                self.telemetry.inc_sample_error(ErrorReason::MalformedComponent);
                debug!(line, "bad component count on line");
                continue;
            }

            let (value_str, stat_type) = (components[0], components[1]);
            let relative = value_str.starts_with('+') || value_str.starts_with('-');

            let mut value = match value_str.parse::<f64>() {
                Ok(value) if value.is_finite() => value,
                _ => {
                    self.telemetry.inc_sample_error(ErrorReason::MalformedValue);
                    debug!(value = value_str, line, "bad value on line");
                    continue;
                }
            };

            let mut multiply_events = 1usize;
            let mut labels = Labels::new();
            if components.len() >= 3 {
                if components[2..].iter().any(|c| c.is_empty()) {
                    self.telemetry.inc_sample_error(ErrorReason::MalformedComponent);
                    debug!(line, "empty component on line");
                    continue 'samples;
                }

                for component in &components[2..] {
                    match component.as_bytes()[0] {
                        b'@' => {
                            if stat_type != "c" && stat_type != "ms" {
                                self.telemetry
                                    .inc_sample_error(ErrorReason::IllegalSampleFactor);
                                debug!(line, "sampling factor on non-counter, non-timer metric");
                                continue;
                            }

                            let mut sampling_factor = 1.0;
                            match component[1..].parse::<f64>() {
                                Ok(factor) if factor != 0.0 => sampling_factor = factor,
                                Ok(_) => {}
                                Err(_) => {
                                    self.telemetry
                                        .inc_sample_error(ErrorReason::InvalidSampleFactor);
                                    debug!(
                                        factor = &component[1..],
                                        line, "invalid sampling factor"
                                    );
                                }
                            }

                            if stat_type == "c" {
                                value /= sampling_factor;
                            } else {
                                multiply_events = (1.0 / sampling_factor).round() as usize;
                            }
                        }
                        b'#' => {
                            labels = self.parse_tags(&component[1..]);
                        }
                        _ => {
                            self.telemetry.inc_sample_error(ErrorReason::InvalidSampleFactor);
                            debug!(component = *component, line, "invalid sampling factor or tag section");
                        }
                    }
                }
            }

            for _ in 0..multiply_events {
                match Event::build(stat_type, metric, value, relative, labels.clone()) {
                    Ok(event) => events.push(event),
                    Err(err) => {
                        self.telemetry.inc_sample_error(ErrorReason::IllegalEvent);
                        debug!(line, %err, "error building event");
                    }
                }
            }
        }

        events
    }

    /// Parses a DogStatsD tag section (the part after `#`) into labels.
    /// Tags are comma-separated `key:value` pairs; a leading `#` on a tag is
    /// tolerated. Broken tags are counted and skipped individually.
    fn parse_tags(&self, section: &str) -> Labels {
        let mut labels = Labels::new();
        self.telemetry.tags_received.add(1.0);

        if section.is_empty() {
            return labels;
        }

        for tag in section.split(',') {
            self.handle_tag(tag, &mut labels);
        }

        labels
    }

    fn handle_tag(&self, tag: &str, labels: &mut Labels) {
        if tag.is_empty() {
            self.telemetry.tag_errors.add(1.0);
            debug!(tag, "malformed or empty DogStatsD tag");
            return;
        }

        let tag = tag.strip_prefix('#').unwrap_or(tag);
        match tag.split_once(':') {
            Some((key, value)) if !key.is_empty() && !value.is_empty() => {
                labels.insert(escape_metric_name(key), value.to_string());
            }
            _ => {
                self.telemetry.tag_errors.add(1.0);
                debug!(tag, "malformed or empty DogStatsD tag");
            }
        }
    }
}
