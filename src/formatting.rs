//! Metric name escaping and Prometheus text exposition helpers.

/// Escapes a metric name so it is a valid exposition-format identifier.
///
/// Valid characters are `a-z`, `A-Z`, `0-9`, and `_`; every other character
/// is replaced with `_`. A name starting with a digit gets an `_` prepended.
/// The empty string is returned unchanged. Applied to both metric names and
/// tag keys, and idempotent, so already-escaped input passes through intact.
pub fn escape_metric_name(name: &str) -> String {
    if name.is_empty() {
        return String::new();
    }

    let mut escaped = String::with_capacity(name.len() + 1);
    if name.as_bytes()[0].is_ascii_digit() {
        escaped.push('_');
    }

    for c in name.chars() {
        if c.is_ascii_alphanumeric() || c == '_' {
            escaped.push(c);
        } else {
            escaped.push('_');
        }
    }

    escaped
}

/// Escapes a label value for the exposition format.
///
/// Backslashes, double quotes, and line feeds must be escaped; everything
/// else passes through. Already-escaped backslashes are left alone.
pub(crate) fn escape_label_value(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());

    let mut pending_backslash = false;
    for c in value.chars() {
        match c {
            '\n' => {
                if pending_backslash {
                    pending_backslash = false;
                    escaped.push_str("\\\\");
                }
                escaped.push_str("\\n");
            }
            '"' => {
                if pending_backslash {
                    pending_backslash = false;
                    escaped.push_str("\\\\");
                }
                escaped.push_str("\\\"");
            }
            '\\' => {
                if pending_backslash {
                    escaped.push_str("\\\\");
                }
                pending_backslash = !pending_backslash;
            }
            c => {
                if pending_backslash {
                    pending_backslash = false;
                    escaped.push_str("\\\\");
                }
                escaped.push(c);
            }
        }
    }

    if pending_backslash {
        escaped.push_str("\\\\");
    }

    escaped
}

/// Escapes a help text for a `# HELP` line: only backslashes and line feeds.
pub(crate) fn escape_help(help: &str) -> String {
    help.replace('\\', "\\\\").replace('\n', "\\n")
}

pub(crate) fn write_help_line(buffer: &mut String, name: &str, help: &str) {
    buffer.push_str("# HELP ");
    buffer.push_str(name);
    buffer.push(' ');
    buffer.push_str(&escape_help(help));
    buffer.push('\n');
}

pub(crate) fn write_type_line(buffer: &mut String, name: &str, kind: &str) {
    buffer.push_str("# TYPE ");
    buffer.push_str(name);
    buffer.push(' ');
    buffer.push_str(kind);
    buffer.push('\n');
}

/// Writes a single sample line.
///
/// `suffix` is appended to the metric name (`_sum`, `_count`, `_bucket`) and
/// `extra_label` carries the kind-specific label (`le` for histogram buckets,
/// `quantile` for summaries), already formatted by the caller.
pub(crate) fn write_metric_line(
    buffer: &mut String,
    name: &str,
    suffix: Option<&'static str>,
    labels: &[(String, String)],
    extra_label: Option<(&'static str, &str)>,
    value: f64,
) {
    buffer.push_str(name);
    if let Some(suffix) = suffix {
        buffer.push('_');
        buffer.push_str(suffix);
    }

    if !labels.is_empty() || extra_label.is_some() {
        buffer.push('{');

        let mut first = true;
        for (label_name, label_value) in labels {
            if first {
                first = false;
            } else {
                buffer.push(',');
            }
            buffer.push_str(label_name);
            buffer.push_str("=\"");
            buffer.push_str(&escape_label_value(label_value));
            buffer.push('"');
        }

        if let Some((label_name, label_value)) = extra_label {
            if !first {
                buffer.push(',');
            }
            buffer.push_str(label_name);
            buffer.push_str("=\"");
            buffer.push_str(label_value);
            buffer.push('"');
        }

        buffer.push('}');
    }

    buffer.push(' ');
    buffer.push_str(&value.to_string());
    buffer.push('\n');
}
