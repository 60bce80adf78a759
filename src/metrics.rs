//! Aggregation of reconciled resolver timings into histogram observations.
use std::time::Duration;

use crate::correlation::RequestTelemetry;

/// Histogram of request-level elapsed time, one observation per query in the
/// request, tagged `query:<fieldName>`.
pub const ROOT_REQUEST_TIME: &str = "graphql.root.request_time";

/// Histogram of per-resolver elapsed time, tagged `type:<typeName>`,
/// `field:<fieldName>` and `typeAndField:<typeName>.<fieldName>`.
///
/// Both metric names and their tag shapes are a wire contract for dashboards;
/// changing them breaks downstream aggregation.
pub const TYPE_REQUEST_TIME: &str = "graphql.type.request_time";

pub type SinkError = Box<dyn std::error::Error + Send + Sync>;

/// Destination for aggregated observations.
///
/// Emission is fire-and-forget: the aggregator neither waits for
/// acknowledgment nor retries. A sink failure is logged and discarded, so
/// implementations are free to return errors without affecting the host
/// request. The process-wide sink is expected to tolerate concurrent calls.
pub trait MetricsSink {
    fn histogram(&self, name: &str, value: f64, tags: &[String]) -> Result<(), SinkError>;
}

/// Convert an elapsed interval to fractional milliseconds.
///
/// Only call this on values representing deltas of clock samples, never on
/// anything derived from an absolute timestamp. `f64` stops representing
/// nanosecond counts exactly at about 104 days of magnitude, which is fine
/// for any realistic request duration and very much not fine for time since
/// boot.
pub fn duration_millis(delta: Duration) -> f64 {
    delta.as_secs() as f64 * 1e3 + f64::from(delta.subsec_nanos()) / 1e6
}

/// Emit the histograms for a reconciled request: one root observation per
/// query descriptor, then one type observation per attached resolver report.
pub(crate) fn emit_request_metrics(telemetry: &RequestTelemetry, sink: &dyn MetricsSink) {
    for descriptor in telemetry.descriptors() {
        if let Some(elapsed) = telemetry.request_duration() {
            observe(
                sink,
                ROOT_REQUEST_TIME,
                duration_millis(elapsed),
                vec![format!("query:{}", descriptor.info().field_name)],
            );
        }

        for report in descriptor.resolvers() {
            let (Some(field), Some(start), Some(end)) =
                (report.field.as_ref(), report.start_offset, report.end_offset)
            else {
                continue;
            };
            let elapsed = duration_millis(end) - duration_millis(start);
            observe(
                sink,
                TYPE_REQUEST_TIME,
                elapsed,
                vec![
                    format!("type:{}", field.type_name),
                    format!("field:{}", field.field_name),
                    format!("typeAndField:{}.{}", field.type_name, field.field_name),
                ],
            );
        }
    }
}

fn observe(sink: &dyn MetricsSink, name: &str, value: f64, tags: Vec<String>) {
    if let Err(err) = sink.histogram(name, value, &tags) {
        tracing::debug!(metric = name, error = %err, "dropped histogram observation");
    }
}
