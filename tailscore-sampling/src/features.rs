//! Extraction of model features from buffered spans.

use std::fmt;
use std::str::FromStr;

use opentelemetry_proto::tonic::common::v1::any_value::Value;
use opentelemetry_proto::tonic::trace::v1::status::StatusCode;
use opentelemetry_proto::tonic::trace::v1::{ResourceSpans, Span};

use crate::trace::TraceData;

/// Attribute carrying the HTTP response status of a span.
const HTTP_STATUS_CODE: &str = "http.status_code";

/// A feature of a trace that can be weighted by a model.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum Feature {
    /// Time from the earliest span start to the latest span end, in milliseconds.
    DurationMs,
    /// Number of spans received for the trace.
    SpanCount,
    /// `1` if any span failed, otherwise `0`.
    HasError,
}

impl Feature {
    /// All supported features.
    pub const ALL: [Feature; 3] = [Feature::DurationMs, Feature::SpanCount, Feature::HasError];

    /// Returns the name used in model weights.
    pub const fn name(&self) -> &'static str {
        match self {
            Feature::DurationMs => "duration_ms",
            Feature::SpanCount => "span_count",
            Feature::HasError => "has_error",
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Error returned for a weight on a feature that does not exist.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[error("unsupported feature {0:?}")]
pub struct UnsupportedFeature(pub String);

impl FromStr for Feature {
    type Err = UnsupportedFeature;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Feature::ALL
            .into_iter()
            .find(|feature| feature.name() == s)
            .ok_or_else(|| UnsupportedFeature(s.to_owned()))
    }
}

/// Feature values of one trace.
///
/// Every feature has a value, defaulting to `0`.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct FeatureVector {
    /// See [`Feature::DurationMs`].
    pub duration_ms: f64,
    /// See [`Feature::SpanCount`].
    pub span_count: f64,
    /// See [`Feature::HasError`].
    pub has_error: f64,
}

impl FeatureVector {
    /// Extracts features from a snapshot of the trace's batches.
    ///
    /// The trace's lock is released before any span is inspected.
    pub fn extract(trace: &TraceData) -> Self {
        let batches = trace.batches();
        Self::from_batches(&batches, trace.span_count())
    }

    /// Computes features from span batches and a precomputed span count.
    pub fn from_batches(batches: &[ResourceSpans], span_count: u64) -> Self {
        let mut extent: Option<(u64, u64)> = None;
        let mut has_error = false;

        let spans = batches
            .iter()
            .flat_map(|batch| &batch.scope_spans)
            .flat_map(|scope_spans| &scope_spans.spans);

        for span in spans {
            let (start, end) = (span.start_time_unix_nano, span.end_time_unix_nano);
            if start != 0 && end != 0 {
                extent = Some(match extent {
                    Some((earliest, latest)) => (earliest.min(start), latest.max(end)),
                    None => (start, end),
                });
            }

            has_error = has_error || is_error(span);
        }

        let duration_ms = match extent {
            Some((earliest, latest)) if latest > earliest => (latest - earliest) as f64 / 1e6,
            _ => 0.0,
        };

        Self {
            duration_ms,
            span_count: span_count as f64,
            has_error: if has_error { 1.0 } else { 0.0 },
        }
    }

    /// Returns the value of a single feature.
    pub fn get(&self, feature: Feature) -> f64 {
        match feature {
            Feature::DurationMs => self.duration_ms,
            Feature::SpanCount => self.span_count,
            Feature::HasError => self.has_error,
        }
    }

    /// Returns `true` if the trace contains a failed span.
    pub fn has_error(&self) -> bool {
        self.has_error >= 1.0
    }
}

/// A span failed if its status is an error or it responded with an HTTP 5xx status.
fn is_error(span: &Span) -> bool {
    let status_error = span
        .status
        .as_ref()
        .is_some_and(|status| status.code == StatusCode::Error as i32);

    if status_error {
        return true;
    }

    let http_status = span
        .attributes
        .iter()
        .find(|attribute| attribute.key == HTTP_STATUS_CODE)
        .and_then(|attribute| attribute.value.as_ref())
        .and_then(|value| value.value.as_ref());

    matches!(http_status, Some(Value::IntValue(code)) if *code >= 500)
}

#[cfg(test)]
pub(crate) mod tests {
    use opentelemetry_proto::tonic::common::v1::{AnyValue, KeyValue};
    use opentelemetry_proto::tonic::trace::v1::{ScopeSpans, Status};

    use super::*;

    /// Start of all test spans: 2023-10-18T09:14:14Z.
    pub const T0: u64 = 1_697_620_454_000_000_000;
    const MS: u64 = 1_000_000;

    /// Builds a span starting `offset_ms` after [`T0`].
    pub fn span(
        offset_ms: u64,
        duration_ms: u64,
        code: StatusCode,
        http_status: Option<i64>,
    ) -> Span {
        let start = T0 + offset_ms * MS;
        Span {
            trace_id: vec![1; 16],
            span_id: vec![1; 8],
            start_time_unix_nano: start,
            end_time_unix_nano: start + duration_ms * MS,
            status: Some(Status {
                code: code as i32,
                ..Default::default()
            }),
            attributes: http_status
                .map(|code| KeyValue {
                    key: HTTP_STATUS_CODE.to_owned(),
                    value: Some(AnyValue {
                        value: Some(Value::IntValue(code)),
                    }),
                })
                .into_iter()
                .collect(),
            ..Default::default()
        }
    }

    /// Wraps spans into a single-batch trace.
    pub fn trace(spans: Vec<Span>) -> TraceData {
        TraceData::from_batches(vec![ResourceSpans {
            scope_spans: vec![ScopeSpans {
                spans,
                ..Default::default()
            }],
            ..Default::default()
        }])
    }

    #[test]
    fn test_feature_names() {
        for feature in Feature::ALL {
            assert_eq!(feature.name().parse::<Feature>(), Ok(feature));
        }
    }

    #[test]
    fn test_unsupported_feature() {
        let error = "latency".parse::<Feature>().unwrap_err();
        assert_eq!(error.to_string(), r#"unsupported feature "latency""#);
    }

    #[test]
    fn test_empty_trace_has_defaults() {
        let features = FeatureVector::extract(&TraceData::new());
        assert_eq!(features, FeatureVector::default());
    }

    #[test]
    fn test_duration_uses_earliest_start_and_latest_end() {
        let trace = trace(vec![
            span(0, 100, StatusCode::Ok, None),
            span(200, 300, StatusCode::Ok, None),
        ]);

        let features = FeatureVector::extract(&trace);
        assert_eq!(features.duration_ms, 500.0);
        assert_eq!(features.span_count, 2.0);
        assert_eq!(features.has_error, 0.0);
    }

    #[test]
    fn test_duration_skips_spans_without_timestamps() {
        let mut open = span(0, 1000, StatusCode::Unset, None);
        open.end_time_unix_nano = 0;

        let trace = trace(vec![open, span(10, 20, StatusCode::Unset, None)]);
        assert_eq!(FeatureVector::extract(&trace).duration_ms, 20.0);
    }

    #[test]
    fn test_duration_is_zero_for_inverted_extent() {
        let mut inverted = span(100, 0, StatusCode::Unset, None);
        inverted.end_time_unix_nano = inverted.start_time_unix_nano - MS;

        let trace = trace(vec![inverted]);
        assert_eq!(FeatureVector::extract(&trace).duration_ms, 0.0);
    }

    #[test]
    fn test_error_status() {
        let trace = trace(vec![
            span(0, 10, StatusCode::Ok, None),
            span(0, 10, StatusCode::Error, None),
        ]);
        assert!(FeatureVector::extract(&trace).has_error());
    }

    #[test]
    fn test_http_server_error_with_ok_status() {
        let trace = trace(vec![span(0, 10, StatusCode::Ok, Some(500))]);
        let features = FeatureVector::extract(&trace);
        assert_eq!(features.has_error, 1.0);
        assert_eq!(features.get(Feature::HasError), 1.0);
    }

    #[test]
    fn test_http_client_error_is_not_an_error() {
        let trace = trace(vec![span(0, 10, StatusCode::Ok, Some(404))]);
        assert!(!FeatureVector::extract(&trace).has_error());
    }

    #[test]
    fn test_non_integer_http_status_is_ignored() {
        let mut span = span(0, 10, StatusCode::Ok, None);
        span.attributes.push(KeyValue {
            key: HTTP_STATUS_CODE.to_owned(),
            value: Some(AnyValue {
                value: Some(Value::StringValue("503".to_owned())),
            }),
        });

        assert!(!FeatureVector::extract(&trace(vec![span])).has_error());
    }

    #[test]
    fn test_span_count_comes_from_counter() {
        let features = FeatureVector::from_batches(&[], 42);
        assert_eq!(features.get(Feature::SpanCount), 42.0);
        assert_eq!(features.get(Feature::DurationMs), 0.0);
    }
}
