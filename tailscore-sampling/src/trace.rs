//! Buffered span data of a single trace.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use opentelemetry_proto::tonic::trace::v1::{ResourceSpans, ScopeSpans};
use parking_lot::Mutex;

/// The 16 byte identifier shared by all spans of a trace.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct TraceId([u8; 16]);

impl TraceId {
    /// Creates a trace id from its raw bytes.
    pub const fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Creates a trace id from an OTLP byte slice.
    ///
    /// Returns `None` unless the slice is exactly 16 bytes long.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        bytes.try_into().ok().map(Self)
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// All span batches received so far for one trace.
///
/// The ingestion layer appends batches as they arrive. Evaluators only read a snapshot through
/// [`TraceData::batches`], which holds the internal lock just long enough to clone a reference.
#[derive(Debug, Default)]
pub struct TraceData {
    span_count: AtomicU64,
    received_batches: Mutex<Arc<Vec<ResourceSpans>>>,
}

impl TraceData {
    /// Creates empty trace data.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates trace data from a list of batches and counts their spans.
    pub fn from_batches(batches: Vec<ResourceSpans>) -> Self {
        let span_count = batches.iter().map(count_spans).sum();
        Self {
            span_count: AtomicU64::new(span_count),
            received_batches: Mutex::new(Arc::new(batches)),
        }
    }

    /// Appends a batch of spans and bumps the span counter.
    pub fn append(&self, batch: ResourceSpans) {
        let count = count_spans(&batch);
        Arc::make_mut(&mut self.received_batches.lock()).push(batch);
        self.span_count.fetch_add(count, Ordering::Relaxed);
    }

    /// Returns the number of spans received for this trace.
    pub fn span_count(&self) -> u64 {
        self.span_count.load(Ordering::Relaxed)
    }

    /// Returns a snapshot of the received batches.
    pub fn batches(&self) -> Arc<Vec<ResourceSpans>> {
        Arc::clone(&self.received_batches.lock())
    }
}

fn count_spans(batch: &ResourceSpans) -> u64 {
    batch
        .scope_spans
        .iter()
        .map(|scope_spans| scope_spans.spans.len() as u64)
        .sum()
}

/// Splits a batch into one batch per trace, preserving resource and scope information.
///
/// Traces are returned in order of their first span. Spans with a malformed trace id are
/// dropped.
pub fn split_by_trace(batch: ResourceSpans) -> Vec<(TraceId, ResourceSpans)> {
    let ResourceSpans {
        resource,
        scope_spans,
        schema_url,
    } = batch;

    let mut traces: Vec<(TraceId, ResourceSpans)> = Vec::new();

    for scope_spans in scope_spans {
        let ScopeSpans {
            scope,
            spans,
            schema_url: scope_schema_url,
        } = scope_spans;

        // Index into `traces` of the scope block created for this scope, per trace.
        let mut scope_blocks: Vec<(TraceId, usize)> = Vec::new();

        for span in spans {
            let Some(trace_id) = TraceId::from_slice(&span.trace_id) else {
                tailscore_log::debug!(
                    trace_id_len = span.trace_id.len(),
                    "dropping span with malformed trace id"
                );
                continue;
            };

            let trace_index = match traces.iter().position(|(id, _)| *id == trace_id) {
                Some(index) => index,
                None => {
                    traces.push((
                        trace_id,
                        ResourceSpans {
                            resource: resource.clone(),
                            scope_spans: Vec::new(),
                            schema_url: schema_url.clone(),
                        },
                    ));
                    traces.len() - 1
                }
            };

            let resource_spans = &mut traces[trace_index].1;
            let block = match scope_blocks.iter().find(|(id, _)| *id == trace_id) {
                Some(&(_, block)) => block,
                None => {
                    resource_spans.scope_spans.push(ScopeSpans {
                        scope: scope.clone(),
                        spans: Vec::new(),
                        schema_url: scope_schema_url.clone(),
                    });
                    let block = resource_spans.scope_spans.len() - 1;
                    scope_blocks.push((trace_id, block));
                    block
                }
            };

            resource_spans.scope_spans[block].spans.push(span);
        }
    }

    traces
}

#[cfg(test)]
mod tests {
    use opentelemetry_proto::tonic::common::v1::InstrumentationScope;
    use opentelemetry_proto::tonic::trace::v1::Span;

    use super::*;

    fn span(trace: u8, span: u8) -> Span {
        Span {
            trace_id: vec![trace; 16],
            span_id: vec![span; 8],
            ..Default::default()
        }
    }

    fn batch(scopes: Vec<(&str, Vec<Span>)>) -> ResourceSpans {
        ResourceSpans {
            scope_spans: scopes
                .into_iter()
                .map(|(name, spans)| ScopeSpans {
                    scope: Some(InstrumentationScope {
                        name: name.to_owned(),
                        ..Default::default()
                    }),
                    spans,
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_trace_id_display() {
        let id = TraceId::new([
            0x89, 0x14, 0x3b, 0x07, 0x63, 0x09, 0x5b, 0xd9, 0xc9, 0x95, 0x5e, 0x81, 0x75, 0xd1,
            0xfb, 0x23,
        ]);
        assert_eq!(id.to_string(), "89143b0763095bd9c9955e8175d1fb23");
    }

    #[test]
    fn test_trace_id_from_slice() {
        assert_eq!(TraceId::from_slice(&[7; 16]), Some(TraceId::new([7; 16])));
        assert_eq!(TraceId::from_slice(&[7; 8]), None);
        assert_eq!(TraceId::from_slice(&[]), None);
    }

    #[test]
    fn test_append_counts_spans() {
        let trace = TraceData::new();
        trace.append(batch(vec![("a", vec![span(1, 1), span(1, 2)])]));
        trace.append(batch(vec![("a", vec![span(1, 3)]), ("b", vec![span(1, 4)])]));

        assert_eq!(trace.span_count(), 4);
        assert_eq!(trace.batches().len(), 2);
    }

    #[test]
    fn test_snapshot_is_stable_across_appends() {
        let trace = TraceData::from_batches(vec![batch(vec![("a", vec![span(1, 1)])])]);
        let snapshot = trace.batches();

        trace.append(batch(vec![("a", vec![span(1, 2)])]));

        assert_eq!(snapshot.len(), 1);
        assert_eq!(trace.batches().len(), 2);
        assert_eq!(trace.span_count(), 2);
    }

    #[test]
    fn test_split_by_trace() {
        let input = batch(vec![
            ("http", vec![span(1, 1), span(2, 2), span(1, 3)]),
            ("db", vec![span(2, 4)]),
        ]);

        let traces = split_by_trace(input);
        assert_eq!(traces.len(), 2);

        let (first_id, first) = &traces[0];
        assert_eq!(*first_id, TraceId::new([1; 16]));
        assert_eq!(first.scope_spans.len(), 1);
        assert_eq!(first.scope_spans[0].spans.len(), 2);

        let (second_id, second) = &traces[1];
        assert_eq!(*second_id, TraceId::new([2; 16]));
        let scopes: Vec<_> = second
            .scope_spans
            .iter()
            .map(|s| s.scope.as_ref().map(|scope| scope.name.as_str()))
            .collect();
        assert_eq!(scopes, [Some("http"), Some("db")]);
    }

    #[test]
    fn test_split_by_trace_drops_malformed_ids() {
        let mut broken = span(1, 1);
        broken.trace_id = vec![1, 2, 3];

        let traces = split_by_trace(batch(vec![("http", vec![broken, span(3, 2)])]));
        assert_eq!(traces.len(), 1);
        assert_eq!(traces[0].0, TraceId::new([3; 16]));
    }
}
