//! Wire encoding of span batches.
//!
//! A [`TracePayload`] is what actually travels: a JSON body (gzipped once it
//! is large enough) plus the HTTP headers that describe it. Payloads are
//! immutable once built, so the exact bytes that failed to send are the bytes
//! written to, and later replayed from, the retry queue.

use crate::attributes::{AttributeValue, Attributes};
use crate::clock;
use crate::error::EncodeError;
use crate::span::Span;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;
use sha1::{Digest, Sha1};
use std::io::Write;
use std::sync::Arc;

pub const HEADER_API_KEY: &str = "Bugsnag-Api-Key";
pub const HEADER_CONTENT_TYPE: &str = "Content-Type";
pub const HEADER_CONTENT_ENCODING: &str = "Content-Encoding";
pub const HEADER_CONTENT_LENGTH: &str = "Content-Length";
pub const HEADER_INTEGRITY: &str = "Bugsnag-Integrity";
pub const HEADER_SPAN_SAMPLING: &str = "Bugsnag-Span-Sampling";
pub const HEADER_SAMPLING_PROBABILITY: &str = "Bugsnag-Sampling-Probability";

/// Bodies at least this large are gzipped.
pub const GZIP_THRESHOLD: usize = 128;

/// An encoded batch ready for delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracePayload {
    /// Creation time in unix nanoseconds; also names the retry file.
    pub timestamp: u64,
    pub body: Vec<u8>,
    /// Headers in the order they are sent.
    pub headers: Vec<(String, String)>,
}

impl TracePayload {
    pub fn new(timestamp: u64, body: Vec<u8>, headers: Vec<(String, String)>) -> Self {
        Self {
            timestamp,
            body,
            headers,
        }
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Builds [`TracePayload`]s for one project.
#[derive(Debug, Clone)]
pub struct PayloadEncoder {
    api_key: String,
    report_sampling: bool,
}

impl PayloadEncoder {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            report_sampling: true,
        }
    }

    /// Whether to send the `Bugsnag-Span-Sampling` header. Disabled when the
    /// sampling probability is pinned by configuration.
    pub fn with_sampling_header(mut self, enabled: bool) -> Self {
        self.report_sampling = enabled;
        self
    }

    pub fn encode(
        &self,
        spans: &[Arc<Span>],
        resource: &Attributes,
    ) -> Result<TracePayload, EncodeError> {
        let body = serde_json::to_vec(&WireTrace::new(spans, resource))?;
        let sampling = self.report_sampling.then(|| sampling_header(spans));
        self.finish(body, sampling)
    }

    /// An empty payload whose only purpose is to get a sampling probability
    /// back from the server.
    pub fn probability_request(&self) -> Result<TracePayload, EncodeError> {
        let body = br#"{"resourceSpans":[]}"#.to_vec();
        self.finish(body, Some("1.0:0".to_owned()))
    }

    fn finish(&self, body: Vec<u8>, sampling: Option<String>) -> Result<TracePayload, EncodeError> {
        let mut headers = vec![
            (HEADER_API_KEY.to_owned(), self.api_key.clone()),
            (HEADER_CONTENT_TYPE.to_owned(), "application/json".to_owned()),
        ];

        let body = if body.len() >= GZIP_THRESHOLD {
            let mut encoder = GzEncoder::new(Vec::with_capacity(body.len() / 2), Compression::default());
            encoder.write_all(&body)?;
            headers.push((HEADER_CONTENT_ENCODING.to_owned(), "gzip".to_owned()));
            encoder.finish()?
        } else {
            body
        };

        headers.push((HEADER_CONTENT_LENGTH.to_owned(), body.len().to_string()));
        headers.push((
            HEADER_INTEGRITY.to_owned(),
            format!("sha1 {}", hex::encode(Sha1::digest(&body))),
        ));
        if let Some(sampling) = sampling {
            headers.push((HEADER_SPAN_SAMPLING.to_owned(), sampling));
        }

        Ok(TracePayload::new(clock::unix_nanos_now(), body, headers))
    }
}

/// `"<p>:<count>;..."` in ascending probability order.
fn sampling_header(spans: &[Arc<Span>]) -> String {
    let mut counts: Vec<(f64, usize)> = Vec::new();
    for span in spans {
        let p = span.sampling_probability();
        match counts.iter_mut().find(|(q, _)| *q == p) {
            Some((_, n)) => *n += 1,
            None => counts.push((p, 1)),
        }
    }
    counts.sort_by(|a, b| a.0.total_cmp(&b.0));
    counts
        .iter()
        .map(|(p, n)| format!("{p:?}:{n}"))
        .collect::<Vec<_>>()
        .join(";")
}

// =============================================================================
// WIRE FORMAT
// =============================================================================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireTrace {
    resource_spans: Vec<WireResourceSpans>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireResourceSpans {
    resource: WireResource,
    scope_spans: Vec<WireScopeSpans>,
}

#[derive(Serialize)]
struct WireResource {
    attributes: Vec<WireAttribute>,
}

#[derive(Serialize)]
struct WireScopeSpans {
    spans: Vec<WireSpan>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireSpan {
    name: String,
    kind: u8,
    span_id: String,
    trace_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    parent_span_id: Option<String>,
    start_time_unix_nano: String,
    end_time_unix_nano: String,
    attributes: Vec<WireAttribute>,
    #[serde(skip_serializing_if = "is_zero")]
    dropped_attributes_count: u32,
}

#[derive(Serialize)]
struct WireAttribute {
    key: String,
    value: WireValue,
}

#[derive(Serialize)]
enum WireValue {
    #[serde(rename = "stringValue")]
    String(String),
    /// OTLP JSON carries 64-bit ints as strings.
    #[serde(rename = "intValue")]
    Int(String),
    /// Non-finite values serialize as `null`.
    #[serde(rename = "doubleValue")]
    Double(f64),
    #[serde(rename = "boolValue")]
    Bool(bool),
    #[serde(rename = "arrayValue")]
    Array { values: Vec<WireValue> },
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_zero(n: &u32) -> bool {
    *n == 0
}

impl WireTrace {
    fn new(spans: &[Arc<Span>], resource: &Attributes) -> Self {
        WireTrace {
            resource_spans: vec![WireResourceSpans {
                resource: WireResource {
                    attributes: wire_attributes(resource),
                },
                scope_spans: vec![WireScopeSpans {
                    spans: spans.iter().map(|s| WireSpan::from(s.as_ref())).collect(),
                }],
            }],
        }
    }
}

impl From<&Span> for WireSpan {
    fn from(span: &Span) -> Self {
        let end_time = span.end_time().unwrap_or_else(|| span.start_time());
        WireSpan {
            name: span.name(),
            kind: span.kind().ordinal(),
            span_id: format!("{:016x}", span.span_id()),
            trace_id: format!("{:032x}", span.trace_id()),
            parent_span_id: (span.parent_span_id() != 0)
                .then(|| format!("{:016x}", span.parent_span_id())),
            start_time_unix_nano: clock::to_unix_nanos(span.start_time()).to_string(),
            end_time_unix_nano: clock::to_unix_nanos(end_time).to_string(),
            attributes: wire_attributes(&span.attributes()),
            dropped_attributes_count: span.dropped_attributes_count(),
        }
    }
}

impl From<&AttributeValue> for WireValue {
    fn from(value: &AttributeValue) -> Self {
        match value {
            AttributeValue::String(s) => WireValue::String(s.clone()),
            AttributeValue::Int(i) => WireValue::Int(i.to_string()),
            AttributeValue::Double(d) => WireValue::Double(*d),
            AttributeValue::Bool(b) => WireValue::Bool(*b),
            AttributeValue::Array(values) => WireValue::Array {
                values: values.iter().map(WireValue::from).collect(),
            },
        }
    }
}

fn wire_attributes(attributes: &Attributes) -> Vec<WireAttribute> {
    attributes
        .iter()
        .map(|(key, value)| WireAttribute {
            key: key.to_owned(),
            value: WireValue::from(value),
        })
        .collect()
}
