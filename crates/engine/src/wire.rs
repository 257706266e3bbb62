use dataflow::{Bag, FlowErr};
use heap::{Heap, Val};

/// WireDiff is the client-facing form of a batch of collection changes:
/// rows as (key, values) pairs where an empty values array deletes the
/// key, under a watermark which strictly increases per instance.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireDiff {
    pub values: Vec<(serde_json::Value, Vec<serde_json::Value>)>,
    pub watermark: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_initial: Option<bool>,
}

/// WireValues is the client-facing result of a point read.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireValues {
    pub payload: Vec<serde_json::Value>,
    pub watermark: String,
}

/// Watermarks render as fixed-width hex so that their lexicographic
/// order matches their numeric order, while staying opaque to clients.
pub(crate) fn render_watermark(w: u64) -> String {
    format!("{w:016x}")
}

pub(crate) fn parse_watermark(w: &str) -> Option<u64> {
    (w.len() == 16).then(|| u64::from_str_radix(w, 16).ok()).flatten()
}

/// ErrorEnvelope is the wire form of an error value: an errored key
/// serializes its envelope in the values position of a diff.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ErrorEnvelope {
    pub error: serde_json::Value,
    pub retryable: bool,
}

impl From<&FlowErr> for ErrorEnvelope {
    fn from(err: &FlowErr) -> Self {
        Self {
            error: serde_json::Value::String(err.to_string()),
            retryable: err.retryable(),
        }
    }
}

pub(crate) fn error_envelope(err: &FlowErr) -> serde_json::Value {
    serde_json::to_value(ErrorEnvelope::from(err)).expect("envelopes serialize")
}

pub(crate) fn render_bag(heap: &Heap, bag: &Bag) -> Vec<serde_json::Value> {
    match bag {
        Bag::Values(vs) => vs.iter().map(|v| heap.to_json(*v)).collect(),
        Bag::Error(err) => vec![error_envelope(err)],
    }
}

/// Render changed rows as wire values; a missing bag is a deletion and
/// renders as an empty values array.
pub(crate) fn render_rows(
    heap: &Heap,
    rows: &[(Val, Option<Bag>)],
) -> Vec<(serde_json::Value, Vec<serde_json::Value>)> {
    rows.iter()
        .map(|(key, bag)| {
            let values = match bag {
                Some(bag) => render_bag(heap, bag),
                None => Vec::new(),
            };
            (heap.to_json(*key), values)
        })
        .collect()
}
