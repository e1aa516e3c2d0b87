use chrono::{DateTime, Utc};
/// Change-event schema for the document CDC pipeline
///
/// Typed representation of the Debezium-style envelopes published by the
/// capture connector, plus the projection documents derived from them.
/// Decoding is strict about identity and position (a record without a key or
/// offset cannot be applied idempotently) and lenient about everything else.
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

pub mod projection;
pub mod quality;
mod timestamp;

pub use projection::{IndexOperation, ProjectionDocument};
pub use quality::{QualityChecks, QualityIssue, QualityMetadata};
pub use timestamp::parse_timestamp;

/// Snapshot of a row as captured before or after a change.
pub type RecordSnapshot = Map<String, Value>;

/// Kind of row change carried by an envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    /// Map a connector operation code (`c`, `u`, `d`, `r`) or its long form.
    ///
    /// Snapshot reads (`r`) are projected like inserts.
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "c" | "r" | "create" | "insert" | "read" => Some(Operation::Create),
            "u" | "update" => Some(Operation::Update),
            "d" | "delete" => Some(Operation::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Create => write!(f, "create"),
            Operation::Update => write!(f, "update"),
            Operation::Delete => write!(f, "delete"),
        }
    }
}

/// Where an event was read from: stream (topic), partition and offset.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourcePosition {
    pub stream: String,
    pub partition: i32,
    pub offset: i64,
}

/// A raw record pulled from the change-event source, before decoding.
#[derive(Debug, Clone)]
pub struct SourceRecord {
    pub stream: String,
    pub partition: i32,
    /// Negative when the source could not report an offset.
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Option<Vec<u8>>,
    /// Broker timestamp in milliseconds, if any.
    pub timestamp_ms: Option<i64>,
}

impl SourceRecord {
    pub fn position(&self) -> SourcePosition {
        SourcePosition {
            stream: self.stream.clone(),
            partition: self.partition,
            offset: self.offset,
        }
    }
}

/// Errors raised while decoding a source record into a [`ChangeEvent`]
#[derive(Debug, thiserror::Error)]
pub enum EventDecodeError {
    /// Null payload; the connector emits these after deletes for log compaction.
    #[error("empty payload")]
    EmptyPayload,
    #[error("invalid envelope JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("envelope is missing the operation code")]
    MissingOperation,
    #[error("unknown operation code: {0}")]
    UnknownOperation(String),
    #[error("record key could not be determined")]
    MissingKey,
    #[error("record offset is missing or negative: {0}")]
    MissingOffset(i64),
}

impl EventDecodeError {
    /// Compaction tombstones are expected traffic, not data-quality problems.
    pub fn is_compaction_tombstone(&self) -> bool {
        matches!(self, EventDecodeError::EmptyPayload)
    }

    /// Stable label for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            EventDecodeError::EmptyPayload => "empty_payload",
            EventDecodeError::InvalidJson(_) => "invalid_json",
            EventDecodeError::MissingOperation => "missing_operation",
            EventDecodeError::UnknownOperation(_) => "unknown_operation",
            EventDecodeError::MissingKey => "missing_key",
            EventDecodeError::MissingOffset(_) => "missing_offset",
        }
    }
}

/// Typed representation of one captured row change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Record identity; same-key events are totally ordered within a partition.
    pub key: String,
    pub operation: Operation,
    pub before: Option<RecordSnapshot>,
    /// Absent on delete.
    pub after: Option<RecordSnapshot>,
    pub position: SourcePosition,
    pub captured_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct RawEnvelope {
    #[serde(default)]
    op: Option<String>,
    #[serde(default)]
    before: Option<Value>,
    #[serde(default)]
    after: Option<Value>,
    #[serde(default)]
    ts_ms: Option<i64>,
}

impl ChangeEvent {
    /// Decode a source record.
    ///
    /// Accepts both the bare envelope and the `{"schema": .., "payload": ..}`
    /// form produced when the connector runs with schemas enabled.
    pub fn decode(record: &SourceRecord) -> Result<Self, EventDecodeError> {
        if record.offset < 0 {
            return Err(EventDecodeError::MissingOffset(record.offset));
        }

        let payload = match record.payload.as_deref() {
            Some(p) if !p.iter().all(u8::is_ascii_whitespace) => p,
            _ => return Err(EventDecodeError::EmptyPayload),
        };

        let mut value: Value = serde_json::from_slice(payload)?;
        if value.is_null() {
            return Err(EventDecodeError::EmptyPayload);
        }
        if value.get("payload").map_or(false, Value::is_object) {
            value = value["payload"].take();
        }

        let raw: RawEnvelope = serde_json::from_value(value)?;
        let code = raw.op.ok_or(EventDecodeError::MissingOperation)?;
        let operation = Operation::from_code(&code)
            .ok_or_else(|| EventDecodeError::UnknownOperation(code.clone()))?;

        let before = into_snapshot(raw.before);
        let after = match operation {
            Operation::Delete => None,
            _ => into_snapshot(raw.after),
        };

        let key = record
            .key
            .as_deref()
            .and_then(key_from_bytes)
            .or_else(|| after.as_ref().and_then(identity_field))
            .or_else(|| before.as_ref().and_then(identity_field))
            .ok_or(EventDecodeError::MissingKey)?;

        let captured_at = raw
            .ts_ms
            .or(record.timestamp_ms)
            .and_then(DateTime::<Utc>::from_timestamp_millis);

        Ok(Self {
            key,
            operation,
            before,
            after,
            position: record.position(),
            captured_at,
        })
    }

    pub fn offset(&self) -> i64 {
        self.position.offset
    }

    pub fn partition(&self) -> i32 {
        self.position.partition
    }
}

fn into_snapshot(value: Option<Value>) -> Option<RecordSnapshot> {
    match value {
        Some(Value::Object(map)) => Some(map),
        _ => None,
    }
}

fn identity_field(snapshot: &RecordSnapshot) -> Option<String> {
    snapshot.get("id").and_then(scalar_to_string)
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Keys arrive as a raw string, a JSON string, or a JSON struct such as
/// `{"id": "..."}`. Structs with a single field use that field's value.
fn key_from_bytes(bytes: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(bytes).ok()?.trim();
    if text.is_empty() {
        return None;
    }

    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(mut map)) => {
            if let Some(payload) = map.remove("payload") {
                if let Value::Object(inner) = payload {
                    map = inner;
                } else {
                    return scalar_to_string(&payload);
                }
            }
            if let Some(id) = map.get("id").and_then(scalar_to_string) {
                return Some(id);
            }
            if map.len() == 1 {
                return map.values().next().and_then(scalar_to_string);
            }
            None
        }
        Ok(other @ (Value::String(_) | Value::Number(_))) => scalar_to_string(&other),
        Ok(Value::Null) => None,
        _ => Some(text.to_string()),
    }
}
