//! Mapping of change events to index operations
//!
//! `transform` is pure: the same event always yields the same outcome, and the
//! caller sees outcomes in the order it asks for them.

use event_schema::{
    parse_timestamp, ChangeEvent, IndexOperation, Operation, ProjectionDocument, RecordSnapshot,
};
use serde_json::Value;

pub const DEFAULT_STATUS: &str = "created";

/// Why an event produced no index operation. Not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterReason {
    /// Create/update without an after-state
    MissingAfterState,
    /// `title` absent, not a string, or blank
    MissingTitle,
    /// Rejected by the quality stage
    LowQuality { score: u32 },
}

impl FilterReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterReason::MissingAfterState => "missing_after_state",
            FilterReason::MissingTitle => "missing_title",
            FilterReason::LowQuality { .. } => "low_quality",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransformOutcome {
    Index(IndexOperation),
    Skip(FilterReason),
}

pub fn transform(event: &ChangeEvent) -> TransformOutcome {
    let version = event.offset();

    match event.operation {
        Operation::Delete => TransformOutcome::Index(IndexOperation::Delete {
            id: event.key.clone(),
            version,
        }),
        Operation::Create | Operation::Update => {
            let Some(after) = event.after.as_ref() else {
                return TransformOutcome::Skip(FilterReason::MissingAfterState);
            };
            match build_document(&event.key, after, version) {
                Some(doc) => TransformOutcome::Index(IndexOperation::Upsert(doc)),
                None => TransformOutcome::Skip(FilterReason::MissingTitle),
            }
        }
    }
}

fn build_document(id: &str, after: &RecordSnapshot, version: i64) -> Option<ProjectionDocument> {
    let title = string_field(after, "title")?;

    Some(ProjectionDocument {
        id: id.to_string(),
        title,
        status: string_field(after, "status").unwrap_or_else(|| DEFAULT_STATUS.to_string()),
        created_by: string_field(after, "created_by"),
        content_type: string_field(after, "content_type"),
        content_size: int_field(after, "content_size"),
        s3_key: string_field(after, "s3_key"),
        created_at: after.get("created_at").and_then(parse_timestamp),
        updated_at: after.get("updated_at").and_then(parse_timestamp),
        record_version: int_field(after, "version"),
        version,
        quality: None,
    })
}

/// Non-blank string, or a number/uuid rendered as text
fn string_field(snapshot: &RecordSnapshot, field: &str) -> Option<String> {
    match snapshot.get(field)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn int_field(snapshot: &RecordSnapshot, field: &str) -> Option<i64> {
    match snapshot.get(field)? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
