use chrono::{DateTime, Utc};
/// Documents and index instructions derived from change events
use serde::{Deserialize, Serialize};

use crate::quality::QualityMetadata;

/// Searchable projection of a document row.
///
/// `version` is the source offset of the change that produced this document
/// and doubles as the index's external version token. `record_version` is the
/// row's own version column and carries no ordering meaning for the index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectionDocument {
    pub id: String,
    pub title: String,
    pub status: String,
    #[serde(default)]
    pub created_by: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub content_size: Option<i64>,
    #[serde(default)]
    pub s3_key: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub record_version: Option<i64>,
    pub version: i64,
    #[serde(flatten)]
    pub quality: Option<QualityMetadata>,
}

/// A single instruction for the index store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum IndexOperation {
    Upsert(ProjectionDocument),
    /// Tombstone: remove the document unless a newer version is stored.
    Delete { id: String, version: i64 },
}

impl IndexOperation {
    pub fn identity(&self) -> &str {
        match self {
            IndexOperation::Upsert(doc) => &doc.id,
            IndexOperation::Delete { id, .. } => id,
        }
    }

    pub fn version(&self) -> i64 {
        match self {
            IndexOperation::Upsert(doc) => doc.version,
            IndexOperation::Delete { version, .. } => *version,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(self, IndexOperation::Delete { .. })
    }

    pub fn document(&self) -> Option<&ProjectionDocument> {
        match self {
            IndexOperation::Upsert(doc) => Some(doc),
            IndexOperation::Delete { .. } => None,
        }
    }
}
