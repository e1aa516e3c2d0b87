use chrono::{DateTime, Utc};
/// Quality metadata attached to projected documents by the enrichment stage
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityIssue {
    /// "completeness", "consistency", "pii" or "language"
    #[serde(rename = "type")]
    pub issue_type: String,
    /// "low", "medium" or "high"
    pub severity: String,
    pub description: String,
    #[serde(default)]
    pub field: Option<String>,
}

/// Per-check scores on a 0-100 scale
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct QualityChecks {
    pub completeness: f64,
    pub consistency: f64,
    pub pii_detection: f64,
    pub language_quality: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityMetadata {
    pub quality_score: f64,
    pub quality_is_valid: bool,
    pub quality_issues: Vec<QualityIssue>,
    pub has_pii: bool,
    pub quality_checks: QualityChecks,
    pub quality_checked_at: DateTime<Utc>,
    pub quality_provider: String,
    pub quality_model: String,
}

impl QualityMetadata {
    /// Metadata recorded when the document body is empty.
    pub fn no_content(provider: &str, model: &str) -> Self {
        Self {
            quality_score: 0.0,
            quality_is_valid: false,
            quality_issues: vec![QualityIssue {
                issue_type: "completeness".to_string(),
                severity: "high".to_string(),
                description: "No content available".to_string(),
                field: Some("content".to_string()),
            }],
            has_pii: false,
            quality_checks: QualityChecks {
                completeness: 0.0,
                consistency: 0.0,
                pii_detection: 100.0,
                language_quality: 0.0,
            },
            quality_checked_at: Utc::now(),
            quality_provider: provider.to_string(),
            quality_model: model.to_string(),
        }
    }
}
