//! Optional quality enrichment
//!
//! Runs between transformation and the index write. A validator scores the
//! document on four checks (completeness, consistency, PII, language) and the
//! result is attached to the document as quality metadata. The stage is
//! fail-open: a failed or timed-out validation indexes the document without
//! metadata.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use event_schema::{ProjectionDocument, QualityChecks, QualityIssue, QualityMetadata};
use resilience::{with_retry_if, with_timeout, ServiceConfig};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::metrics;
use crate::transform::FilterReason;

const COMPLETENESS_WEIGHT: f64 = 0.3;
const CONSISTENCY_WEIGHT: f64 = 0.3;
const PII_WEIGHT: f64 = 0.2;
const LANGUAGE_WEIGHT: f64 = 0.2;

#[derive(Debug, thiserror::Error)]
pub enum EnrichmentError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("provider returned HTTP {status}: {message}")]
    Provider { status: u16, message: String },
    #[error("invalid provider response: {0}")]
    InvalidResponse(String),
    #[error("validation timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl EnrichmentError {
    pub fn is_transient(&self) -> bool {
        match self {
            EnrichmentError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            EnrichmentError::Provider { status, .. } => *status == 429 || *status >= 500,
            EnrichmentError::InvalidResponse(_) => false,
            EnrichmentError::Timeout(_) => true,
        }
    }
}

#[async_trait]
pub trait QualityValidator: Send + Sync {
    fn provider(&self) -> &str;
    fn model(&self) -> &str;
    async fn validate(
        &self,
        document: &ProjectionDocument,
    ) -> Result<QualityMetadata, EnrichmentError>;
}

fn weighted_score(checks: &QualityChecks) -> f64 {
    checks.completeness * COMPLETENESS_WEIGHT
        + checks.consistency * CONSISTENCY_WEIGHT
        + checks.pii_detection * PII_WEIGHT
        + checks.language_quality * LANGUAGE_WEIGHT
}

fn issue(issue_type: &str, severity: &str, description: String, field: &str) -> QualityIssue {
    QualityIssue {
        issue_type: issue_type.to_string(),
        severity: severity.to_string(),
        description,
        field: Some(field.to_string()),
    }
}

// ============================================
// Heuristic validator
// ============================================

/// Offline rules; used when no LLM provider is configured
#[derive(Debug, Clone)]
pub struct HeuristicQualityValidator {
    min_quality_score: f64,
}

impl HeuristicQualityValidator {
    pub fn new(min_quality_score: f64) -> Self {
        Self { min_quality_score }
    }

    pub fn assess(&self, doc: &ProjectionDocument) -> QualityMetadata {
        let mut issues = Vec::new();

        let present = [
            doc.created_by.is_some(),
            doc.content_type.is_some(),
            doc.content_size.is_some(),
            doc.s3_key.is_some(),
            doc.created_at.is_some(),
        ];
        let filled = present.iter().filter(|p| **p).count() as f64;
        // title is always present after transformation
        let completeness = (1.0 + filled) / (1.0 + present.len() as f64) * 100.0;
        if completeness < 70.0 {
            issues.push(issue(
                "completeness",
                "medium",
                "Document metadata is incomplete".to_string(),
                "content",
            ));
        }

        let mut consistency: f64 = 100.0;
        if let (Some(created), Some(updated)) = (doc.created_at, doc.updated_at) {
            if updated < created {
                consistency -= 40.0;
                issues.push(issue(
                    "consistency",
                    "medium",
                    "updated_at precedes created_at".to_string(),
                    "updated_at",
                ));
            }
        }
        if matches!(doc.content_size, Some(size) if size < 0) {
            consistency -= 30.0;
            issues.push(issue(
                "consistency",
                "medium",
                "Negative content size".to_string(),
                "content_size",
            ));
        }
        if doc.s3_key.is_some() && doc.content_type.is_none() {
            consistency -= 30.0;
            issues.push(issue(
                "consistency",
                "medium",
                "Stored object has no content type".to_string(),
                "content_type",
            ));
        }

        let pii_types = detect_pii(&doc.title);
        let has_pii = !pii_types.is_empty();
        for pii_type in &pii_types {
            issues.push(issue("pii", "high", format!("Detected {pii_type}"), "title"));
        }
        let pii_detection = if has_pii { 0.0 } else { 100.0 };

        let language_quality = language_score(&doc.title);
        if language_quality < 70.0 {
            issues.push(issue(
                "language",
                "low",
                "Title reads poorly".to_string(),
                "title",
            ));
        }

        let checks = QualityChecks {
            completeness,
            consistency: consistency.max(0.0),
            pii_detection,
            language_quality,
        };
        let quality_score = weighted_score(&checks);

        QualityMetadata {
            quality_score,
            quality_is_valid: quality_score >= self.min_quality_score,
            quality_issues: issues,
            has_pii,
            quality_checks: checks,
            quality_checked_at: Utc::now(),
            quality_provider: self.provider().to_string(),
            quality_model: self.model().to_string(),
        }
    }
}

/// Email, phone and SSN-like tokens
fn detect_pii(text: &str) -> Vec<&'static str> {
    let mut found = Vec::new();
    for token in text.split_whitespace() {
        let token = token.trim_matches(|c: char| matches!(c, ',' | ';' | ':' | '"' | '\''));
        if let Some((local, domain)) = token.split_once('@') {
            if !local.is_empty() && domain.contains('.') && !found.contains(&"email") {
                found.push("email");
            }
            continue;
        }
        let digits = token.chars().filter(char::is_ascii_digit).count();
        let phone_like = token
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '+' | '-' | '(' | ')' | '.'));
        if phone_like && digits >= 9 && !found.contains(&"phone") {
            found.push("phone");
        }
    }
    found
}

fn language_score(title: &str) -> f64 {
    let letters: Vec<char> = title.chars().filter(|c| c.is_alphabetic()).collect();
    if letters.len() < 3 {
        return 20.0;
    }

    let mut score: f64 = 100.0;
    if letters.len() > 5 && letters.iter().all(|c| c.is_uppercase()) {
        score -= 40.0;
    }

    let mut run = 1;
    let mut longest = 1;
    let chars: Vec<char> = title.chars().collect();
    for pair in chars.windows(2) {
        if pair[0] == pair[1] {
            run += 1;
            longest = longest.max(run);
        } else {
            run = 1;
        }
    }
    if longest > 3 {
        score -= 30.0;
    }
    score.max(0.0)
}

#[async_trait]
impl QualityValidator for HeuristicQualityValidator {
    fn provider(&self) -> &str {
        "heuristic"
    }

    fn model(&self) -> &str {
        "rules-v1"
    }

    async fn validate(
        &self,
        document: &ProjectionDocument,
    ) -> Result<QualityMetadata, EnrichmentError> {
        Ok(self.assess(document))
    }
}

// ============================================
// LLM validator (OpenAI-compatible)
// ============================================

const SYSTEM_PROMPT: &str = "You are a document quality validator. Analyze documents and return structured quality assessments.";

#[derive(Debug, Clone)]
pub struct LlmQualityValidator {
    client: reqwest::Client,
    api_base: String,
    api_key: String,
    model: String,
    min_quality_score: f64,
    max_input_chars: usize,
}

impl LlmQualityValidator {
    pub fn new(api_base: &str, api_key: &str, model: &str, min_quality_score: f64) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base: api_base.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            min_quality_score,
            max_input_chars: 1000,
        }
    }

    fn build_prompt(&self, doc: &ProjectionDocument) -> String {
        let title: String = doc.title.chars().take(self.max_input_chars).collect();
        format!(
            r#"Document Title: {title}
Document Metadata: content_type={content_type}, content_size={content_size}, status={status}
Evaluate the following aspects and return JSON with this exact structure:
{{
  "completeness": {{"score": 0-100, "passed": true/false, "issues": ["issue1"]}},
  "consistency": {{"score": 0-100, "passed": true/false, "issues": ["issue1"]}},
  "pii_detection": {{"score": 0-100, "passed": true/false, "has_pii": true/false, "pii_types": ["email", "phone", "ssn"]}},
  "language_quality": {{"score": 0-100, "passed": true/false, "issues": []}}
}}
Completeness: the document has sufficient descriptive metadata.
Consistency: title matches the declared content, no contradictions.
PII Detection: emails, phone numbers, SSN, addresses.
Language Quality: grammar, spelling, clarity and professionalism of the title.
Return ONLY valid JSON, no additional text."#,
            content_type = doc.content_type.as_deref().unwrap_or("unknown"),
            content_size = doc
                .content_size
                .map(|s| s.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
            status = doc.status,
        )
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct CheckVerdict {
    #[serde(default)]
    score: f64,
    #[serde(default)]
    issues: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct PiiVerdict {
    #[serde(default = "full_score")]
    score: f64,
    #[serde(default)]
    has_pii: bool,
    #[serde(default)]
    pii_types: Vec<String>,
}

impl Default for PiiVerdict {
    fn default() -> Self {
        Self {
            score: full_score(),
            has_pii: false,
            pii_types: Vec::new(),
        }
    }
}

fn full_score() -> f64 {
    100.0
}

#[derive(Debug, Deserialize)]
struct LlmVerdict {
    #[serde(default)]
    completeness: CheckVerdict,
    #[serde(default)]
    consistency: CheckVerdict,
    #[serde(default)]
    pii_detection: PiiVerdict,
    #[serde(default)]
    language_quality: CheckVerdict,
}

fn parse_verdict(
    content: &str,
    provider: &str,
    model: &str,
    min_quality_score: f64,
) -> Result<QualityMetadata, EnrichmentError> {
    let verdict: LlmVerdict = serde_json::from_str(content)
        .map_err(|e| EnrichmentError::InvalidResponse(e.to_string()))?;

    let mut issues = Vec::new();
    issues.extend(
        verdict
            .completeness
            .issues
            .iter()
            .map(|d| issue("completeness", "medium", d.clone(), "content")),
    );
    issues.extend(
        verdict
            .consistency
            .issues
            .iter()
            .map(|d| issue("consistency", "medium", d.clone(), "title")),
    );
    issues.extend(
        verdict
            .pii_detection
            .pii_types
            .iter()
            .map(|t| issue("pii", "high", format!("Detected {t}"), "content")),
    );
    issues.extend(
        verdict
            .language_quality
            .issues
            .iter()
            .map(|d| issue("language", "low", d.clone(), "content")),
    );

    let checks = QualityChecks {
        completeness: verdict.completeness.score.clamp(0.0, 100.0),
        consistency: verdict.consistency.score.clamp(0.0, 100.0),
        pii_detection: verdict.pii_detection.score.clamp(0.0, 100.0),
        language_quality: verdict.language_quality.score.clamp(0.0, 100.0),
    };
    let quality_score = weighted_score(&checks);

    Ok(QualityMetadata {
        quality_score,
        quality_is_valid: quality_score >= min_quality_score,
        quality_issues: issues,
        has_pii: verdict.pii_detection.has_pii,
        quality_checks: checks,
        quality_checked_at: Utc::now(),
        quality_provider: provider.to_string(),
        quality_model: model.to_string(),
    })
}

#[async_trait]
impl QualityValidator for LlmQualityValidator {
    fn provider(&self) -> &str {
        "openai"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn validate(
        &self,
        document: &ProjectionDocument,
    ) -> Result<QualityMetadata, EnrichmentError> {
        let body = json!({
            "model": self.model,
            "temperature": 0,
            "response_format": { "type": "json_object" },
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": self.build_prompt(document) }
            ]
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.api_base))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(EnrichmentError::Provider {
                status: status.as_u16(),
                message,
            });
        }

        let completion: ChatCompletion = response.json().await?;
        let content = completion
            .choices
            .first()
            .and_then(|c| c.message.content.as_deref())
            .ok_or_else(|| EnrichmentError::InvalidResponse("empty completion".to_string()))?;

        debug!(identity = %document.id, model = %self.model, "LLM validation complete");
        parse_verdict(content, self.provider(), &self.model, self.min_quality_score)
    }
}

// ============================================
// Enrichment stage
// ============================================

#[derive(Debug, Clone, PartialEq)]
pub enum EnrichOutcome {
    Keep(ProjectionDocument),
    Filter(FilterReason),
}

pub struct Enricher {
    validator: Arc<dyn QualityValidator>,
    settings: ServiceConfig,
    block_low_quality: bool,
}

impl Enricher {
    pub fn new(
        validator: Arc<dyn QualityValidator>,
        settings: ServiceConfig,
        block_low_quality: bool,
    ) -> Self {
        Self {
            validator,
            settings,
            block_low_quality,
        }
    }

    pub async fn enrich(&self, mut doc: ProjectionDocument) -> EnrichOutcome {
        // Nothing uploaded yet
        if doc.s3_key.is_none() {
            return EnrichOutcome::Keep(doc);
        }

        if doc.content_size == Some(0) {
            doc.quality = Some(QualityMetadata::no_content(
                self.validator.provider(),
                self.validator.model(),
            ));
            metrics::record_enrichment("no_content");
            return EnrichOutcome::Keep(doc);
        }

        let validator = self.validator.as_ref();
        let per_attempt = self.settings.timeout.duration;
        let doc_ref = &doc;
        let result = with_retry_if(
            self.settings.retry.clone(),
            || async move {
                match with_timeout(per_attempt, validator.validate(doc_ref)).await {
                    Ok(result) => result,
                    Err(_) => Err(EnrichmentError::Timeout(per_attempt)),
                }
            },
            EnrichmentError::is_transient,
        )
        .await;

        match result {
            Ok(quality) if self.block_low_quality && !quality.quality_is_valid => {
                warn!(
                    identity = %doc.id,
                    score = quality.quality_score,
                    "Blocking low-quality document"
                );
                metrics::record_enrichment("blocked");
                EnrichOutcome::Filter(FilterReason::LowQuality {
                    score: quality.quality_score.round() as u32,
                })
            }
            Ok(quality) => {
                metrics::record_enrichment("scored");
                doc.quality = Some(quality);
                EnrichOutcome::Keep(doc)
            }
            Err(err) => {
                warn!(
                    identity = %doc.id,
                    error = %err,
                    "Quality validation failed; indexing without quality metadata"
                );
                metrics::record_enrichment("failed");
                EnrichOutcome::Keep(doc)
            }
        }
    }
}
