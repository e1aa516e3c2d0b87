use async_trait::async_trait;
use elasticsearch::{
    http::transport::{BuildError, SingleNodeConnectionPool, TransportBuilder},
    indices::{IndicesCreateParts, IndicesExistsParts},
    BulkParts, Elasticsearch,
};
use event_schema::IndexOperation;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use super::index_store::{IndexStore, IndexStoreError, ItemOutcome};

#[derive(Debug, Error)]
pub enum ElasticsearchError {
    #[error("invalid Elasticsearch URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("failed to build transport: {0}")]
    TransportBuild(#[from] BuildError),
    #[error("transport error: {0}")]
    Transport(#[from] elasticsearch::Error),
    #[error("failed to create index {index}: HTTP {status}")]
    IndexCreation { index: String, status: u16 },
}

/// Bulk writer using external versioning (`version_type=external`)
#[derive(Clone)]
pub struct ElasticsearchIndexStore {
    client: Elasticsearch,
    index: String,
}

impl ElasticsearchIndexStore {
    pub async fn new(url: &str, index: &str) -> Result<Self, ElasticsearchError> {
        let parsed = Url::parse(url)?;
        let pool = SingleNodeConnectionPool::new(parsed);
        let transport = TransportBuilder::new(pool).build()?;
        let client = Elasticsearch::new(transport);

        let instance = Self {
            client,
            index: index.to_string(),
        };

        instance.ensure_document_index().await?;

        Ok(instance)
    }

    pub fn index_name(&self) -> &str {
        &self.index
    }

    async fn ensure_document_index(&self) -> Result<(), ElasticsearchError> {
        let exists_response = self
            .client
            .indices()
            .exists(IndicesExistsParts::Index(&[self.index.as_str()]))
            .send()
            .await?;

        if exists_response.status_code().is_success() {
            return Ok(());
        }

        let body = json!({
            "settings": {
                "number_of_shards": 3,
                "number_of_replicas": 1,
                "analysis": {
                    "analyzer": {
                        "title_analyzer": {
                            "type": "custom",
                            "tokenizer": "standard",
                            "filter": ["lowercase", "english_stop", "english_stemmer"]
                        }
                    },
                    "filter": {
                        "english_stop": {
                            "type": "stop",
                            "stopwords": "_english_"
                        },
                        "english_stemmer": {
                            "type": "stemmer",
                            "language": "english"
                        }
                    }
                }
            },
            "mappings": {
                "properties": {
                    "id": { "type": "keyword" },
                    "title": {
                        "type": "text",
                        "analyzer": "title_analyzer",
                        "fields": { "raw": { "type": "keyword", "ignore_above": 256 } }
                    },
                    "status": { "type": "keyword" },
                    "created_by": { "type": "keyword" },
                    "content_type": { "type": "keyword" },
                    "content_size": { "type": "long" },
                    "s3_key": { "type": "keyword" },
                    "created_at": { "type": "date" },
                    "updated_at": { "type": "date" },
                    "record_version": { "type": "long" },
                    "version": { "type": "long" },
                    "quality_score": { "type": "float" },
                    "quality_is_valid": { "type": "boolean" },
                    "has_pii": { "type": "boolean" },
                    "quality_issues": {
                        "type": "nested",
                        "properties": {
                            "type": { "type": "keyword" },
                            "severity": { "type": "keyword" },
                            "description": { "type": "text" },
                            "field": { "type": "keyword" }
                        }
                    },
                    "quality_checks": { "type": "object" },
                    "quality_checked_at": { "type": "date" },
                    "quality_provider": { "type": "keyword" },
                    "quality_model": { "type": "keyword" }
                }
            }
        });

        let response = self
            .client
            .indices()
            .create(IndicesCreateParts::Index(&self.index))
            .body(body)
            .send()
            .await?;

        let status = response.status_code();
        // 400 here is resource_already_exists from a concurrent creator
        if !status.is_success() && status.as_u16() != 400 {
            return Err(ElasticsearchError::IndexCreation {
                index: self.index.clone(),
                status: status.as_u16(),
            });
        }

        info!(index = %self.index, "Created document index");
        Ok(())
    }

    fn bulk_body(&self, operations: &[IndexOperation]) -> Result<Vec<String>, serde_json::Error> {
        let mut body_lines = Vec::with_capacity(operations.len() * 2);
        for op in operations {
            match op {
                IndexOperation::Upsert(doc) => {
                    let action = json!({ "index": {
                        "_index": &self.index,
                        "_id": &doc.id,
                        "version": doc.version,
                        "version_type": "external",
                    }});
                    body_lines.push(serde_json::to_string(&action)?);
                    body_lines.push(serde_json::to_string(doc)?);
                }
                IndexOperation::Delete { id, version } => {
                    let action = json!({ "delete": {
                        "_index": &self.index,
                        "_id": id,
                        "version": version,
                        "version_type": "external",
                    }});
                    body_lines.push(serde_json::to_string(&action)?);
                }
            }
        }
        Ok(body_lines)
    }
}

#[derive(Debug, Deserialize)]
struct BulkResponse {
    #[serde(default)]
    items: Vec<Value>,
}

/// Classify one `items[]` entry of a bulk response
fn item_outcome(item: &Value) -> ItemOutcome {
    let Some((action, result)) = item.as_object().and_then(|obj| obj.iter().next()) else {
        return ItemOutcome::Failed("malformed bulk item".to_string());
    };

    let status = result.get("status").and_then(Value::as_u64).unwrap_or(0);
    let reason = || {
        result
            .get("error")
            .map(|e| {
                let kind = e.get("type").and_then(Value::as_str).unwrap_or("unknown");
                let why = e.get("reason").and_then(Value::as_str).unwrap_or("");
                format!("{kind}: {why}")
            })
            .unwrap_or_else(|| format!("HTTP {status}"))
    };

    match status {
        200..=299 => ItemOutcome::Applied,
        // version_conflict_engine_exception: stored version is newer or equal
        409 => ItemOutcome::Stale,
        // deleting a document that was never indexed still records the version
        404 if action == "delete" => ItemOutcome::Applied,
        429 | 500..=599 | 0 => ItemOutcome::Failed(reason()),
        _ => ItemOutcome::Rejected(reason()),
    }
}

#[async_trait]
impl IndexStore for ElasticsearchIndexStore {
    async fn apply(
        &self,
        operations: &[IndexOperation],
    ) -> Result<Vec<ItemOutcome>, IndexStoreError> {
        if operations.is_empty() {
            return Ok(Vec::new());
        }

        let body_lines = self.bulk_body(operations)?;

        let response = self
            .client
            .bulk(BulkParts::None)
            .body(body_lines)
            .send()
            .await
            .map_err(|e| IndexStoreError::Unavailable(e.to_string()))?;

        let status = response.status_code();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(IndexStoreError::Unavailable(format!(
                "bulk request failed with HTTP {}",
                status.as_u16()
            )));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(IndexStoreError::Rejected(format!(
                "HTTP {}: {}",
                status.as_u16(),
                text
            )));
        }

        let parsed: BulkResponse = response
            .json()
            .await
            .map_err(|e| IndexStoreError::Unavailable(format!("unreadable bulk response: {e}")))?;

        if parsed.items.len() != operations.len() {
            return Err(IndexStoreError::Unavailable(format!(
                "bulk response has {} items for {} operations",
                parsed.items.len(),
                operations.len()
            )));
        }

        let outcomes: Vec<ItemOutcome> = parsed.items.iter().map(item_outcome).collect();
        debug!(
            index = %self.index,
            operations = operations.len(),
            applied = outcomes.iter().filter(|o| **o == ItemOutcome::Applied).count(),
            "Bulk request completed"
        );
        Ok(outcomes)
    }

    async fn health_check(&self) -> Result<(), IndexStoreError> {
        let response = self
            .client
            .ping()
            .send()
            .await
            .map_err(|e| IndexStoreError::Unavailable(e.to_string()))?;
        if response.status_code().is_success() {
            Ok(())
        } else {
            Err(IndexStoreError::Unavailable(format!(
                "Elasticsearch health check failed: HTTP {}",
                response.status_code().as_u16()
            )))
        }
    }
}
