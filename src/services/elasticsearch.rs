use crate::error::IndexError;
use crate::models::AuditLogMessage;
use crate::services::{AuditLogIndex, LogSearchQuery, LogSearchResults};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use elasticsearch::{
    auth::Credentials,
    http::response::Response,
    http::transport::{SingleNodeConnectionPool, TransportBuilder},
    indices::{IndicesCreateParts, IndicesExistsParts},
    BulkParts, Elasticsearch, IndexParts, SearchParts,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};
use url::Url;

/// Elasticsearch-backed audit log index.
///
/// Documents are routed into one index per calendar month derived from the
/// message timestamp (`{prefix}-{YYYY.MM}`); reads fan out across the
/// `{prefix}-*` wildcard. Writes are upserts keyed by `log_id`, so retries
/// and replays never produce duplicate documents.
pub struct ElasticsearchAuditIndex {
    client: Elasticsearch,
    index_prefix: String,
    known_indices: Mutex<HashSet<String>>,
}

impl ElasticsearchAuditIndex {
    pub fn new(
        url: &str,
        username: Option<&str>,
        password: Option<&str>,
        index_prefix: &str,
    ) -> Result<Self, IndexError> {
        let parsed = Url::parse(url)?;
        let pool = SingleNodeConnectionPool::new(parsed);
        let mut builder = TransportBuilder::new(pool);
        if let (Some(user), Some(pass)) = (username, password) {
            builder = builder.auth(Credentials::Basic(user.to_string(), pass.to_string()));
        }
        let transport = builder.build()?;

        Ok(Self {
            client: Elasticsearch::new(transport),
            index_prefix: index_prefix.to_string(),
            known_indices: Mutex::new(HashSet::new()),
        })
    }

    fn index_for(&self, timestamp: &DateTime<Utc>) -> String {
        format!("{}-{}", self.index_prefix, timestamp.format("%Y.%m"))
    }

    fn wildcard(&self) -> String {
        format!("{}-*", self.index_prefix)
    }

    fn known_indices(&self) -> MutexGuard<'_, HashSet<String>> {
        self.known_indices.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create the monthly index with the audit log mapping unless it already
    /// exists. Results are cached so steady-state writes skip the exists
    /// round trip.
    async fn ensure_index(&self, index: &str) -> Result<(), IndexError> {
        if self.known_indices().contains(index) {
            return Ok(());
        }

        let exists_response = self
            .client
            .indices()
            .exists(IndicesExistsParts::Index(&[index]))
            .send()
            .await?;

        if !exists_response.status_code().is_success() {
            let response = self
                .client
                .indices()
                .create(IndicesCreateParts::Index(index))
                .body(audit_log_mapping())
                .send()
                .await?;

            let status = response.status_code();
            if !status.is_success() {
                let reason = response.text().await.unwrap_or_default();
                // Another writer may have created the index between the
                // exists check and this call.
                if !reason.contains("resource_already_exists_exception") {
                    return Err(error_for_status(status.as_u16(), reason));
                }
            }
        }

        self.known_indices().insert(index.to_string());
        Ok(())
    }
}

#[async_trait]
impl AuditLogIndex for ElasticsearchAuditIndex {
    async fn index_log(&self, log: &AuditLogMessage) -> Result<(), IndexError> {
        let index = self.index_for(&log.timestamp);
        self.ensure_index(&index).await?;

        let response = self
            .client
            .index(IndexParts::IndexId(&index, &log.log_id))
            .body(log)
            .send()
            .await?;
        check_response(response).await?;
        Ok(())
    }

    async fn bulk_index_logs(&self, logs: &[AuditLogMessage]) -> Result<usize, IndexError> {
        if logs.is_empty() {
            return Ok(0);
        }

        let indices: HashSet<String> = logs.iter().map(|log| self.index_for(&log.timestamp)).collect();
        for index in &indices {
            self.ensure_index(index).await?;
        }

        // NDJSON body: one action line and one document line per log.
        let mut body_lines = Vec::with_capacity(logs.len() * 2);
        for log in logs {
            let action = json!({
                "index": { "_index": self.index_for(&log.timestamp), "_id": log.log_id }
            });
            body_lines.push(serde_json::to_string(&action)?);
            body_lines.push(serde_json::to_string(log)?);
        }

        let response = self.client.bulk(BulkParts::None).body(body_lines).send().await?;
        let response = check_response(response).await?;

        let body: Value = response.json().await?;
        if body["errors"].as_bool().unwrap_or(false) {
            let failed = body["items"]
                .as_array()
                .map(|items| {
                    items
                        .iter()
                        .filter(|item| {
                            item["index"]["status"].as_u64().map_or(true, |s| s >= 300)
                        })
                        .count()
                })
                .unwrap_or(0);
            return Err(IndexError::Internal(format!(
                "bulk indexing failed for {failed} of {} documents",
                logs.len()
            )));
        }

        Ok(logs.len())
    }

    async fn search_logs(&self, query: &LogSearchQuery) -> Result<LogSearchResults, IndexError> {
        let wildcard = self.wildcard();
        let body = build_search_body(query);

        let response = self
            .client
            .search(SearchParts::Index(&[wildcard.as_str()]))
            .body(body)
            .send()
            .await?;
        let response = check_response(response).await?;

        let search_response: SearchResponse = response.json().await?;
        let total = search_response.hits.total.value;
        let items: Vec<AuditLogMessage> = search_response
            .hits
            .hits
            .into_iter()
            .filter_map(|hit| hit.source)
            .collect();

        let next_offset = query.offset.max(0) + items.len() as i64;
        Ok(LogSearchResults {
            has_next: next_offset < total,
            next_offset,
            total,
            items,
        })
    }

    async fn get_log_by_id(&self, log_id: &str) -> Result<AuditLogMessage, IndexError> {
        let wildcard = self.wildcard();
        let body = json!({
            "size": 1,
            "query": { "ids": { "values": [log_id] } }
        });

        let response = self
            .client
            .search(SearchParts::Index(&[wildcard.as_str()]))
            .body(body)
            .send()
            .await?;
        let response = check_response(response).await?;

        let search_response: SearchResponse = response.json().await?;
        search_response
            .hits
            .hits
            .into_iter()
            .filter_map(|hit| hit.source)
            .next()
            .ok_or_else(|| IndexError::NotFound(log_id.to_string()))
    }

    async fn ping(&self) -> Result<(), IndexError> {
        let response = self.client.ping().send().await?;
        check_response(response).await?;
        Ok(())
    }
}

/// Map a non-success response to a typed error: 4xx responses are structured
/// request rejections, everything else is an index-side fault.
async fn check_response(response: Response) -> Result<Response, IndexError> {
    let status = response.status_code();
    if status.is_success() {
        return Ok(response);
    }
    let reason = response.text().await.unwrap_or_default();
    Err(error_for_status(status.as_u16(), reason))
}

fn error_for_status(status: u16, reason: String) -> IndexError {
    if (400..500).contains(&status) {
        IndexError::Request { status, reason }
    } else {
        IndexError::Internal(format!("status {status}: {reason}"))
    }
}

fn build_search_body(query: &LogSearchQuery) -> Value {
    let size = query.page_size.clamp(1, 1000);
    let from = query.offset.max(0);

    let mut filter_clauses = Vec::new();
    if let Some(user_id) = &query.user_id {
        filter_clauses.push(json!({ "term": { "user_id": user_id } }));
    }
    if let Some(action) = &query.action {
        filter_clauses.push(json!({ "term": { "action": action } }));
    }
    if let Some(object_type) = &query.object_type {
        filter_clauses.push(json!({ "term": { "object_type": object_type } }));
    }
    if query.since.is_some() || query.until.is_some() {
        let mut range = serde_json::Map::new();
        if let Some(since) = &query.since {
            range.insert("gte".to_string(), json!(since.to_rfc3339()));
        }
        if let Some(until) = &query.until {
            range.insert("lte".to_string(), json!(until.to_rfc3339()));
        }
        filter_clauses.push(json!({ "range": { "timestamp": range } }));
    }

    let mut must_clauses = Vec::new();
    if let Some(text) = &query.text {
        must_clauses.push(json!({
            "multi_match": {
                "query": text,
                "fields": ["username", "object_repr", "action"],
                "type": "best_fields"
            }
        }));
    }

    let query_body = if must_clauses.is_empty() && filter_clauses.is_empty() {
        json!({ "match_all": {} })
    } else {
        json!({ "bool": { "must": must_clauses, "filter": filter_clauses } })
    };

    json!({
        "size": size,
        "from": from,
        "track_total_hits": true,
        "query": query_body,
        "sort": [
            { "timestamp": { "order": query.sort.as_str() } }
        ]
    })
}

fn audit_log_mapping() -> Value {
    json!({
        "settings": {
            "number_of_shards": 1,
            "number_of_replicas": 1
        },
        "mappings": {
            "properties": {
                "log_id": { "type": "keyword" },
                "timestamp": { "type": "date" },
                "user_id": { "type": "keyword" },
                "username": {
                    "type": "text",
                    "fields": {
                        "keyword": { "type": "keyword" }
                    }
                },
                "action": { "type": "keyword" },
                "object_type": { "type": "keyword" },
                "object_id": { "type": "keyword" },
                "object_repr": {
                    "type": "text",
                    "fields": {
                        "keyword": { "type": "keyword" }
                    }
                },
                "change_message": { "type": "flattened" },
                "ip_address": { "type": "ip" }
            }
        }
    })
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    hits: SearchHits,
}

#[derive(Debug, Deserialize)]
struct SearchHits {
    total: TotalHits,
    hits: Vec<LogHit>,
}

#[derive(Debug, Deserialize)]
struct TotalHits {
    value: i64,
}

#[derive(Debug, Deserialize)]
struct LogHit {
    #[serde(rename = "_source")]
    source: Option<AuditLogMessage>,
}
