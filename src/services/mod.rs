pub mod elasticsearch;

pub use self::elasticsearch::ElasticsearchAuditIndex;

use crate::error::IndexError;
use crate::models::AuditLogMessage;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

impl SortOrder {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortOrder::Asc => "asc",
            SortOrder::Desc => "desc",
        }
    }
}

/// Filters and paging for audit log searches. All filters are optional and
/// combined with AND semantics.
#[derive(Debug, Clone)]
pub struct LogSearchQuery {
    pub user_id: Option<String>,
    pub action: Option<String>,
    pub object_type: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    /// Free-text match over username, object representation, and action.
    pub text: Option<String>,
    pub page_size: i64,
    pub offset: i64,
    pub sort: SortOrder,
}

impl Default for LogSearchQuery {
    fn default() -> Self {
        Self {
            user_id: None,
            action: None,
            object_type: None,
            since: None,
            until: None,
            text: None,
            page_size: 50,
            offset: 0,
            sort: SortOrder::Desc,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LogSearchResults {
    pub items: Vec<AuditLogMessage>,
    pub total: i64,
    pub next_offset: i64,
    pub has_next: bool,
}

/// Document index operations the ingestion pipeline depends on.
///
/// The consumer and the DLQ inspector are written against this trait so
/// tests can substitute a fake store; `ElasticsearchAuditIndex` is the
/// production implementation.
#[async_trait]
pub trait AuditLogIndex: Send + Sync {
    /// Index one audit log. Idempotent: writing the same `log_id` twice
    /// overwrites rather than duplicating.
    async fn index_log(&self, log: &AuditLogMessage) -> Result<(), IndexError>;

    /// Bulk-index many audit logs; returns how many were indexed.
    async fn bulk_index_logs(&self, logs: &[AuditLogMessage]) -> Result<usize, IndexError>;

    async fn search_logs(&self, query: &LogSearchQuery) -> Result<LogSearchResults, IndexError>;

    async fn get_log_by_id(&self, log_id: &str) -> Result<AuditLogMessage, IndexError>;

    /// Connectivity check against the index backend.
    async fn ping(&self) -> Result<(), IndexError>;
}
