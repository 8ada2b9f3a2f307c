use crate::error::ErrorCategory;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Audit log message as produced upstream.
///
/// Only `log_id` and `timestamp` are required; everything else the producer
/// attaches (`user_id`, `action`, `object_type`, `change_message`, ...) is
/// carried through unchanged and lands in the index as-is.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLogMessage {
    /// Globally unique id, used as the index document id.
    pub log_id: String,
    /// Event time; drives monthly index routing and sort order.
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl AuditLogMessage {
    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.extra.get(key)
    }
}

/// Envelope published to the dead-letter stream for every terminally failed
/// message. Immutable once created; reprocessing never removes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEnvelope {
    /// The failed payload: a parsed object when the payload was valid JSON,
    /// otherwise the raw string.
    pub original_message: Value,
    pub error: String,
    pub error_type: ErrorCategory,
    pub offset: i64,
    pub failed_at: DateTime<Utc>,
    pub consumer_name: String,
}

impl DlqEnvelope {
    /// Build an envelope from a failed payload. Payloads that are not valid
    /// JSON are embedded as a raw string rather than re-parsed.
    pub fn from_failure(
        payload: &[u8],
        error: String,
        error_type: ErrorCategory,
        offset: i64,
        consumer_name: &str,
    ) -> Self {
        let original_message = match serde_json::from_slice::<Value>(payload) {
            Ok(value) => value,
            Err(_) => Value::String(String::from_utf8_lossy(payload).into_owned()),
        };

        Self {
            original_message,
            error,
            error_type,
            offset,
            failed_at: Utc::now(),
            consumer_name: consumer_name.to_string(),
        }
    }

    /// Extract the original audit log for replay, accepting both a
    /// structured object and a JSON string form of `original_message`.
    pub fn original_log(&self) -> Result<AuditLogMessage, serde_json::Error> {
        match &self.original_message {
            Value::String(raw) => serde_json::from_str(raw),
            other => serde_json::from_value(other.clone()),
        }
    }
}
