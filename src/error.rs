use elasticsearch::http::transport::BuildError;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Failure categories for audit log processing.
///
/// The category decides both the metrics bucket and whether a failed index
/// write is retried or routed straight to the DLQ.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Validation,
    RequestError,
    Network,
    Internal,
    Serialization,
    Unknown,
}

impl ErrorCategory {
    /// Classify a typed index client error into a category.
    ///
    /// Request errors whose reason mentions a mapping conflict or an illegal
    /// argument are payload problems, not index problems, and are reported
    /// as `Validation`.
    pub fn from_index_error(error: &IndexError) -> Self {
        match error {
            IndexError::Request { reason, .. } => {
                let reason = reason.to_lowercase();
                if reason.contains("mapping")
                    || reason.contains("mapper_parsing")
                    || reason.contains("illegal_argument")
                {
                    ErrorCategory::Validation
                } else {
                    ErrorCategory::RequestError
                }
            }
            IndexError::NotFound(_) => ErrorCategory::RequestError,
            IndexError::InvalidUrl(_) | IndexError::TransportBuild(_) | IndexError::Transport(_) => {
                ErrorCategory::Network
            }
            IndexError::Internal(_) => ErrorCategory::Internal,
            IndexError::Serde(_) => ErrorCategory::Serialization,
        }
    }

    /// Whether a failed index write in this category is worth another
    /// attempt. Malformed documents will not become well-formed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCategory::Network | ErrorCategory::Internal | ErrorCategory::Unknown
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Validation => "validation",
            ErrorCategory::RequestError => "request_error",
            ErrorCategory::Network => "network",
            ErrorCategory::Internal => "internal",
            ErrorCategory::Serialization => "serialization",
            ErrorCategory::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced by the document index client.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("invalid Elasticsearch URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("failed to build transport: {0}")]
    TransportBuild(#[from] BuildError),
    #[error("transport error: {0}")]
    Transport(#[from] elasticsearch::Error),
    #[error("index rejected request (status {status}): {reason}")]
    Request { status: u16, reason: String },
    #[error("index internal error: {0}")]
    Internal(String),
    #[error("document not found: {0}")]
    NotFound(String),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Fatal broker-side failures: connect, subscribe, and topic administration.
///
/// Per-message failures never surface through this type; they are resolved
/// inside the processing loop.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),
    #[error("topic {topic} admin operation failed: {reason}")]
    Admin { topic: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(status: u16, reason: &str) -> IndexError {
        IndexError::Request {
            status,
            reason: reason.to_string(),
        }
    }

    #[test]
    fn test_mapping_conflict_classified_as_validation() {
        let err = request(400, "mapper_parsing_exception: failed to parse field [change_message]");
        assert_eq!(
            ErrorCategory::from_index_error(&err),
            ErrorCategory::Validation
        );

        let err = request(400, "Strict_Dynamic_Mapping_Exception: mapping set to strict");
        assert_eq!(
            ErrorCategory::from_index_error(&err),
            ErrorCategory::Validation
        );

        let err = request(400, "illegal_argument_exception: sort field must be keyword");
        assert_eq!(
            ErrorCategory::from_index_error(&err),
            ErrorCategory::Validation
        );
    }

    #[test]
    fn test_other_request_errors_classified_as_request_error() {
        let err = request(429, "circuit_breaking_exception: too many requests");
        assert_eq!(
            ErrorCategory::from_index_error(&err),
            ErrorCategory::RequestError
        );
    }

    #[test]
    fn test_not_found_classified_as_request_error() {
        let err = IndexError::NotFound("abc-1".to_string());
        assert_eq!(
            ErrorCategory::from_index_error(&err),
            ErrorCategory::RequestError
        );
    }

    #[test]
    fn test_transport_errors_classified_as_network() {
        let err = IndexError::Transport(elasticsearch::Error::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "connection refused",
        )));
        assert_eq!(
            ErrorCategory::from_index_error(&err),
            ErrorCategory::Network
        );

        let err = IndexError::InvalidUrl(url::Url::parse("not a url").unwrap_err());
        assert_eq!(
            ErrorCategory::from_index_error(&err),
            ErrorCategory::Network
        );
    }

    #[test]
    fn test_internal_and_serde_classification() {
        let err = IndexError::Internal("status 503: unavailable".to_string());
        assert_eq!(
            ErrorCategory::from_index_error(&err),
            ErrorCategory::Internal
        );

        let serde_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert_eq!(
            ErrorCategory::from_index_error(&IndexError::Serde(serde_err)),
            ErrorCategory::Serialization
        );
    }

    #[test]
    fn test_retryable_categories() {
        assert!(ErrorCategory::Network.is_retryable());
        assert!(ErrorCategory::Internal.is_retryable());
        assert!(ErrorCategory::Unknown.is_retryable());
        assert!(!ErrorCategory::Validation.is_retryable());
        assert!(!ErrorCategory::RequestError.is_retryable());
        assert!(!ErrorCategory::Serialization.is_retryable());
    }

    #[test]
    fn test_category_wire_names() {
        assert_eq!(ErrorCategory::RequestError.to_string(), "request_error");
        assert_eq!(
            serde_json::to_string(&ErrorCategory::Network).unwrap(),
            "\"network\""
        );
        let parsed: ErrorCategory = serde_json::from_str("\"serialization\"").unwrap();
        assert_eq!(parsed, ErrorCategory::Serialization);
    }
}
