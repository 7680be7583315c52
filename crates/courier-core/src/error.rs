//! Error taxonomy for the messaging pipeline.
//!
//! Errors are classified by behavior rather than by origin: the consumer
//! decides between the retry queue and the dead-letter queue based on
//! `is_retryable`, so every variant carries enough context for that call.
//! Breaker rejection is deliberately a separate variant from timeout so
//! callers can tell a refused call apart from a slow one.

use thiserror::Error;

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, CourierError>;

/// Error type shared across the store, broker, cache, and webhook seams.
#[derive(Debug, Clone, Error)]
pub enum CourierError {
    /// Durable store operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the store failure
        message: String,
    },

    /// Broker operation failed.
    #[error("queue error: {message}")]
    Queue {
        /// Description of the broker failure
        message: String,
    },

    /// Deduplication cache operation failed.
    #[error("cache error: {message}")]
    Cache {
        /// Description of the cache failure
        message: String,
    },

    /// No message record exists for the given id.
    #[error("message {id} not found")]
    NotFound {
        /// The id that had no backing record
        id: String,
    },

    /// The id on a queue payload is not a valid 24-hex identifier.
    #[error("invalid message id: {value}")]
    InvalidId {
        /// The rejected id value
        value: String,
    },

    /// A queue delivery could not be decoded.
    #[error("malformed payload: {message}")]
    MalformedPayload {
        /// Description of the decode failure
        message: String,
    },

    /// The webhook answered with a non-success status.
    #[error("webhook returned status {status}")]
    WebhookStatus {
        /// HTTP status code from the webhook
        status: u16,
    },

    /// An outbound call exceeded its deadline.
    #[error("request timeout after {timeout_seconds}s")]
    Timeout {
        /// The deadline that was exceeded, in seconds
        timeout_seconds: u64,
    },

    /// Transport-level failure reaching a collaborator.
    #[error("network error: {message}")]
    Network {
        /// Description of the transport failure
        message: String,
    },

    /// The circuit breaker refused the call outright.
    #[error("circuit breaker open for {resource}")]
    CircuitOpen {
        /// Name of the protected resource
        resource: String,
    },

    /// The rate limiter could not grant a slot in time.
    #[error("rate limited: {message}")]
    RateLimited {
        /// Description of the aborted wait
        message: String,
    },

    /// Invalid client or engine configuration.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the configuration problem
        message: String,
    },
}

impl CourierError {
    /// Creates a storage error from a message.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage { message: message.into() }
    }

    /// Creates a queue error from a message.
    pub fn queue(message: impl Into<String>) -> Self {
        Self::Queue { message: message.into() }
    }

    /// Creates a cache error from a message.
    pub fn cache(message: impl Into<String>) -> Self {
        Self::Cache { message: message.into() }
    }

    /// Creates a not-found error for a message id.
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound { id: id.into() }
    }

    /// Creates an invalid-id error.
    pub fn invalid_id(value: impl Into<String>) -> Self {
        Self::InvalidId { value: value.into() }
    }

    /// Creates a malformed-payload error.
    pub fn malformed_payload(message: impl Into<String>) -> Self {
        Self::MalformedPayload { message: message.into() }
    }

    /// Creates a webhook status error.
    pub fn webhook_status(status: u16) -> Self {
        Self::WebhookStatus { status }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout_seconds: u64) -> Self {
        Self::Timeout { timeout_seconds }
    }

    /// Creates a network error from a message.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network { message: message.into() }
    }

    /// Creates a circuit-open error for a protected resource.
    pub fn circuit_open(resource: impl Into<String>) -> Self {
        Self::CircuitOpen { resource: resource.into() }
    }

    /// Creates a rate-limited error.
    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::RateLimited { message: message.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Whether the consumer should route the delivery to the retry queue.
    ///
    /// Dependency blips, timeouts, webhook failures of any status, breaker
    /// rejection, and limiter exhaustion are all retry-eligible. Poison
    /// conditions (undecodable payloads, invalid ids, missing records) and
    /// configuration mistakes are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Storage { .. }
            | Self::Queue { .. }
            | Self::Cache { .. }
            | Self::WebhookStatus { .. }
            | Self::Timeout { .. }
            | Self::Network { .. }
            | Self::CircuitOpen { .. }
            | Self::RateLimited { .. } => true,

            Self::NotFound { .. }
            | Self::InvalidId { .. }
            | Self::MalformedPayload { .. }
            | Self::Configuration { .. } => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors_identified_correctly() {
        assert!(CourierError::storage("connection reset").is_retryable());
        assert!(CourierError::queue("channel closed").is_retryable());
        assert!(CourierError::cache("read timed out").is_retryable());
        assert!(CourierError::webhook_status(500).is_retryable());
        assert!(CourierError::webhook_status(404).is_retryable());
        assert!(CourierError::timeout(30).is_retryable());
        assert!(CourierError::network("connection refused").is_retryable());
        assert!(CourierError::circuit_open("webhook-client").is_retryable());

        assert!(!CourierError::not_found("abc").is_retryable());
        assert!(!CourierError::invalid_id("not-hex").is_retryable());
        assert!(!CourierError::malformed_payload("expected JSON").is_retryable());
        assert!(!CourierError::configuration("bad URL").is_retryable());
    }

    #[test]
    fn breaker_rejection_is_distinct_from_timeout() {
        let open = CourierError::circuit_open("webhook-client");
        let timeout = CourierError::timeout(30);

        assert!(matches!(open, CourierError::CircuitOpen { .. }));
        assert!(matches!(timeout, CourierError::Timeout { .. }));
        assert_ne!(open.to_string(), timeout.to_string());
    }

    #[test]
    fn error_display_format() {
        assert_eq!(
            CourierError::circuit_open("mongodb-repository").to_string(),
            "circuit breaker open for mongodb-repository"
        );
        assert_eq!(CourierError::timeout(5).to_string(), "request timeout after 5s");
        assert_eq!(
            CourierError::webhook_status(503).to_string(),
            "webhook returned status 503"
        );
    }
}
