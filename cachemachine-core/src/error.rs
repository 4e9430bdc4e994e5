//! Error types for cache-machine operations

use crate::MethodName;
use thiserror::Error;

/// Configuration errors. Always fatal at construction.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Role \"{value}\" is not valid. Valid options: client/server/local")]
    InvalidRole { value: String },

    #[error("{collaborator} is required for the {role} role")]
    MissingCollaborator { role: String, collaborator: String },
}

/// Malformed change record errors. Logged and dropped, never fatal.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("modelName is required")]
    MissingModelName,

    #[error("methodName is required")]
    MissingMethodName,

    #[error("Unknown methodName: {value}")]
    UnknownMethod { value: String },

    #[error("data is required for {model_name}.{method}")]
    MissingData {
        model_name: String,
        method: MethodName,
    },

    #[error("model id is required for {model_name}.{method}")]
    MissingModelId {
        model_name: String,
        method: MethodName,
    },

    #[error("Malformed message: {reason}")]
    Malformed { reason: String },
}

/// Message bus errors. Logged, never retried.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Topic {topic} unavailable: {reason}")]
    TopicUnavailable { topic: String, reason: String },

    #[error("Subscription {subscription} on {topic} failed: {reason}")]
    SubscribeFailed {
        topic: String,
        subscription: String,
        reason: String,
    },

    #[error("Publish to {topic} failed: {reason}")]
    PublishFailed { topic: String, reason: String },

    #[error("Subscription {subscription} closed")]
    Closed { subscription: String },
}

/// Priming handshake errors. Surfaced through the readiness callback.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PrimingError {
    #[error("Priming timed out after {waited_ms}ms")]
    Timeout { waited_ms: u64 },

    #[error("Priming request failed: {reason}")]
    RequestFailed { reason: String },

    #[error("Priming aborted before a response arrived")]
    Aborted,
}

/// System-of-record errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    #[error("Unknown model: {model_name}")]
    UnknownModel { model_name: String },

    #[error("Query on {model_name} failed: {reason}")]
    QueryFailed { model_name: String, reason: String },

    #[error("Source lock poisoned")]
    LockPoisoned,
}

/// Event handler errors. Routed to the error handler, never re-raised.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HandlerError {
    #[error("Handler for {event} failed: {reason}")]
    Failed { event: String, reason: String },
}

impl HandlerError {
    pub fn failed(event: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Failed {
            event: event.into(),
            reason: reason.into(),
        }
    }
}

/// Master error type for all cache-machine errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Record error: {0}")]
    Record(#[from] RecordError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Priming error: {0}")]
    Priming(#[from] PrimingError),

    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("Handler error: {0}")]
    Handler(#[from] HandlerError),
}

/// Result type alias for cache-machine operations.
pub type CacheResult<T> = Result<T, CacheError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display_invalid_role() {
        let err = ConfigError::InvalidRole {
            value: "proxy".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("proxy"));
        assert!(msg.contains("client/server/local"));
    }

    #[test]
    fn test_record_error_display_missing_data() {
        let err = RecordError::MissingData {
            model_name: "Customer".to_string(),
            method: MethodName::Update,
        };
        assert_eq!(format!("{}", err), "data is required for Customer.update");
    }

    #[test]
    fn test_priming_error_display_timeout() {
        let err = PrimingError::Timeout { waited_ms: 1500 };
        let msg = format!("{}", err);
        assert!(msg.contains("timed out"));
        assert!(msg.contains("1500"));
    }

    #[test]
    fn test_transport_error_display_publish_failed() {
        let err = TransportError::PublishFailed {
            topic: "models__test".to_string(),
            reason: "offline".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("models__test"));
        assert!(msg.contains("offline"));
    }

    #[test]
    fn test_cache_error_from_variants() {
        let config = CacheError::from(ConfigError::MissingRequired {
            field: "environmentTag".to_string(),
        });
        assert!(matches!(config, CacheError::Config(_)));

        let record = CacheError::from(RecordError::MissingModelName);
        assert!(matches!(record, CacheError::Record(_)));

        let transport = CacheError::from(TransportError::Closed {
            subscription: "sub".to_string(),
        });
        assert!(matches!(transport, CacheError::Transport(_)));

        let priming = CacheError::from(PrimingError::Aborted);
        assert!(matches!(priming, CacheError::Priming(_)));

        let source = CacheError::from(SourceError::LockPoisoned);
        assert!(matches!(source, CacheError::Source(_)));

        let handler = CacheError::from(HandlerError::failed("Order.update", "boom"));
        assert!(matches!(handler, CacheError::Handler(_)));
    }
}
