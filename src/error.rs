//! Error types for fast-talk.

use std::time::Duration;

/// Top-level error type for the service.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Job dispatch errors for the synchronous bypass path. Failures inside a
/// claimed background job are normalized into `fail_job` instead.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("No handler registered for job type {job_type}")]
    NoHandler { job_type: String },

    #[error("Handler for {job_type} failed: {reason}")]
    HandlerFailed { job_type: String, reason: String },
}

/// Retry classification for a failure.
///
/// Transient failures are worth re-running, permanent ones are not, and
/// anything unrecognized defaults to Unknown (not retried).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transient,
    Permanent,
    Unknown,
}

impl ErrorKind {
    /// Classify a raw error message by its text.
    ///
    /// Used at the worker boundary for errors that arrive without an
    /// explicit kind (panics, handler exceptions from foreign code).
    pub fn classify(message: &str) -> Self {
        let lower = message.to_lowercase();
        if lower.contains("timeout")
            || lower.contains("timed out")
            || lower.contains("connection refused")
            || lower.contains("connection reset")
            || lower.contains("rate limit")
            || lower.contains("too many requests")
            || lower.contains("temporarily unavailable")
        {
            ErrorKind::Transient
        } else if lower.contains("not found")
            || lower.contains("unauthorized")
            || lower.contains("forbidden")
            || lower.contains("invalid")
            || lower.contains("validation")
        {
            ErrorKind::Permanent
        } else {
            ErrorKind::Unknown
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Permanent => "permanent",
            ErrorKind::Unknown => "unknown",
        }
    }
}

/// Result type alias for the service.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_transient_messages() {
        assert_eq!(
            ErrorKind::classify("request timed out after 30s"),
            ErrorKind::Transient
        );
        assert_eq!(
            ErrorKind::classify("Connection refused (os error 111)"),
            ErrorKind::Transient
        );
        assert_eq!(
            ErrorKind::classify("429 Too Many Requests"),
            ErrorKind::Transient
        );
    }

    #[test]
    fn classify_permanent_messages() {
        assert_eq!(
            ErrorKind::classify("document not found"),
            ErrorKind::Permanent
        );
        assert_eq!(
            ErrorKind::classify("401 Unauthorized"),
            ErrorKind::Permanent
        );
        assert_eq!(
            ErrorKind::classify("invalid payload shape"),
            ErrorKind::Permanent
        );
    }

    #[test]
    fn classify_defaults_to_unknown() {
        assert_eq!(ErrorKind::classify("boom"), ErrorKind::Unknown);
        assert_eq!(ErrorKind::classify(""), ErrorKind::Unknown);
    }
}
