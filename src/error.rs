//! Error taxonomy for the collection & alignment engine.
//!
//! Every component recovers what it can locally (rate limiter slows,
//! circuit breaker opens, collectors retry) and surfaces a typed error
//! upward. Only the orchestrator turns these into task-level status;
//! nothing in this crate calls `process::exit` during normal operation.

use thiserror::Error;

/// Taxonomy of errors a collection attempt can produce.
///
/// The variant a collector assigns drives pattern detection in the
/// health analyzer (`RATE_LIMITING`, `NETWORK_TIMEOUT`, ...) and the
/// orchestrator's retry policy.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Timeout, HTTP 5xx, connection refused. Retried with exponential backoff.
    #[error("transient error from {source}: {message}")]
    Transient { source: String, message: String },

    /// HTTP 429 or an explicit rate-limit message. Retried with longer backoff.
    #[error("throttled by {source}: {message}")]
    Throttling { source: String, message: String },

    /// Parse succeeded but produced zero items or missing required fields.
    /// Not retried; requires manual intervention.
    #[error("schema error from {source}: {message}")]
    Schema { source: String, message: String },

    /// Per-row violation in staging. Row-level only; never aborts the batch.
    #[error("validation error: {message}")]
    Validation { message: String },

    /// Game-id could not be mapped to a canonical game.
    #[error("resolution failure for external id {external_id}: {message}")]
    Resolution { external_id: String, message: String },

    /// Unrecoverable: programmer error, DB connection loss beyond retry,
    /// plan deadline exceeded. Surfaced to the orchestrator, never a process exit.
    #[error("fatal error: {message}")]
    Fatal { message: String },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl PipelineError {
    pub fn transient(source: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transient {
            source: source.into(),
            message: message.into(),
        }
    }

    pub fn throttling(source: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Throttling {
            source: source.into(),
            message: message.into(),
        }
    }

    pub fn schema(source: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Schema {
            source: source.into(),
            message: message.into(),
        }
    }

    /// Whether this error category is retried by the task executor.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::Throttling { .. })
    }

    /// Source name this error originated from, if applicable.
    pub fn source_name(&self) -> Option<&str> {
        match self {
            Self::Transient { source, .. }
            | Self::Throttling { source, .. }
            | Self::Schema { source, .. } => Some(source),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_and_throttling_are_retryable() {
        assert!(PipelineError::transient("odds_api", "timeout").is_retryable());
        assert!(PipelineError::throttling("odds_api", "429").is_retryable());
        assert!(!PipelineError::schema("odds_api", "empty").is_retryable());
        assert!(!PipelineError::Fatal {
            message: "boom".into()
        }
        .is_retryable());
    }

    #[test]
    fn source_name_extracted_for_collector_errors() {
        let e = PipelineError::transient("vsin", "connect refused");
        assert_eq!(e.source_name(), Some("vsin"));

        let e = PipelineError::Validation {
            message: "bad row".into(),
        };
        assert_eq!(e.source_name(), None);
    }
}
