//! Error types for the reasoning engine and its datastore.
//!
//! `EngineError` covers the user-visible failure kinds of the ask pipeline;
//! `StoreError` covers persistence. The engine converts `StoreError` into
//! `EngineError::Persistence` at the seam via `#[from]`.

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

/// Errors raised by the datastore layer.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying database failure.
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A persisted JSON column failed to (de)serialize.
    #[error("stored json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A row the caller required was missing.
    #[error("{entity} not found: {id}")]
    RowNotFound {
        /// Entity kind, e.g. `"conversation"`.
        entity: &'static str,
        /// Identifier that failed to resolve.
        id: String,
    },
}

/// Errors raised by the reasoning pipeline.
///
/// Variants map one-to-one onto the failure kinds of the external contract:
/// the HTTP layer turns `BadRequest`/`Unauthorized`/`NotFound` into a single
/// `{error}` line with no persisted state, while upstream failures are
/// absorbed by the loop's fallback behavior wherever possible.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The request body was missing required fields.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// No authenticated user was attached to the request.
    #[error("unauthorized")]
    Unauthorized,

    /// A referenced conversation or message does not exist.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Entity kind, e.g. `"conversation"`.
        entity: &'static str,
        /// Identifier that failed to resolve.
        id: Uuid,
    },

    /// The root message could not be resolved from the request.
    #[error("corrupted state: {0}")]
    CorruptedState(String),

    /// An LLM or embedding call exceeded its deadline.
    #[error("upstream timeout after {0:?}")]
    UpstreamTimeout(Duration),

    /// The model returned JSON that does not conform to the expected shape.
    #[error("upstream parse error: {message}")]
    UpstreamParse {
        /// What failed to parse.
        message: String,
        /// Raw model output, kept for diagnostics.
        content: String,
    },

    /// An LLM or embedding request failed at the transport level.
    #[error("upstream request failed: {0}")]
    Upstream(String),

    /// No API key was configured for the selected provider.
    #[error("no API key configured (set QUARRY_API_KEY or OPENAI_API_KEY)")]
    ApiKeyMissing,

    /// The configured provider name is not supported.
    #[error("unsupported provider: {name}")]
    UnsupportedProvider {
        /// Provider name as configured.
        name: String,
    },

    /// A datastore write or read failed.
    #[error("persistence failure: {0}")]
    Persistence(#[from] StoreError),
}

impl EngineError {
    /// True when the HTTP layer should answer with a bare `{error}` line and
    /// persist nothing.
    #[must_use]
    pub const fn is_fatal_request_error(&self) -> bool {
        matches!(
            self,
            Self::BadRequest(_) | Self::Unauthorized | Self::NotFound { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_request_errors() {
        assert!(EngineError::BadRequest("x".to_string()).is_fatal_request_error());
        assert!(EngineError::Unauthorized.is_fatal_request_error());
        assert!(
            EngineError::NotFound {
                entity: "conversation",
                id: Uuid::nil(),
            }
            .is_fatal_request_error()
        );
        assert!(!EngineError::CorruptedState("x".to_string()).is_fatal_request_error());
        assert!(
            !EngineError::UpstreamTimeout(Duration::from_secs(1)).is_fatal_request_error()
        );
    }

    #[test]
    fn test_store_error_display() {
        let err = StoreError::RowNotFound {
            entity: "page",
            id: "abc".to_string(),
        };
        assert_eq!(err.to_string(), "page not found: abc");
    }

    #[test]
    fn test_persistence_conversion() {
        let store = StoreError::RowNotFound {
            entity: "slot",
            id: "1".to_string(),
        };
        let engine: EngineError = store.into();
        assert!(matches!(engine, EngineError::Persistence(_)));
    }
}
