//! Crate-level error taxonomy
//!
//! Component errors (`GenerationError`, `EmbeddingError`, `StorageError`)
//! convert into [`ChatError`], which is what callers of the orchestrator and
//! the HTTP layer see. Summarization failures never reach this type: the
//! summarizer absorbs them with a placeholder summary.

use crate::persistence::StorageError;
use crate::providers::GenerationError;
use crate::similarity::EmbeddingError;
use std::time::Duration;
use thiserror::Error;

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, ChatError>;

/// Errors surfaced to callers
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unknown model: {0}")]
    UnknownModel(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("All models failed: {}", attempted.join(", "))]
    AllProvidersFailed { attempted: Vec<String> },

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Provider {provider} failed: {cause}")]
    Provider { provider: String, cause: String },

    #[error("Embedding failure: {0}")]
    Embedding(String),

    #[error("Rate limited, retry in {}s", retry_after_secs(*retry_after))]
    RateLimited { retry_after: Duration },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Whole seconds to wait, rounded up so a retry never lands early
pub fn retry_after_secs(retry_after: Duration) -> u64 {
    (retry_after.as_secs_f64().ceil() as u64).max(1)
}

impl ChatError {
    /// Whether the caller may retry the same request later
    pub fn is_retryable(&self) -> bool {
        matches!(self, ChatError::RateLimited { .. } | ChatError::Timeout(_))
    }
}

impl From<GenerationError> for ChatError {
    fn from(err: GenerationError) -> Self {
        match err {
            GenerationError::UnknownModel(model) => ChatError::UnknownModel(model),
            GenerationError::AllProvidersFailed { attempted } => {
                ChatError::AllProvidersFailed { attempted }
            }
            GenerationError::Timeout { model, after } => {
                ChatError::Timeout(format!("{} did not respond within {:?}", model, after))
            }
            GenerationError::Provider { provider, cause } => ChatError::Provider { provider, cause },
        }
    }
}

impl From<EmbeddingError> for ChatError {
    fn from(err: EmbeddingError) -> Self {
        ChatError::Embedding(err.to_string())
    }
}

impl From<StorageError> for ChatError {
    fn from(err: StorageError) -> Self {
        ChatError::Storage(err.to_string())
    }
}

impl From<::config::ConfigError> for ChatError {
    fn from(err: ::config::ConfigError) -> Self {
        ChatError::Configuration(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_providers_failed_message_lists_models() {
        let err = ChatError::from(GenerationError::AllProvidersFailed {
            attempted: vec!["m1".to_string(), "m2".to_string()],
        });
        assert_eq!(err.to_string(), "All models failed: m1, m2");
    }

    #[test]
    fn test_retryable_classification() {
        let limited = ChatError::RateLimited {
            retry_after: Duration::from_secs(3),
        };
        assert!(limited.is_retryable());
        assert!(!ChatError::Validation("empty".to_string()).is_retryable());
    }

    #[test]
    fn test_retry_after_rounds_up() {
        assert_eq!(retry_after_secs(Duration::from_millis(2500)), 3);
        assert_eq!(retry_after_secs(Duration::from_secs(4)), 4);
        assert_eq!(retry_after_secs(Duration::from_millis(10)), 1);
        assert_eq!(retry_after_secs(Duration::ZERO), 1);
    }
}
