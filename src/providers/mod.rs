//! Text-generation providers with fallback routing
//!
//! - `registry`: provider table, model lookup, fallback ranking, circuit breaker
//! - `router`: tries the requested model, then ranked fallbacks
//! - `openai`: streaming adapter for OpenAI-compatible chat completion APIs

pub mod openai;
pub mod registry;
pub mod router;

pub use openai::OpenAiCompatibleBackend;
pub use registry::{BreakerPolicy, ModelInfo, ProviderDescriptor, ProviderRegistry, ProviderStatus};
pub use router::{GenerationRouter, RouterTextGenerator};

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::time::Duration;

/// Markers that identify quota-class failures
const QUOTA_MARKERS: &[&str] = &[
    "quota",
    "rate_limit",
    "rate limit",
    "resource_exhausted",
    "empty response",
    "too many requests",
];

/// Role of a prompt message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// A single role/content pair sent to a model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Sampling parameters shared by every candidate of a routed request
#[derive(Debug, Clone)]
pub struct GenerationParams {
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: usize,
}

/// Request handed to a single backend
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: usize,
}

/// Single-consumption stream of generated text chunks
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String, GenerationError>> + Send>>;

/// Successful generation, tagged with the model that actually answered
pub struct Generation {
    pub provider: String,
    pub model: String,
    pub chunks: TextStream,
}

impl std::fmt::Debug for Generation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Generation")
            .field("provider", &self.provider)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

/// Generation errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum GenerationError {
    #[error("No provider found for model: {0}")]
    UnknownModel(String),

    #[error("All models failed: {}", attempted.join(", "))]
    AllProvidersFailed { attempted: Vec<String> },

    #[error("Request to {model} timed out after {after:?}")]
    Timeout { model: String, after: Duration },

    #[error("{provider}: {cause}")]
    Provider { provider: String, cause: String },
}

impl GenerationError {
    pub fn provider(provider: impl Into<String>, cause: impl Into<String>) -> Self {
        GenerationError::Provider {
            provider: provider.into(),
            cause: cause.into(),
        }
    }

    /// Quota, rate-limit, resource-exhausted or empty-response failures
    pub fn is_quota_class(&self) -> bool {
        match self {
            GenerationError::Provider { cause, .. } => {
                let cause = cause.to_ascii_lowercase();
                QUOTA_MARKERS.iter().any(|marker| cause.contains(marker))
            }
            _ => false,
        }
    }
}

/// One provider's generation call
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Start a completion; chunks are produced lazily by the returned stream
    async fn invoke(&self, request: &GenerationRequest) -> Result<TextStream, GenerationError>;
}

/// Whole-text generation capability used by the summarizer
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate_text(
        &self,
        prompt: &str,
        max_tokens: usize,
        temperature: f32,
    ) -> Result<String, GenerationError>;
}
