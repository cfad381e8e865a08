//! API request, response and error types

use crate::context::ConversationSummary;
use crate::error::{retry_after_secs, ChatError};
use crate::providers::{ModelInfo, ProviderStatus};
use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

/// Standard API error body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
    /// The same request may succeed later
    #[serde(default)]
    pub retryable: bool,
}

impl ApiError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            retryable: false,
        }
    }
}

/// Standard error codes
pub mod error_codes {
    pub const VALIDATION_ERROR: &str = "VALIDATION_ERROR";
    pub const UNKNOWN_MODEL: &str = "UNKNOWN_MODEL";
    pub const RATE_LIMIT: &str = "RATE_LIMIT";
    pub const NOT_FOUND: &str = "NOT_FOUND";
    pub const TIMEOUT: &str = "TIMEOUT";
    pub const UPSTREAM_ERROR: &str = "UPSTREAM_ERROR";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
}

/// Error response with status and optional `Retry-After`
#[derive(Debug)]
pub struct ApiFailure {
    pub status: StatusCode,
    pub error: ApiError,
    pub retry_after_secs: Option<u64>,
}

impl ApiFailure {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            error: ApiError::new(error_codes::NOT_FOUND, message),
            retry_after_secs: None,
        }
    }
}

impl From<ChatError> for ApiFailure {
    fn from(err: ChatError) -> Self {
        let (status, code) = match &err {
            ChatError::Validation(_) => (StatusCode::BAD_REQUEST, error_codes::VALIDATION_ERROR),
            ChatError::UnknownModel(_) => (StatusCode::BAD_REQUEST, error_codes::UNKNOWN_MODEL),
            ChatError::NotFound(_) => (StatusCode::NOT_FOUND, error_codes::NOT_FOUND),
            ChatError::RateLimited { .. } => (StatusCode::TOO_MANY_REQUESTS, error_codes::RATE_LIMIT),
            ChatError::AllProvidersFailed { .. }
            | ChatError::Provider { .. }
            | ChatError::Embedding(_) => (StatusCode::BAD_GATEWAY, error_codes::UPSTREAM_ERROR),
            ChatError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, error_codes::TIMEOUT),
            ChatError::Storage(_) | ChatError::Configuration(_) | ChatError::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, error_codes::INTERNAL_ERROR)
            }
        };

        let retry_after_secs = match &err {
            ChatError::RateLimited { retry_after } => Some(retry_after_secs(*retry_after)),
            _ => None,
        };

        let mut error = ApiError::new(code, err.to_string());
        error.retryable = err.is_retryable();
        Self {
            status,
            error,
            retry_after_secs,
        }
    }
}

impl IntoResponse for ApiFailure {
    fn into_response(self) -> Response {
        let mut response = (self.status, Json(self.error)).into_response();
        if let Some(secs) = self.retry_after_secs {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

/// Handler result
pub type ApiResult<T> = Result<T, ApiFailure>;

/// GET /api/v1/models
#[derive(Debug, Serialize)]
pub struct ModelsResponse {
    pub default_model: String,
    /// Models currently served by an enabled provider
    pub available: Vec<String>,
    pub models: Vec<ModelInfo>,
    pub providers: Vec<ProviderStatus>,
}

/// GET /api/v1/chat/conversations/:user_id
#[derive(Debug, Serialize)]
pub struct ConversationListResponse {
    pub conversations: Vec<ConversationSummary>,
    pub total: usize,
}

#[derive(Debug, Deserialize)]
pub struct UpdateTitleRequest {
    pub title: String,
}

#[derive(Debug, Serialize)]
pub struct UpdateTitleResponse {
    pub title: String,
}

/// POST /api/v1/similarity/entities/:owner_id/:entity_id/index
#[derive(Debug, Serialize)]
pub struct IndexEntityResponse {
    pub indexed: usize,
}

/// DELETE /api/v1/similarity/entities/:owner_id/:entity_id
#[derive(Debug, Serialize)]
pub struct DeleteEntityResponse {
    pub removed: usize,
}

/// DELETE /api/v1/chat/conversations/:user_id/:conversation_id
#[derive(Debug, Serialize)]
pub struct DeleteConversationResponse {
    pub deleted: bool,
}

/// GET /health
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub providers_enabled: usize,
    pub providers_total: usize,
}
