//! HTTP handlers

use super::models::*;
use crate::{
    chat::{GroundedDraft, GroundedGenerator, GroundedRequest, SendMessageRequest, TurnEvent, TurnOrchestrator},
    context::{Conversation, ConversationSummary},
    error::ChatError,
    metrics::METRICS,
    providers::ProviderStatus,
    similarity::{EntitySnapshot, SearchRequest, SearchResponse, SimilarityIndex},
};
use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use futures::stream;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<TurnOrchestrator>,
    pub similarity: Arc<SimilarityIndex>,
    pub grounded: Arc<GroundedGenerator>,
    pub default_model: String,
}

/// Send a message and stream the reply as chunked plain text
///
/// POST /api/v1/chat/messages
pub async fn send_message(
    State(state): State<AppState>,
    Json(request): Json<SendMessageRequest>,
) -> ApiResult<Response> {
    info!(
        "Chat message for conversation {} ({} chars)",
        request.conversation_id,
        request.text.len()
    );

    let turn = state.orchestrator.send_message(request).await?;

    let mut response = Response::new(Body::from_stream(event_body(turn.events)));
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-transform"),
    );
    if let Ok(value) = HeaderValue::from_str(&turn.provider) {
        headers.insert("x-model-provider", value);
    }
    if let Ok(value) = HeaderValue::from_str(&turn.model) {
        headers.insert("x-model-name", value);
    }
    Ok(response)
}

/// Body chunks for a turn; a failed turn aborts the response mid-stream
fn event_body(
    events: mpsc::Receiver<TurnEvent>,
) -> impl futures::Stream<Item = Result<Bytes, std::io::Error>> {
    stream::unfold(events, |mut events| async move {
        loop {
            match events.recv().await? {
                TurnEvent::Chunk(chunk) => return Some((Ok(Bytes::from(chunk)), events)),
                TurnEvent::Completed(_) => return None,
                TurnEvent::Failed(reason) => {
                    warn!("Turn failed after streaming started: {}", reason);
                    return Some((Err(std::io::Error::other(reason)), events));
                }
            }
        }
    })
}

/// An owner's conversations, most recently updated first
///
/// GET /api/v1/chat/conversations/:user_id
pub async fn list_conversations(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> ApiResult<Json<ConversationListResponse>> {
    let conversations: Vec<ConversationSummary> =
        state.orchestrator.list_conversations(&user_id).await?;
    let total = conversations.len();
    Ok(Json(ConversationListResponse {
        conversations,
        total,
    }))
}

/// PUT /api/v1/chat/conversations/:user_id/:conversation_id/title
pub async fn update_conversation_title(
    State(state): State<AppState>,
    Path((user_id, conversation_id)): Path<(String, String)>,
    Json(request): Json<UpdateTitleRequest>,
) -> ApiResult<Json<UpdateTitleResponse>> {
    let title = state
        .orchestrator
        .update_title(&user_id, &conversation_id, &request.title)
        .await?;
    Ok(Json(UpdateTitleResponse { title }))
}

/// Full conversation record
///
/// GET /api/v1/chat/conversations/:user_id/:conversation_id
pub async fn get_conversation(
    State(state): State<AppState>,
    Path((user_id, conversation_id)): Path<(String, String)>,
) -> ApiResult<Json<Conversation>> {
    state
        .orchestrator
        .conversation(&user_id, &conversation_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiFailure::not_found(format!("Conversation {} not found", conversation_id)))
}

/// DELETE /api/v1/chat/conversations/:user_id/:conversation_id
pub async fn delete_conversation(
    State(state): State<AppState>,
    Path((user_id, conversation_id)): Path<(String, String)>,
) -> ApiResult<Json<DeleteConversationResponse>> {
    let deleted = state
        .orchestrator
        .delete_conversation(&user_id, &conversation_id)
        .await?;
    Ok(Json(DeleteConversationResponse { deleted }))
}

/// Top-k similar items for an entity
///
/// POST /api/v1/similarity/search
pub async fn similarity_search(
    State(state): State<AppState>,
    Json(request): Json<SearchRequest>,
) -> ApiResult<Json<SearchResponse>> {
    let hits = state
        .similarity
        .query(&request.owner_id, &request.entity_id, &request.query, request.k)
        .await?;
    let total = hits.len();
    Ok(Json(SearchResponse { hits, total }))
}

/// POST /api/v1/similarity/entities/:owner_id/:entity_id/index
pub async fn index_entity(
    State(state): State<AppState>,
    Path((owner_id, entity_id)): Path<(String, String)>,
    Json(snapshot): Json<EntitySnapshot>,
) -> ApiResult<Json<IndexEntityResponse>> {
    let indexed = state
        .similarity
        .index_entity(&owner_id, &entity_id, &snapshot)
        .await?;
    Ok(Json(IndexEntityResponse { indexed }))
}

/// DELETE /api/v1/similarity/entities/:owner_id/:entity_id
pub async fn delete_entity(
    State(state): State<AppState>,
    Path((owner_id, entity_id)): Path<(String, String)>,
) -> ApiResult<Json<DeleteEntityResponse>> {
    let removed = state.similarity.delete_entity(&owner_id, &entity_id).await?;
    Ok(Json(DeleteEntityResponse { removed }))
}

/// Draft outreach messages grounded on an entity's indexed history
///
/// POST /api/v1/messages/draft
pub async fn draft_message(
    State(state): State<AppState>,
    Json(request): Json<GroundedRequest>,
) -> ApiResult<Json<GroundedDraft>> {
    info!("Draft request for entity {}", request.entity_id);
    Ok(Json(state.grounded.draft(request).await?))
}

/// GET /api/v1/models
pub async fn list_models(State(state): State<AppState>) -> Json<ModelsResponse> {
    let registry = state.orchestrator.router().registry();
    Json(ModelsResponse {
        default_model: state.default_model.clone(),
        available: registry.available_models(),
        models: registry.catalog(),
        providers: registry.statuses(),
    })
}

/// Re-enable a provider disabled by the circuit breaker
///
/// POST /api/v1/providers/:name/enable
pub async fn enable_provider(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<ProviderStatus>> {
    let registry = state.orchestrator.router().registry();
    if !registry.enable(&name) {
        return Err(ApiFailure::not_found(format!("Provider {} not found", name)));
    }
    registry
        .status(&name)
        .map(Json)
        .ok_or_else(|| ChatError::Internal(format!("Provider {} vanished", name)).into())
}

/// Clear a provider's failure counter
///
/// POST /api/v1/providers/:name/reset
pub async fn reset_provider(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<ProviderStatus>> {
    let registry = state.orchestrator.router().registry();
    if !registry.reset_failures(&name) {
        return Err(ApiFailure::not_found(format!("Provider {} not found", name)));
    }
    registry
        .status(&name)
        .map(Json)
        .ok_or_else(|| ChatError::Internal(format!("Provider {} vanished", name)).into())
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let statuses = state.orchestrator.router().registry().statuses();
    let providers_enabled = statuses.iter().filter(|s| s.enabled).count();
    let status = if providers_enabled > 0 {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(HealthResponse {
            status: if providers_enabled > 0 { "ok" } else { "degraded" },
            providers_enabled,
            providers_total: statuses.len(),
        }),
    )
}

/// GET /metrics
pub async fn metrics() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        METRICS.export_prometheus(),
    )
}
