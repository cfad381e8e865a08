//! Route configuration

use super::handlers::{self, AppState};
use axum::{
    routing::{get, post, put},
    Router,
};
use tower::ServiceBuilder;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

/// Build the service router
pub fn build_router(state: AppState, max_body_bytes: usize) -> Router {
    let chat_routes = Router::new()
        .route("/api/v1/chat/messages", post(handlers::send_message))
        .route(
            "/api/v1/chat/conversations/:user_id",
            get(handlers::list_conversations),
        )
        .route(
            "/api/v1/chat/conversations/:user_id/:conversation_id",
            get(handlers::get_conversation).delete(handlers::delete_conversation),
        )
        .route(
            "/api/v1/chat/conversations/:user_id/:conversation_id/title",
            put(handlers::update_conversation_title),
        );

    let similarity_routes = Router::new()
        .route("/api/v1/similarity/search", post(handlers::similarity_search))
        .route(
            "/api/v1/similarity/entities/:owner_id/:entity_id/index",
            post(handlers::index_entity),
        )
        .route(
            "/api/v1/similarity/entities/:owner_id/:entity_id",
            axum::routing::delete(handlers::delete_entity),
        )
        .route("/api/v1/messages/draft", post(handlers::draft_message));

    let provider_routes = Router::new()
        .route("/api/v1/models", get(handlers::list_models))
        .route("/api/v1/providers/:name/enable", post(handlers::enable_provider))
        .route("/api/v1/providers/:name/reset", post(handlers::reset_provider));

    Router::new()
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        .merge(chat_routes)
        .merge(similarity_routes)
        .merge(provider_routes)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(RequestBodyLimitLayer::new(max_body_bytes)),
        )
        .with_state(state)
}
