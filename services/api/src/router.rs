//! Axum Router Configuration
//!
//! The REST API, the media WebSocket endpoint and the OpenAPI documentation.

use crate::{
    handlers,
    models::{
        AnswerResponse, ChatHistoryResponse, ClearResponse, ErrorResponse, HealthResponse,
        Message, MessageRole, OfferPayload, TextMessagePayload,
    },
    state::AppState,
};

use axum::{
    Router,
    routing::{delete, get, post},
};
use std::sync::Arc;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::offer,
        handlers::end_session,
        handlers::get_chat,
        handlers::post_chat,
        handlers::clear_chat,
        handlers::health,
    ),
    components(
        schemas(
            OfferPayload, AnswerResponse, TextMessagePayload, Message, MessageRole,
            ChatHistoryResponse, ClearResponse, HealthResponse, ErrorResponse
        )
    ),
    tags(
        (name = "Vaani API", description = "Voice calls and text chat with the Vaani assistant")
    )
)]
pub struct ApiDoc;

/// Creates the main Axum router for the application.
pub fn create_router(app_state: Arc<AppState>) -> Router {
    let api_router = Router::new()
        .route("/offer", post(handlers::offer))
        .route("/media/{token}", get(handlers::media_socket))
        .route("/sessions/{session_id}", delete(handlers::end_session))
        .route(
            "/chat/{session_id}",
            get(handlers::get_chat)
                .post(handlers::post_chat)
                .delete(handlers::clear_chat),
        )
        .route("/health", get(handlers::health))
        .with_state(app_state);

    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .merge(api_router)
}
