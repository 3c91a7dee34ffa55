//! Axum Handlers for the REST API
//!
//! Call negotiation, text chat and history, and health. `utoipa` annotations
//! on each handler feed the OpenAPI document.

use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;
use vaani_core::{SessionError, transport::{NegotiationError, Offer}};

use crate::{
    models::{
        AnswerResponse, ChatHistoryResponse, ClearResponse, ErrorResponse, HealthResponse,
        HistoryQuery, Message, OfferPayload, TextMessagePayload,
    },
    state::AppState,
    transport::run_media_socket,
};

/// Service name reported by `/health`.
pub const SERVICE_NAME: &str = "Vaani Voice API";
/// History page size when the client gives no `limit`.
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Unavailable(String),
    BadGateway(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, message),
            ApiError::Conflict(message) => (StatusCode::CONFLICT, message),
            ApiError::Unavailable(message) => (StatusCode::SERVICE_UNAVAILABLE, message),
            ApiError::BadGateway(message) => {
                warn!(%message, "Upstream stage failed");
                (StatusCode::BAD_GATEWAY, message)
            }
        };
        (status, Json(ErrorResponse { message })).into_response()
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        let message = err.to_string();
        match err {
            SessionError::UnknownSession(_) => ApiError::NotFound(message),
            SessionError::Busy(_) => ApiError::Conflict(message),
            SessionError::EmptyMessage => ApiError::BadRequest(message),
            SessionError::Negotiation(NegotiationError::MalformedOffer(_)) => {
                ApiError::BadRequest(message)
            }
            SessionError::Negotiation(NegotiationError::NoCapacity) => {
                ApiError::Unavailable(message)
            }
            SessionError::Negotiation(NegotiationError::Rejected(_)) => {
                ApiError::Conflict(message)
            }
            SessionError::Stage(_) => ApiError::BadGateway(message),
        }
    }
}

/// Start a voice call: exchange an offer for an answer carrying the media endpoint.
#[utoipa::path(
    post,
    path = "/offer",
    request_body = OfferPayload,
    responses(
        (status = 200, description = "Call negotiated", body = AnswerResponse),
        (status = 400, description = "Malformed offer", body = ErrorResponse),
        (status = 409, description = "Session already has a call", body = ErrorResponse),
        (status = 503, description = "No call capacity left", body = ErrorResponse)
    )
)]
pub async fn offer(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<OfferPayload>,
) -> Result<Json<AnswerResponse>, ApiError> {
    let session_id = payload
        .session_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let offer = Offer {
        sdp: payload.sdp,
        kind: payload.kind,
    };
    let answer = state.sessions.begin(&session_id, &offer).await?;
    Ok(Json(AnswerResponse {
        session_id,
        sdp: answer.sdp,
        kind: answer.kind,
    }))
}

/// Binds the media socket to the slot negotiated under `token`.
pub async fn media_socket(
    ws: WebSocketUpgrade,
    Path(token): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Result<Response, ApiError> {
    let (session_id, peer) = state
        .negotiator
        .attach(&token)
        .await
        .ok_or_else(|| ApiError::NotFound("Unknown or expired media endpoint".to_string()))?;
    info!(%session_id, "Upgrading media socket");
    Ok(ws.on_upgrade(move |socket| run_media_socket(socket, session_id, peer)))
}

/// End the live call of a session. Ending a session without a call is a no-op.
#[utoipa::path(
    delete,
    path = "/sessions/{session_id}",
    params(("session_id" = String, Path, description = "Session identifier")),
    responses(
        (status = 204, description = "Call ended or none was live")
    )
)]
pub async fn end_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.sessions.end(&session_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Get the conversation history of a session.
#[utoipa::path(
    get,
    path = "/chat/{session_id}",
    params(
        ("session_id" = String, Path, description = "Session identifier"),
        HistoryQuery
    ),
    responses(
        (status = 200, description = "Most recent messages, oldest first", body = ChatHistoryResponse)
    )
)]
pub async fn get_chat(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Json<ChatHistoryResponse> {
    let history = state.sessions.history(&session_id).await;
    let total = history.len();
    let limit = query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
    let messages = history
        .into_iter()
        .skip(total.saturating_sub(limit))
        .map(Message::from)
        .collect();
    Json(ChatHistoryResponse {
        session_id,
        messages,
        total,
    })
}

/// Send a text message and receive the agent's reply.
#[utoipa::path(
    post,
    path = "/chat/{session_id}",
    params(("session_id" = String, Path, description = "Session identifier")),
    request_body = TextMessagePayload,
    responses(
        (status = 200, description = "The agent's reply", body = Message),
        (status = 400, description = "Empty message", body = ErrorResponse),
        (status = 502, description = "Reply generation failed", body = ErrorResponse)
    )
)]
pub async fn post_chat(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Json(payload): Json<TextMessagePayload>,
) -> Result<Json<Message>, ApiError> {
    let reply = state
        .sessions
        .send_text(&session_id, &payload.content)
        .await?;
    Ok(Json(reply.into()))
}

/// Delete the conversation history of a session.
#[utoipa::path(
    delete,
    path = "/chat/{session_id}",
    params(("session_id" = String, Path, description = "Session identifier")),
    responses(
        (status = 200, description = "History cleared", body = ClearResponse)
    )
)]
pub async fn clear_chat(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Json<ClearResponse> {
    let deleted = state.sessions.clear(&session_id).await;
    Json(ClearResponse {
        session_id,
        deleted,
    })
}

/// Liveness and number of active calls.
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is up", body = HealthResponse)
    )
)]
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        active_sessions: state.sessions.active_count(),
        timestamp: chrono::Utc::now(),
        service: SERVICE_NAME.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use vaani_core::stage::{StageError, StageKind};

    async fn status_and_body(err: ApiError) -> (StatusCode, serde_json::Value) {
        let response = err.into_response();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_session_error_mapping() {
        let cases = [
            (SessionError::UnknownSession("s".into()), StatusCode::NOT_FOUND),
            (SessionError::Busy("s".into()), StatusCode::CONFLICT),
            (SessionError::EmptyMessage, StatusCode::BAD_REQUEST),
            (
                SessionError::Negotiation(NegotiationError::MalformedOffer("x".into())),
                StatusCode::BAD_REQUEST,
            ),
            (
                SessionError::Negotiation(NegotiationError::NoCapacity),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                SessionError::Stage(StageError::fatal(StageKind::Responder, "down")),
                StatusCode::BAD_GATEWAY,
            ),
        ];
        for (err, expected) in cases {
            let (status, body) = status_and_body(err.into()).await;
            assert_eq!(status, expected);
            assert!(body["message"].is_string());
        }
    }
}
