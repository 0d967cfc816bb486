//! Axum Handlers for the Chat API
//!
//! Each handler drives one step of a hosted tutoring session and writes the
//! checkpoint the step asks for. `utoipa` doc comments generate the OpenAPI
//! documentation.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use std::sync::Arc;
use tracing::{error, info, warn};
use tutor_core::{history::HistoryId, session::SessionError};

use crate::{
    models::{
        ChatMessagePayload, ChatResponse, ErrorResponse, HealthResponse, HistoryDetail,
        HistoryQuery, HistorySummaryView, StartChatPayload,
    },
    sessions::HostedSession,
    state::AppState,
};

const DEFAULT_HISTORY_LIMIT: usize = 20;
const MAX_HISTORY_LIMIT: usize = 100;

pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    /// Unknown, expired or finished hosted session.
    InvalidSession,
    /// The generation service failed; the learner may retry.
    Unavailable(String),
    InternalServerError(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(message) => {
                (StatusCode::BAD_REQUEST, Json(ErrorResponse { message })).into_response()
            }
            ApiError::NotFound(message) => {
                (StatusCode::NOT_FOUND, Json(ErrorResponse { message })).into_response()
            }
            ApiError::InvalidSession => (
                StatusCode::NOT_FOUND,
                Json(ErrorResponse {
                    message: "invalid session".to_string(),
                }),
            )
                .into_response(),
            ApiError::Unavailable(message) => {
                (StatusCode::SERVICE_UNAVAILABLE, Json(ErrorResponse { message })).into_response()
            }
            ApiError::InternalServerError(err) => {
                error!("Internal Server Error: {:?}", err);
                let message = "An internal server error occurred.".to_string();
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorResponse { message }),
                )
                    .into_response()
            }
        }
    }
}

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self::InternalServerError(err.into())
    }
}

fn session_error(err: SessionError) -> ApiError {
    match err {
        SessionError::EmptyTopic => ApiError::BadRequest("topic must not be empty".to_string()),
        SessionError::Finished | SessionError::NotStarted => ApiError::InvalidSession,
        SessionError::AlreadyStarted => ApiError::BadRequest(err.to_string()),
        SessionError::Generation(e) => {
            warn!(error = ?e, "Generation failed during a hosted step");
            ApiError::Unavailable(
                "The tutor could not respond right now. Please send your message again."
                    .to_string(),
            )
        }
    }
}

/// Service health and image search availability.
#[utoipa::path(
    get,
    path = "/",
    responses(
        (status = 200, description = "Service is up", body = HealthResponse)
    )
)]
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        provider: format!("{:?}", state.config.provider).to_lowercase(),
        images: state.stack.index.is_ready(),
    })
}

/// Start a tutoring session: plan the topic and teach the first part.
#[utoipa::path(
    post,
    path = "/chat/start",
    request_body = StartChatPayload,
    responses(
        (status = 201, description = "Session started", body = ChatResponse),
        (status = 400, description = "Bad request", body = ErrorResponse),
        (status = 503, description = "Generation service unavailable", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    )
)]
pub async fn start_chat(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<StartChatPayload>,
) -> Result<impl IntoResponse, ApiError> {
    if payload.topic.trim().is_empty() {
        return Err(ApiError::BadRequest("topic must not be empty".to_string()));
    }

    let hosted = HostedSession::new(state.stack.new_session(), state.history.clone());
    let (session_id, shared) = state.sessions.create(hosted).await;
    let mut hosted = shared.lock().await;

    let reply = match hosted.session.start(&payload.topic).await {
        Ok(reply) => reply,
        Err(e) => {
            // The caller never learns the id of a session that failed to start.
            state.sessions.remove(&session_id).await;
            return Err(session_error(e));
        }
    };
    hosted.record(&reply).await;
    if reply.state.is_terminal() {
        state.sessions.remove(&session_id).await;
    }

    info!(%session_id, topic = %payload.topic, state = %reply.state, "Chat started");
    let history_id = hosted.history_id();
    Ok((
        StatusCode::CREATED,
        Json(ChatResponse::new(session_id, history_id, reply)),
    ))
}

/// Send learner input to a running session.
#[utoipa::path(
    post,
    path = "/chat/message",
    request_body = ChatMessagePayload,
    responses(
        (status = 200, description = "Tutor reply", body = ChatResponse),
        (status = 404, description = "Invalid session", body = ErrorResponse),
        (status = 503, description = "Generation service unavailable", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    )
)]
pub async fn post_message(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ChatMessagePayload>,
) -> Result<Json<ChatResponse>, ApiError> {
    let shared = state
        .sessions
        .get(&payload.session_id)
        .await
        .ok_or(ApiError::InvalidSession)?;
    let mut hosted = shared.lock().await;

    let reply = match hosted.session.handle_input(&payload.message).await {
        Ok(reply) => reply,
        Err(e) => {
            if matches!(e, SessionError::Generation(_)) {
                hosted.record_progress().await;
            }
            return Err(session_error(e));
        }
    };
    hosted.record(&reply).await;
    if reply.state.is_terminal() {
        state.sessions.remove(&payload.session_id).await;
        info!(session_id = %payload.session_id, "Chat finished");
    }

    let history_id = hosted.history_id();
    Ok(Json(ChatResponse::new(payload.session_id, history_id, reply)))
}

/// List lesson histories, most recently updated first.
#[utoipa::path(
    get,
    path = "/chat/history",
    params(HistoryQuery),
    responses(
        (status = 200, description = "Lesson histories", body = [HistorySummaryView]),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    )
)]
pub async fn list_history(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<HistorySummaryView>>, ApiError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .min(MAX_HISTORY_LIMIT);
    let summaries = state.history.list(limit).await?;
    Ok(Json(
        summaries.into_iter().map(HistorySummaryView::from).collect(),
    ))
}

/// Get one lesson history with its full conversation.
#[utoipa::path(
    get,
    path = "/chat/history/{id}",
    responses(
        (status = 200, description = "Lesson history", body = HistoryDetail),
        (status = 404, description = "History not found", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    params(
        ("id" = String, Path, description = "History ID")
    )
)]
pub async fn get_history(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<HistoryDetail>, ApiError> {
    let record = state
        .history
        .get(&HistoryId(id.clone()))
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("History with id '{}' not found", id)))?;
    Ok(Json(HistoryDetail::from(record)))
}
