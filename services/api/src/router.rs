//! Axum Router Configuration
//!
//! This module defines the complete HTTP routing for the application,
//! including the chat API and OpenAPI documentation.

use crate::{
    handlers,
    models::{
        ChatMessagePayload, ChatResponse, ErrorResponse, HealthResponse, HistoryDetail,
        HistorySummaryView, StartChatPayload, TurnView,
    },
    state::AppState,
};

use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::health,
        handlers::start_chat,
        handlers::post_message,
        handlers::list_history,
        handlers::get_history,
    ),
    components(
        schemas(StartChatPayload, ChatMessagePayload, ChatResponse, HistorySummaryView, HistoryDetail, TurnView, HealthResponse, ErrorResponse)
    ),
    tags(
        (name = "Tutor API", description = "Interactive tutoring sessions with image-augmented explanations")
    )
)]
pub struct ApiDoc;

/// Creates the main Axum router for the application.
pub fn create_router(app_state: Arc<AppState>) -> Router {
    // Group all routes that require AppState into their own router.
    let api_router = Router::new()
        .route("/", get(handlers::health))
        .route("/chat/start", post(handlers::start_chat))
        .route("/chat/message", post(handlers::post_message))
        .route("/chat/history", get(handlers::list_history))
        .route("/chat/history/{id}", get(handlers::get_history))
        // Apply the state ONLY to this group of routes.
        .with_state(app_state);

    // Create the final router that merges the stateful routes
    // with the stateless routes (like Swagger UI).
    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .merge(api_router)
}
