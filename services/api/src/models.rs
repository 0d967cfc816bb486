//! API Models
//!
//! Request and response bodies for the chat endpoints, annotated for OpenAPI
//! documentation with `utoipa`. Core types are mapped into these views so the
//! wire format stays stable even if the engine's types grow.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tutor_core::{
    augment::Segment,
    history::{HistoryRecord, HistorySummary, Turn},
    session::Reply,
};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

#[derive(Deserialize, ToSchema)]
pub struct StartChatPayload {
    #[schema(example = "Photosynthesis")]
    pub topic: String,
}

#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessagePayload {
    #[schema(value_type = String, format = Uuid)]
    pub session_id: Uuid,
    #[schema(example = "next")]
    pub message: String,
}

/// One step of a hosted tutoring session.
#[derive(Serialize, ToSchema, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ChatResponse {
    #[schema(value_type = String, format = Uuid)]
    pub session_id: Uuid,
    /// Lesson record id, once the first checkpoint has been written.
    pub history_id: Option<String>,
    #[schema(example = "Q_AND_A")]
    pub state: String,
    pub message: String,
    /// Ordered `text` and `image` segments of the reply.
    #[schema(value_type = Vec<Object>)]
    pub segments: Vec<Segment>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<Vec<String>>,
}

impl ChatResponse {
    pub fn new(session_id: Uuid, history_id: Option<String>, reply: Reply) -> Self {
        Self {
            session_id,
            history_id,
            state: reply.state.to_string(),
            message: reply.message,
            segments: reply.segments,
            plan: reply.plan,
        }
    }
}

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq)]
pub struct TurnView {
    #[schema(example = "assistant")]
    pub role: String,
    pub message: String,
}

impl From<Turn> for TurnView {
    fn from(turn: Turn) -> Self {
        let role = match turn.role {
            tutor_core::history::Role::User => "user",
            tutor_core::history::Role::Assistant => "assistant",
        };
        Self {
            role: role.to_string(),
            message: turn.message,
        }
    }
}

#[derive(Serialize, ToSchema, Debug)]
#[serde(rename_all = "camelCase")]
pub struct HistorySummaryView {
    pub id: String,
    pub topic: String,
    #[schema(example = "in_progress")]
    pub status: String,
    pub last_completed_part: Option<String>,
    pub parts: usize,
    pub updated_at: DateTime<Utc>,
}

impl From<HistorySummary> for HistorySummaryView {
    fn from(summary: HistorySummary) -> Self {
        Self {
            id: summary.id.0,
            topic: summary.topic,
            status: summary.status.to_string(),
            last_completed_part: summary.last_completed_part,
            parts: summary.parts,
            updated_at: summary.updated_at,
        }
    }
}

#[derive(Serialize, ToSchema, Debug)]
#[serde(rename_all = "camelCase")]
pub struct HistoryDetail {
    pub id: String,
    pub topic: String,
    pub plan: Vec<String>,
    pub history: Vec<TurnView>,
    #[schema(example = "stopped")]
    pub status: String,
    pub last_completed_part: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<HistoryRecord> for HistoryDetail {
    fn from(record: HistoryRecord) -> Self {
        Self {
            id: record.id.0,
            topic: record.topic,
            plan: record.plan,
            history: record.history.into_iter().map(TurnView::from).collect(),
            status: record.status.to_string(),
            last_completed_part: record.last_completed_part,
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

#[derive(Deserialize, IntoParams, Debug)]
#[into_params(parameter_in = Query)]
pub struct HistoryQuery {
    /// Maximum number of records to return.
    pub limit: Option<usize>,
}

#[derive(Serialize, ToSchema, Debug)]
pub struct HealthResponse {
    pub status: String,
    pub provider: String,
    /// Whether image search is currently offered.
    pub images: bool,
}

#[derive(Serialize, ToSchema)]
pub struct ErrorResponse {
    pub message: String,
}
