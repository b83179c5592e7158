//! REST handlers for reading back stored conversations.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use serde_json::{Value, json};

use chatstream_events::Message;

use crate::state::AppState;

/// `GET /api/status` — liveness and basic gauges.
pub async fn status(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "connections": state.sessions.connection_count(),
        "active_responses": state.coordinator.processor().active_responses(),
        "listeners": state.sessions.listener_count(),
    }))
}

/// `GET /api/chats/{chat_id}/messages` — a chat's stored messages in
/// creation order.
pub async fn chat_messages(
    Path(chat_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<Message>>, (StatusCode, String)> {
    state
        .repository
        .get_chat_messages(&chat_id, None)
        .await
        .map(Json)
        .map_err(|err| {
            tracing::error!(chat_id = %chat_id, error = %err, "failed to load chat messages");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        })
}
