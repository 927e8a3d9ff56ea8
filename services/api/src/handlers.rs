//! Axum Handlers for the REST API

use crate::state::AppState;
use axum::{extract::State, response::Json};
use serde::Serialize;
use std::sync::Arc;

#[derive(Serialize, Debug, PartialEq)]
pub struct StatusResponse {
    pub status: &'static str,
    pub model: String,
    pub active_conversations: usize,
    pub tools: usize,
}

/// Liveness probe with a few numbers about the running service.
pub async fn status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        status: "ok",
        model: state.config.chat_model.clone(),
        active_conversations: state.agent.conversations().len().await,
        tools: state.agent.tool_count(),
    })
}
