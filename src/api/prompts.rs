// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Nostr Custody Agent Developers

//! Confirmation-surface endpoints.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use uuid::Uuid;

use crate::broker::{PromptReply, PromptView};
use crate::error::AgentError;
use crate::state::AppState;

/// `GET /v1/prompt` — the pending prompt, or 404 when none is open.
pub async fn current(State(state): State<AppState>) -> Result<Json<PromptView>, AgentError> {
    state
        .broker
        .current_prompt()
        .map(Json)
        .ok_or_else(|| AgentError::NotFound("no pending prompt".to_string()))
}

/// `POST /v1/prompt/{id}` — answer the prompt.
pub async fn resolve(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(reply): Json<PromptReply>,
) -> Result<StatusCode, AgentError> {
    state.broker.resolve(id, reply)?;
    Ok(StatusCode::NO_CONTENT)
}

/// `DELETE /v1/prompt/{id}` — close the prompt; the waiting operation is
/// denied without recording anything.
pub async fn dismiss(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AgentError> {
    state.broker.dismiss(id)?;
    Ok(StatusCode::NO_CONTENT)
}
