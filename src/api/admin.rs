// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Nostr Custody Agent Developers

//! Owner administration: key custody, stored policies and the protocol
//! handler template. These endpoints are meant to sit behind whatever
//! access control fronts the agent; they are not caller-facing.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde_json::json;

use crate::dispatch::npub_of;
use crate::error::AgentError;
use crate::models::{SetKeyRequest, SetProtocolHandlerRequest};
use crate::policy::Policies;
use crate::state::AppState;
use crate::storage::PROTOCOL_HANDLER;

/// `PUT /v1/key` — install or replace the secret key. Responds with the
/// derived public identity so the owner can verify what was stored.
pub async fn set_key(
    State(state): State<AppState>,
    Json(request): Json<SetKeyRequest>,
) -> Result<Json<serde_json::Value>, AgentError> {
    state.keystore.set_private_key(&request.private_key)?;
    let keys = state.keystore.keys()?;
    tracing::info!(public_key = %keys.public_key().to_hex(), "Private key replaced");
    Ok(Json(json!({
        "publicKey": keys.public_key().to_hex(),
        "npub": npub_of(&keys)?,
    })))
}

/// `GET /v1/policies` — the full stored policy tree.
pub async fn list_policies(
    State(state): State<AppState>,
) -> Result<Json<Policies>, AgentError> {
    Ok(Json(state.policies.all()?))
}

/// `DELETE /v1/policies/{host}/{bucket}/{operation_type}` where bucket is
/// `allow` or `deny`.
pub async fn remove_policy(
    State(state): State<AppState>,
    Path((host, bucket, operation_type)): Path<(String, String, String)>,
) -> Result<StatusCode, AgentError> {
    let accept = match bucket.as_str() {
        "allow" => true,
        "deny" => false,
        other => {
            return Err(AgentError::NotFound(format!(
                "unknown policy bucket {other:?}"
            )))
        }
    };
    state.policies.remove(&host, accept, &operation_type)?;
    tracing::info!(host, bucket, operation_type, "Policy entry removed");
    Ok(StatusCode::NO_CONTENT)
}

/// `PUT /v1/protocol-handler` — store the `replaceURL` template.
pub async fn set_protocol_handler(
    State(state): State<AppState>,
    Json(request): Json<SetProtocolHandlerRequest>,
) -> Result<StatusCode, AgentError> {
    let template = request.template.trim().to_string();
    if template.is_empty() {
        return Err(AgentError::Serialization(
            "protocol handler template is empty".to_string(),
        ));
    }
    state.db.put(PROTOCOL_HANDLER, &template)?;
    Ok(StatusCode::NO_CONTENT)
}
