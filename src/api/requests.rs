// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Nostr Custody Agent Developers

//! Caller-facing operation endpoint.

use axum::extract::State;
use axum::Json;

use crate::dispatch;
use crate::error::AgentError;
use crate::models::{InboundRequest, ResultBody};
use crate::state::AppState;

/// `POST /v1/request`
///
/// Authorizes and runs one operation on behalf of the caller host. The
/// response is `{"result": ...}` on success; errors use the shared
/// `{"error":{"message":...}}` envelope with a status reflecting the
/// failure class (403 denied, 409 busy, 422 unpayable, 502 network).
pub async fn submit(
    State(state): State<AppState>,
    Json(request): Json<InboundRequest>,
) -> Result<Json<ResultBody>, AgentError> {
    tracing::info!(
        host = %request.caller_host,
        operation_type = request.operation.operation_type(),
        "Operation received"
    );
    let result = dispatch::dispatch(&state, &request.caller_host, request.operation).await?;
    Ok(Json(ResultBody { result }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::tests::test_state;
    use serde_json::json;

    #[tokio::test]
    async fn submit_returns_result_envelope() {
        let (_dir, state) = test_state();
        state
            .policies
            .update("client.example", true, "getPublicKey", None)
            .unwrap();

        let request: InboundRequest = serde_json::from_value(json!({
            "callerHost": "client.example",
            "operationType": "getPublicKey"
        }))
        .unwrap();

        let Json(body) = submit(State(state), Json(request)).await.unwrap();
        assert_eq!(body.result.as_str().unwrap().len(), 64);
    }

    #[tokio::test]
    async fn tip_flows_through_to_a_receipt() {
        let (_dir, state) = test_state();
        state
            .policies
            .update("client.example", true, "tip", None)
            .unwrap();
        let recipient = nostr::Keys::generate().public_key().to_hex();

        let request: InboundRequest = serde_json::from_value(json!({
            "callerHost": "client.example",
            "operationType": "tip",
            "params": {"recipientNpub": recipient, "amountSat": 10_000}
        }))
        .unwrap();

        let Json(body) = submit(State(state), Json(request)).await.unwrap();
        assert_eq!(body.result["txid"].as_str().unwrap().len(), 64);
        assert_eq!(body.result["amountSat"], 10_000);
    }
}
