// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Nostr Custody Agent Developers

//! HTTP surface.
//!
//! Three audiences share one router: callers submit operations through
//! `/v1/request`, the confirmation surface polls and answers prompts under
//! `/v1/prompt`, and the owner administers the key, policies and the
//! protocol handler.

pub mod admin;
pub mod prompts;
pub mod requests;

use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/request", post(requests::submit))
        .route("/v1/prompt", get(prompts::current))
        .route(
            "/v1/prompt/{id}",
            post(prompts::resolve).delete(prompts::dismiss),
        )
        .route("/v1/key", put(admin::set_key))
        .route("/v1/policies", get(admin::list_policies))
        .route(
            "/v1/policies/{host}/{bucket}/{operation_type}",
            delete(admin::remove_policy),
        )
        .route("/v1/protocol-handler", put(admin::set_protocol_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}
