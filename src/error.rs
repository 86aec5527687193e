// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Nostr Custody Agent Developers

//! Agent-wide error taxonomy.
//!
//! Every fallible operation funnels into [`AgentError`]; handlers convert it
//! into the `{"error":{"message":...}}` body callers expect. Network errors
//! are retried inside the ledger client and only reach this type after
//! exhaustion.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// Policy or the user said no. Surfaced verbatim.
    #[error("denied")]
    PermissionDenied,

    /// The single-flight prompt slot is occupied.
    #[error("prompt in progress")]
    Busy,

    #[error("{0}")]
    InsufficientFunds(String),

    #[error("{0}")]
    DustAmount(String),

    #[error("invalid recipient: {0}")]
    InvalidRecipient(String),

    /// Retries already exhausted at the ledger layer.
    #[error("network failure: {0}")]
    Network(String),

    /// The fee/change loop did not stabilize. Indicates a bug.
    #[error("fee convergence failure: {0}")]
    Convergence(String),

    /// Malformed UTXO, script or wire data.
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("no private key found")]
    NoPrivateKey,

    #[error("storage error: {0}")]
    Storage(String),

    #[error("crypto error: {0}")]
    Crypto(String),
}

impl AgentError {
    fn status(&self) -> StatusCode {
        match self {
            AgentError::PermissionDenied => StatusCode::FORBIDDEN,
            AgentError::Busy => StatusCode::CONFLICT,
            AgentError::InsufficientFunds(_)
            | AgentError::DustAmount(_)
            | AgentError::InvalidRecipient(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AgentError::Network(_) => StatusCode::BAD_GATEWAY,
            AgentError::NotFound(_) => StatusCode::NOT_FOUND,
            AgentError::NoPrivateKey => StatusCode::PRECONDITION_FAILED,
            AgentError::Convergence(_)
            | AgentError::Serialization(_)
            | AgentError::Storage(_)
            | AgentError::Crypto(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorMessage,
}

#[derive(Serialize)]
struct ErrorMessage {
    message: String,
}

impl IntoResponse for AgentError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            error: ErrorMessage {
                message: self.to_string(),
            },
        });
        (self.status(), body).into_response()
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(e: serde_json::Error) -> Self {
        AgentError::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    #[test]
    fn status_mapping() {
        assert_eq!(AgentError::PermissionDenied.status(), StatusCode::FORBIDDEN);
        assert_eq!(AgentError::Busy.status(), StatusCode::CONFLICT);
        assert_eq!(
            AgentError::InsufficientFunds("x".into()).status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            AgentError::Network("x".into()).status(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[tokio::test]
    async fn into_response_wraps_message() {
        let response = AgentError::PermissionDenied.into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let body_bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = String::from_utf8(body_bytes.to_vec()).unwrap();
        assert_eq!(body, r#"{"error":{"message":"denied"}}"#);
    }
}
