// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Nostr Custody Agent Developers

//! Wire-level request and response shapes.

use serde::{Deserialize, Serialize};

use crate::dispatch::Operation;

/// Body of `POST /v1/request`: the caller's host plus the operation,
/// tagged inline by `operationType`.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundRequest {
    #[serde(rename = "callerHost")]
    pub caller_host: String,
    #[serde(flatten)]
    pub operation: Operation,
}

/// Successful operation envelope.
#[derive(Debug, Serialize)]
pub struct ResultBody {
    pub result: serde_json::Value,
}

/// Body of `PUT /v1/key`.
#[derive(Debug, Deserialize)]
pub struct SetKeyRequest {
    #[serde(rename = "privateKey")]
    pub private_key: String,
}

/// Body of `PUT /v1/protocol-handler`.
#[derive(Debug, Deserialize)]
pub struct SetProtocolHandlerRequest {
    pub template: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbound_request_flattens_the_operation() {
        let request: InboundRequest = serde_json::from_value(serde_json::json!({
            "callerHost": "client.example",
            "operationType": "signEvent",
            "params": {"event": {"kind": 1, "content": "x", "tags": []}}
        }))
        .unwrap();
        assert_eq!(request.caller_host, "client.example");
        assert_eq!(request.operation.operation_type(), "signEvent");
    }

    #[test]
    fn unknown_operation_type_is_rejected() {
        let result = serde_json::from_value::<InboundRequest>(serde_json::json!({
            "callerHost": "client.example",
            "operationType": "exportKey"
        }));
        assert!(result.is_err());
    }
}
