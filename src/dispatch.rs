// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Nostr Custody Agent Developers

//! Operation dispatch.
//!
//! Every caller request names an operation and its parameters. Dispatch
//! claims the single-flight permit, consults policy, prompts the user when
//! policy is silent, persists whatever the user asked to be remembered and
//! only then executes. The permit is held until the reply's policy side
//! effects are durable, so a racing request can never observe a half
//! recorded decision.

use nostr::nips::nip19::ToBech32;
use serde::Deserialize;
use serde_json::json;

use crate::broker::PromptReply;
use crate::chain::tip::TipRequest;
use crate::error::AgentError;
use crate::nostr_ops::{self, EventTemplate};
use crate::policy::PolicyDecision;
use crate::state::AppState;
use crate::storage::PROTOCOL_HANDLER;

#[derive(Debug, Clone, Deserialize)]
pub struct SignEventParams {
    pub event: EventTemplate,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EncryptParams {
    pub peer: String,
    pub plaintext: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DecryptParams {
    pub peer: String,
    pub ciphertext: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TipParams {
    pub recipient_npub: String,
    pub amount_sat: u64,
    #[serde(default)]
    pub notify: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReplaceUrlParams {
    pub url: String,
}

/// A caller-requested operation, tagged on the wire by `operationType`
/// with its parameters under `params`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "operationType", content = "params")]
pub enum Operation {
    #[serde(rename = "getPublicKey")]
    GetPublicKey,
    #[serde(rename = "signEvent")]
    SignEvent(SignEventParams),
    #[serde(rename = "nip04.encrypt")]
    Nip04Encrypt(EncryptParams),
    #[serde(rename = "nip04.decrypt")]
    Nip04Decrypt(DecryptParams),
    #[serde(rename = "nip44.encrypt")]
    Nip44Encrypt(EncryptParams),
    #[serde(rename = "nip44.decrypt")]
    Nip44Decrypt(DecryptParams),
    #[serde(rename = "tip")]
    Tip(TipParams),
    #[serde(rename = "replaceURL")]
    ReplaceUrl(ReplaceUrlParams),
}

impl Operation {
    /// Stable operation-type string used as the policy key.
    pub fn operation_type(&self) -> &'static str {
        match self {
            Operation::GetPublicKey => "getPublicKey",
            Operation::SignEvent(_) => "signEvent",
            Operation::Nip04Encrypt(_) => "nip04.encrypt",
            Operation::Nip04Decrypt(_) => "nip04.decrypt",
            Operation::Nip44Encrypt(_) => "nip44.encrypt",
            Operation::Nip44Decrypt(_) => "nip44.decrypt",
            Operation::Tip(_) => "tip",
            Operation::ReplaceUrl(_) => "replaceURL",
        }
    }

    /// URI templating reveals nothing and touches no key material, so it
    /// bypasses the authorization gate entirely.
    pub fn requires_permission(&self) -> bool {
        !matches!(self, Operation::ReplaceUrl(_))
    }

    /// Kind/amount context conditional policies are matched against.
    fn policy_context(&self) -> (Option<u16>, Option<u64>) {
        match self {
            Operation::SignEvent(params) => (Some(params.event.kind), None),
            Operation::Tip(params) => (None, Some(params.amount_sat)),
            _ => (None, None),
        }
    }

    /// What the user gets shown when asked to approve this operation.
    fn prompt_params(&self) -> serde_json::Value {
        match self {
            Operation::GetPublicKey | Operation::ReplaceUrl(_) => json!({}),
            Operation::SignEvent(params) => json!({
                "kind": params.event.kind,
                "content": params.event.content,
                "tags": params.event.tags,
            }),
            Operation::Nip04Encrypt(p) | Operation::Nip44Encrypt(p) => json!({"peer": p.peer}),
            Operation::Nip04Decrypt(p) | Operation::Nip44Decrypt(p) => json!({"peer": p.peer}),
            Operation::Tip(params) => json!({
                "recipient": params.recipient_npub,
                "amountSat": params.amount_sat,
                "notify": params.notify,
            }),
        }
    }
}

/// Authorize and execute one operation on behalf of `host`.
pub async fn dispatch(
    state: &AppState,
    host: &str,
    operation: Operation,
) -> Result<serde_json::Value, AgentError> {
    if !operation.requires_permission() {
        return execute(state, operation).await;
    }

    let operation_type = operation.operation_type();
    let _permit = state.broker.try_begin()?;
    let (kind, amount) = operation.policy_context();

    match state.policies.decision(host, operation_type, kind, amount)? {
        PolicyDecision::Allow => {
            tracing::debug!(host, operation_type, "Allowed by stored policy");
        }
        PolicyDecision::Deny => {
            tracing::info!(host, operation_type, "Denied by stored policy");
            return Err(AgentError::PermissionDenied);
        }
        PolicyDecision::Unknown => {
            let reply = state
                .broker
                .prompt(host, operation_type, operation.prompt_params())
                .await;
            record_reply(state, host, operation_type, &reply)?;
            if !reply.accept {
                return Err(AgentError::PermissionDenied);
            }
        }
    }

    // The permit is still held here: the decision above is durable before
    // any other request can start.
    execute(state, operation).await
}

fn record_reply(
    state: &AppState,
    host: &str,
    operation_type: &str,
    reply: &PromptReply,
) -> Result<(), AgentError> {
    if let Some(condition) = &reply.condition {
        state
            .policies
            .update(host, reply.accept, operation_type, Some(condition.clone()))?;
        tracing::info!(
            host,
            operation_type,
            accept = reply.accept,
            "Recorded policy from prompt reply"
        );
    }
    Ok(())
}

async fn execute(state: &AppState, operation: Operation) -> Result<serde_json::Value, AgentError> {
    match operation {
        Operation::GetPublicKey => {
            let keys = state.keystore.keys()?;
            Ok(json!(keys.public_key().to_hex()))
        }
        Operation::SignEvent(params) => {
            let keys = state.keystore.keys()?;
            nostr_ops::sign_event(&keys, params.event)
        }
        Operation::Nip04Encrypt(params) => {
            let keys = state.keystore.keys()?;
            let peer = nostr_ops::parse_pubkey(&params.peer)?;
            Ok(json!(nostr_ops::nip04_encrypt(
                &keys,
                &peer,
                &params.plaintext
            )?))
        }
        Operation::Nip04Decrypt(params) => {
            let keys = state.keystore.keys()?;
            let peer = nostr_ops::parse_pubkey(&params.peer)?;
            Ok(json!(nostr_ops::nip04_decrypt(
                &keys,
                &peer,
                &params.ciphertext
            )?))
        }
        Operation::Nip44Encrypt(params) => {
            let peer = nostr_ops::parse_pubkey(&params.peer)?;
            Ok(json!(nostr_ops::nip44_encrypt(
                &state.keystore,
                &peer,
                &params.plaintext
            )?))
        }
        Operation::Nip44Decrypt(params) => {
            let peer = nostr_ops::parse_pubkey(&params.peer)?;
            Ok(json!(nostr_ops::nip44_decrypt(
                &state.keystore,
                &peer,
                &params.ciphertext
            )?))
        }
        Operation::Tip(params) => {
            let keys = state.keystore.keys()?;
            let chain_key = state.keystore.chain_key()?;
            let receipt = state
                .tips
                .send(TipRequest {
                    keys,
                    chain_key,
                    recipient: params.recipient_npub,
                    amount_sat: params.amount_sat,
                    notify: params.notify,
                })
                .await?;
            Ok(serde_json::to_value(receipt)?)
        }
        Operation::ReplaceUrl(params) => {
            // With no handler configured the caller gets a plain `false`.
            match state.db.get::<String>(PROTOCOL_HANDLER)? {
                Some(template) => Ok(json!(nostr_ops::replace_url(&template, &params.url)?)),
                None => Ok(json!(false)),
            }
        }
    }
}

/// Npub form of the stored public key, for admin/display use.
pub fn npub_of(keys: &nostr::Keys) -> Result<String, AgentError> {
    keys.public_key()
        .to_bech32()
        .map_err(|e| AgentError::Serialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::PromptReply;
    use crate::policy::Condition;
    use crate::state::tests::test_state;
    use std::collections::BTreeSet;

    fn wire(json: serde_json::Value) -> Operation {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn deserializes_tagged_operations() {
        let op = wire(json!({"operationType": "getPublicKey"}));
        assert_eq!(op.operation_type(), "getPublicKey");

        let op = wire(json!({
            "operationType": "signEvent",
            "params": {"event": {"kind": 1, "content": "hi", "tags": []}}
        }));
        assert!(matches!(op, Operation::SignEvent(ref p) if p.event.kind == 1));

        let op = wire(json!({
            "operationType": "tip",
            "params": {"recipientNpub": "npub1xyz", "amountSat": 2000, "notify": true}
        }));
        assert!(matches!(op, Operation::Tip(ref p) if p.amount_sat == 2000 && p.notify));

        let op = wire(json!({
            "operationType": "nip44.encrypt",
            "params": {"peer": "ab", "plaintext": "x"}
        }));
        assert_eq!(op.operation_type(), "nip44.encrypt");
    }

    #[test]
    fn only_replace_url_is_exempt() {
        let exempt = wire(json!({"operationType": "replaceURL", "params": {"url": "nostr:x"}}));
        assert!(!exempt.requires_permission());
        assert!(wire(json!({"operationType": "getPublicKey"})).requires_permission());
    }

    #[tokio::test]
    async fn allowed_policy_executes_without_prompt() {
        let (_dir, state) = test_state();
        state
            .policies
            .update("a.example", true, "getPublicKey", None)
            .unwrap();

        let result = dispatch(&state, "a.example", wire(json!({"operationType": "getPublicKey"})))
            .await
            .unwrap();
        let hex = result.as_str().unwrap();
        assert_eq!(hex.len(), 64);
        assert!(state.broker.current_prompt().is_none());
    }

    #[tokio::test]
    async fn denied_policy_short_circuits() {
        let (_dir, state) = test_state();
        state
            .policies
            .update("a.example", false, "getPublicKey", None)
            .unwrap();

        let result =
            dispatch(&state, "a.example", wire(json!({"operationType": "getPublicKey"}))).await;
        assert!(matches!(result, Err(AgentError::PermissionDenied)));
    }

    #[tokio::test]
    async fn second_request_is_busy_while_permit_is_out() {
        let (_dir, state) = test_state();
        let _held = state.broker.try_begin().unwrap();

        let result =
            dispatch(&state, "a.example", wire(json!({"operationType": "getPublicKey"}))).await;
        assert!(matches!(result, Err(AgentError::Busy)));
    }

    #[tokio::test]
    async fn replace_url_bypasses_the_gate() {
        let (_dir, state) = test_state();
        state
            .db
            .put(PROTOCOL_HANDLER, &"https://x.example/{p_or_e}/{hex}".to_string())
            .unwrap();
        let _held = state.broker.try_begin().unwrap();

        let npub = nostr::Keys::generate().public_key().to_bech32().unwrap();
        let result = dispatch(
            &state,
            "a.example",
            wire(json!({"operationType": "replaceURL", "params": {"url": format!("nostr:{npub}")}})),
        )
        .await
        .unwrap();
        assert!(result.as_str().unwrap().starts_with("https://x.example/p/"));
    }

    #[tokio::test]
    async fn replace_url_without_handler_is_false() {
        let (_dir, state) = test_state();
        let npub = nostr::Keys::generate().public_key().to_bech32().unwrap();
        let result = dispatch(
            &state,
            "a.example",
            wire(json!({"operationType": "replaceURL", "params": {"url": format!("nostr:{npub}")}})),
        )
        .await
        .unwrap();
        assert_eq!(result, json!(false));
    }

    #[tokio::test]
    async fn prompt_reply_is_persisted_before_execution() {
        let (_dir, state) = test_state();

        let dispatch_state = state.clone();
        let task = tokio::spawn(async move {
            dispatch(
                &dispatch_state,
                "a.example",
                wire(json!({
                    "operationType": "signEvent",
                    "params": {"event": {"kind": 1, "content": "hello", "tags": []}}
                })),
            )
            .await
        });

        let view = loop {
            if let Some(view) = state.broker.current_prompt() {
                break view;
            }
            tokio::task::yield_now().await;
        };
        assert_eq!(view.operation_type, "signEvent");

        state
            .broker
            .resolve(
                view.id,
                PromptReply {
                    accept: true,
                    condition: Some(Condition {
                        kinds: Some(BTreeSet::from([1u16])),
                        max_amount: None,
                    }),
                },
            )
            .unwrap();

        let event = task.await.unwrap().unwrap();
        assert_eq!(event["kind"], 1);

        // The remembered grant now answers kind-1 requests without a prompt.
        assert_eq!(
            state
                .policies
                .decision("a.example", "signEvent", Some(1), None)
                .unwrap(),
            PolicyDecision::Allow
        );
        assert_eq!(
            state
                .policies
                .decision("a.example", "signEvent", Some(2), None)
                .unwrap(),
            PolicyDecision::Unknown
        );
    }

    #[tokio::test]
    async fn prompt_denial_is_surfaced_as_denied() {
        let (_dir, state) = test_state();

        let dispatch_state = state.clone();
        let task = tokio::spawn(async move {
            dispatch(
                &dispatch_state,
                "a.example",
                wire(json!({"operationType": "getPublicKey"})),
            )
            .await
        });

        let view = loop {
            if let Some(view) = state.broker.current_prompt() {
                break view;
            }
            tokio::task::yield_now().await;
        };
        state.broker.dismiss(view.id).unwrap();

        assert!(matches!(
            task.await.unwrap(),
            Err(AgentError::PermissionDenied)
        ));
    }
}
