// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Nostr Custody Agent Developers

//! Tip notifications over Nostr relays.
//!
//! Publishes the kind-4 DM produced after a successful broadcast to each
//! configured relay over a short-lived websocket, waiting briefly for the
//! `OK` acknowledgement. Notification is strictly best-effort: every
//! failure is logged and swallowed, the tip already happened.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use nostr::{JsonUtil, Keys, PublicKey};
use tokio_tungstenite::tungstenite::Message;

use crate::nostr_ops;

/// How long each relay gets to accept the event.
const RELAY_TIMEOUT: Duration = Duration::from_secs(5);

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_tip_notification(
        &self,
        keys: &Keys,
        recipient: &PublicKey,
        txid: &str,
        amount_sat: u64,
    );
}

/// Discards notifications. Used when no relays are configured and in tests.
pub struct NullNotifier;

#[async_trait]
impl Notifier for NullNotifier {
    async fn send_tip_notification(
        &self,
        _keys: &Keys,
        _recipient: &PublicKey,
        _txid: &str,
        _amount_sat: u64,
    ) {
    }
}

pub struct RelayNotifier {
    relays: Vec<String>,
}

impl RelayNotifier {
    pub fn new(relays: Vec<String>) -> Self {
        Self { relays }
    }
}

/// `["EVENT", <event>]` client frame.
fn event_frame(event: &nostr::Event) -> String {
    format!(r#"["EVENT",{}]"#, event.as_json())
}

/// Parse a relay frame as an `OK` acknowledgement for `event_id`,
/// returning the accepted flag.
fn ok_ack(frame: &str, event_id: &str) -> Option<bool> {
    let value: serde_json::Value = serde_json::from_str(frame).ok()?;
    let arr = value.as_array()?;
    if arr.first()?.as_str()? != "OK" || arr.get(1)?.as_str()? != event_id {
        return None;
    }
    arr.get(2)?.as_bool()
}

async fn publish_to_relay(relay: &str, frame: &str, event_id: &str) -> Result<(), String> {
    let (mut ws, _) = tokio_tungstenite::connect_async(relay)
        .await
        .map_err(|e| format!("connect: {e}"))?;
    ws.send(Message::Text(frame.to_string()))
        .await
        .map_err(|e| format!("send: {e}"))?;

    while let Some(message) = ws.next().await {
        let message = message.map_err(|e| format!("recv: {e}"))?;
        if let Message::Text(text) = message {
            match ok_ack(&text, event_id) {
                Some(true) => return Ok(()),
                Some(false) => return Err(format!("relay rejected event: {text}")),
                None => continue,
            }
        }
    }
    Err("connection closed before acknowledgement".to_string())
}

#[async_trait]
impl Notifier for RelayNotifier {
    async fn send_tip_notification(
        &self,
        keys: &Keys,
        recipient: &PublicKey,
        txid: &str,
        amount_sat: u64,
    ) {
        let event = match nostr_ops::tip_notification_event(keys, recipient, txid, amount_sat) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(error = %e, "Could not build tip notification");
                return;
            }
        };
        let frame = event_frame(&event);
        let event_id = event.id.to_hex();

        let publishes = self.relays.iter().map(|relay| {
            let frame = frame.clone();
            let event_id = event_id.clone();
            async move {
                match tokio::time::timeout(
                    RELAY_TIMEOUT,
                    publish_to_relay(relay, &frame, &event_id),
                )
                .await
                {
                    Ok(Ok(())) => {
                        tracing::debug!(relay, "Tip notification accepted");
                    }
                    Ok(Err(e)) => {
                        tracing::warn!(relay, error = %e, "Tip notification failed");
                    }
                    Err(_) => {
                        tracing::warn!(relay, "Tip notification timed out");
                    }
                }
            }
        });
        futures_util::future::join_all(publishes).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_events_for_publishing() {
        let keys = Keys::generate();
        let recipient = Keys::generate().public_key();
        let event =
            nostr_ops::tip_notification_event(&keys, &recipient, &"a".repeat(64), 2_000).unwrap();
        let frame = event_frame(&event);
        assert!(frame.starts_with(r#"["EVENT",{"#));

        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value[0], "EVENT");
        assert_eq!(value[1]["kind"], 4);
    }

    #[test]
    fn recognizes_ok_acknowledgements() {
        let id = "ab".repeat(32);
        assert_eq!(ok_ack(&format!(r#"["OK","{id}",true,""]"#), &id), Some(true));
        assert_eq!(
            ok_ack(&format!(r#"["OK","{id}",false,"blocked"]"#), &id),
            Some(false)
        );
        // Acks for other events and other frame types are skipped.
        assert_eq!(ok_ack(r#"["OK","deadbeef",true,""]"#, &id), None);
        assert_eq!(ok_ack(r#"["NOTICE","hi"]"#, &id), None);
        assert_eq!(ok_ack("not json", &id), None);
    }
}
