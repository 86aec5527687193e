// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Nostr Custody Agent Developers

//! Nostr-side operations: event signing, NIP-04 and NIP-44 payload
//! encryption, the tip notification DM and `nostr:` URI templating.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use nostr::nips::nip04;
use nostr::nips::nip19::{FromBech32, Nip19};
use nostr::nips::nip44;
use nostr::{JsonUtil, Keys, Kind, PublicKey, Tag, Timestamp, UnsignedEvent};
use serde::Deserialize;

use crate::error::AgentError;
use crate::keystore::KeyStore;

/// Unsigned event as callers submit it (NIP-07 shape).
#[derive(Debug, Clone, Deserialize)]
pub struct EventTemplate {
    pub kind: u16,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub tags: Vec<Vec<String>>,
    /// Seconds since epoch; stamped with the current time when absent.
    #[serde(default)]
    pub created_at: Option<u64>,
}

/// Parse a public key given as npub bech32 or bare hex.
pub fn parse_pubkey(input: &str) -> Result<PublicKey, AgentError> {
    PublicKey::from_bech32(input)
        .or_else(|_| PublicKey::from_hex(input))
        .map_err(|_| AgentError::InvalidRecipient(format!("unparseable public key {input:?}")))
}

/// Sign an event template, verify the result and return it as JSON.
pub fn sign_event(keys: &Keys, template: EventTemplate) -> Result<serde_json::Value, AgentError> {
    let created_at = template
        .created_at
        .map(Timestamp::from)
        .unwrap_or_else(Timestamp::now);
    let tags = template
        .tags
        .iter()
        .map(|tag| Tag::parse(tag).map_err(|e| AgentError::Serialization(e.to_string())))
        .collect::<Result<Vec<_>, _>>()?;

    let unsigned = UnsignedEvent::new(
        keys.public_key(),
        created_at,
        Kind::from(template.kind),
        tags,
        template.content,
    );
    let event = unsigned
        .sign_with_keys(keys)
        .map_err(|e| AgentError::Crypto(format!("event signing: {e}")))?;
    event
        .verify()
        .map_err(|e| AgentError::Crypto(format!("signed event failed verification: {e}")))?;

    Ok(serde_json::from_str(&event.as_json())?)
}

pub fn nip04_encrypt(keys: &Keys, peer: &PublicKey, plaintext: &str) -> Result<String, AgentError> {
    nip04::encrypt(keys.secret_key(), peer, plaintext)
        .map_err(|e| AgentError::Crypto(format!("nip04 encrypt: {e}")))
}

pub fn nip04_decrypt(keys: &Keys, peer: &PublicKey, payload: &str) -> Result<String, AgentError> {
    nip04::decrypt(keys.secret_key(), peer, payload)
        .map_err(|e| AgentError::Crypto(format!("nip04 decrypt: {e}")))
}

/// NIP-44 v2 encryption through the keystore's conversation-key cache.
pub fn nip44_encrypt(
    keystore: &KeyStore,
    peer: &PublicKey,
    plaintext: &str,
) -> Result<String, AgentError> {
    let key = keystore.conversation_key(peer)?;
    let payload = nip44::v2::encrypt_to_bytes(&key, plaintext)
        .map_err(|e| AgentError::Crypto(format!("nip44 encrypt: {e}")))?;
    Ok(BASE64.encode(payload))
}

pub fn nip44_decrypt(
    keystore: &KeyStore,
    peer: &PublicKey,
    payload: &str,
) -> Result<String, AgentError> {
    let key = keystore.conversation_key(peer)?;
    let bytes = BASE64
        .decode(payload)
        .map_err(|e| AgentError::Crypto(format!("nip44 payload is not base64: {e}")))?;
    let plaintext = nip44::v2::decrypt_to_bytes(&key, &bytes)
        .map_err(|e| AgentError::Crypto(format!("nip44 decrypt: {e}")))?;
    String::from_utf8(plaintext)
        .map_err(|e| AgentError::Crypto(format!("nip44 plaintext is not UTF-8: {e}")))
}

/// Kind-4 DM telling the recipient about a received tip.
pub fn tip_notification_event(
    keys: &Keys,
    recipient: &PublicKey,
    txid: &str,
    amount_sat: u64,
) -> Result<nostr::Event, AgentError> {
    let content = format!(
        "You received a tip of {amount_sat} satoshi! \
         https://blockchair.com/bitcoin-cash/transaction/{txid}"
    );
    let encrypted = nip04_encrypt(keys, recipient, &content)?;
    let unsigned = UnsignedEvent::new(
        keys.public_key(),
        Timestamp::now(),
        Kind::EncryptedDirectMessage,
        vec![Tag::public_key(*recipient)],
        encrypted,
    );
    unsigned
        .sign_with_keys(keys)
        .map_err(|e| AgentError::Crypto(format!("notification signing: {e}")))
}

/// Expand a protocol-handler template for a `nostr:` URI.
///
/// Placeholders are replaced literally: `{raw}`, `{hrp}`, `{hex}`,
/// `{p_or_e}`, `{u_or_n}` and `{relay0}`..`{relay2}`. Unknown placeholders
/// are left untouched.
pub fn replace_url(template: &str, uri: &str) -> Result<String, AgentError> {
    let raw = uri.strip_prefix("nostr:").unwrap_or(uri);
    let decoded = Nip19::from_bech32(raw)
        .map_err(|e| AgentError::Serialization(format!("unparseable nostr entity: {e}")))?;

    let (hex, p_or_e, u_or_n, relays) = match decoded {
        Nip19::Pubkey(pk) => (pk.to_hex(), "p", "u", Vec::new()),
        Nip19::Profile(profile) => (
            profile.public_key.to_hex(),
            "p",
            "u",
            profile.relays.iter().map(|r| r.to_string()).collect(),
        ),
        Nip19::EventId(id) => (id.to_hex(), "e", "n", Vec::new()),
        Nip19::Event(event) => (
            event.event_id.to_hex(),
            "e",
            "n",
            event.relays.iter().map(|r| r.to_string()).collect(),
        ),
        _ => {
            return Err(AgentError::Serialization(
                "unsupported nostr entity type".to_string(),
            ))
        }
    };

    // Bech32 human-readable part: everything before the last separator.
    let hrp = raw.rfind('1').map(|i| &raw[..i]).unwrap_or("");

    let mut result = template
        .replace("{raw}", raw)
        .replace("{hrp}", hrp)
        .replace("{hex}", &hex)
        .replace("{p_or_e}", p_or_e)
        .replace("{u_or_n}", u_or_n);
    for i in 0..3 {
        let relay = relays.get(i).cloned().unwrap_or_default();
        result = result.replace(&format!("{{relay{i}}}"), &relay);
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SettingsDb;
    use nostr::nips::nip19::ToBech32;
    use std::sync::Arc;

    fn keystore_with(keys: &Keys) -> (tempfile::TempDir, KeyStore) {
        let dir = tempfile::tempdir().unwrap();
        let db = SettingsDb::open(&dir.path().join("settings.redb")).unwrap();
        let keystore = KeyStore::new(Arc::new(db));
        keystore
            .set_private_key(&keys.secret_key().to_secret_hex())
            .unwrap();
        (dir, keystore)
    }

    #[test]
    fn signs_and_verifies_a_template() {
        let keys = Keys::generate();
        let event = sign_event(
            &keys,
            EventTemplate {
                kind: 1,
                content: "hello".to_string(),
                tags: vec![vec!["t".to_string(), "tips".to_string()]],
                created_at: Some(1_700_000_000),
            },
        )
        .unwrap();

        assert_eq!(event["kind"], 1);
        assert_eq!(event["content"], "hello");
        assert_eq!(event["created_at"], 1_700_000_000u64);
        assert_eq!(event["pubkey"], keys.public_key().to_hex());
        assert_eq!(event["tags"][0][1], "tips");
        assert!(event["sig"].as_str().unwrap().len() == 128);
    }

    #[test]
    fn rejects_malformed_tags() {
        let keys = Keys::generate();
        let result = sign_event(
            &keys,
            EventTemplate {
                kind: 1,
                content: String::new(),
                tags: vec![vec![]],
                created_at: None,
            },
        );
        assert!(result.is_err());
    }

    #[test]
    fn nip04_round_trips_between_parties() {
        let alice = Keys::generate();
        let bob = Keys::generate();
        let payload = nip04_encrypt(&alice, &bob.public_key(), "the plan").unwrap();
        let plain = nip04_decrypt(&bob, &alice.public_key(), &payload).unwrap();
        assert_eq!(plain, "the plan");
    }

    #[test]
    fn nip44_round_trips_through_the_cache() {
        let alice = Keys::generate();
        let bob = Keys::generate();
        let (_da, alice_store) = keystore_with(&alice);
        let (_db, bob_store) = keystore_with(&bob);

        let payload = nip44_encrypt(&alice_store, &bob.public_key(), "quiet words").unwrap();
        let plain = nip44_decrypt(&bob_store, &alice.public_key(), &payload).unwrap();
        assert_eq!(plain, "quiet words");
    }

    #[test]
    fn notification_dm_targets_the_recipient() {
        let keys = Keys::generate();
        let recipient = Keys::generate();
        let txid = "c".repeat(64);
        let event =
            tip_notification_event(&keys, &recipient.public_key(), &txid, 5_000).unwrap();

        assert_eq!(event.kind, Kind::EncryptedDirectMessage);
        let decrypted =
            nip04_decrypt(&recipient, &keys.public_key(), &event.content).unwrap();
        assert!(decrypted.contains("5000 satoshi"));
        assert!(decrypted.contains(&txid));
    }

    #[test]
    fn replaces_pubkey_placeholders() {
        let pk = Keys::generate().public_key();
        let npub = pk.to_bech32().unwrap();
        let result = replace_url(
            "https://example.com/{p_or_e}/{hex}?raw={raw}&hrp={hrp}&r={relay0}",
            &format!("nostr:{npub}"),
        )
        .unwrap();
        assert_eq!(
            result,
            format!("https://example.com/p/{}?raw={npub}&hrp=npub&r=", pk.to_hex())
        );
    }

    #[test]
    fn rejects_non_bech32_input() {
        assert!(replace_url("{raw}", "nostr:nonsense").is_err());
    }
}
