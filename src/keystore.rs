// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Nostr Custody Agent Developers

//! Key custody.
//!
//! The secret key lives only in the settings database and is re-read per
//! operation; nothing long-lived holds key material. The one concession
//! is the NIP-44 conversation-key cache, which memoizes the expensive
//! ECDH+HKDF derivation per peer and is dropped wholesale the moment the
//! active secret changes.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use lru::LruCache;
use nostr::nips::nip44;

use crate::chain::builder::ChainKey;
use crate::error::AgentError;
use crate::storage::SettingsDb;

/// Peers whose derived conversation keys are retained.
const CONVERSATION_CACHE_SIZE: usize = 100;

struct CacheState {
    /// Hex of the secret the cached entries were derived from.
    owner: Option<String>,
    entries: LruCache<String, Arc<nip44::v2::ConversationKey>>,
}

pub struct KeyStore {
    db: Arc<SettingsDb>,
    cache: Mutex<CacheState>,
}

impl KeyStore {
    pub fn new(db: Arc<SettingsDb>) -> Self {
        Self {
            db,
            cache: Mutex::new(CacheState {
                owner: None,
                entries: LruCache::new(
                    NonZeroUsize::new(CONVERSATION_CACHE_SIZE).expect("nonzero capacity"),
                ),
            }),
        }
    }

    fn secret_hex(&self) -> Result<String, AgentError> {
        self.db.private_key()?.ok_or(AgentError::NoPrivateKey)
    }

    /// Nostr identity keys for the stored secret.
    pub fn keys(&self) -> Result<nostr::Keys, AgentError> {
        let secret = nostr::SecretKey::from_hex(&self.secret_hex()?)
            .map_err(|e| AgentError::Crypto(format!("stored key is invalid: {e}")))?;
        Ok(nostr::Keys::new(secret))
    }

    /// Chain-side signing key for the same secret, parity-normalized.
    pub fn chain_key(&self) -> Result<ChainKey, AgentError> {
        let bytes = hex::decode(self.secret_hex()?)
            .map_err(|e| AgentError::Crypto(format!("stored key is invalid: {e}")))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| AgentError::Crypto("stored key has wrong length".to_string()))?;
        ChainKey::from_bytes(&bytes)
    }

    /// Validate and store a replacement secret key.
    pub fn set_private_key(&self, hex_key: &str) -> Result<(), AgentError> {
        let hex_key = hex_key.trim().to_lowercase();
        nostr::SecretKey::from_hex(&hex_key)
            .map_err(|e| AgentError::Crypto(format!("invalid private key: {e}")))?;
        self.db.set_private_key(&hex_key)?;

        let mut cache = self.cache.lock().expect("conversation cache lock poisoned");
        cache.owner = None;
        cache.entries.clear();
        Ok(())
    }

    /// NIP-44 conversation key with `peer`, derived once per peer and
    /// cached until the active secret changes.
    pub fn conversation_key(
        &self,
        peer: &nostr::PublicKey,
    ) -> Result<Arc<nip44::v2::ConversationKey>, AgentError> {
        let secret_hex = self.secret_hex()?;
        let mut cache = self.cache.lock().expect("conversation cache lock poisoned");

        if cache.owner.as_deref() != Some(secret_hex.as_str()) {
            cache.entries.clear();
            cache.owner = Some(secret_hex.clone());
        }

        let peer_hex = peer.to_hex();
        if let Some(key) = cache.entries.get(&peer_hex) {
            return Ok(key.clone());
        }

        let secret = nostr::SecretKey::from_hex(&secret_hex)
            .map_err(|e| AgentError::Crypto(format!("stored key is invalid: {e}")))?;
        let key = Arc::new(nip44::v2::ConversationKey::derive(&secret, peer));
        cache.entries.put(peer_hex, key.clone());
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keystore() -> (tempfile::TempDir, KeyStore) {
        let dir = tempfile::tempdir().unwrap();
        let db = SettingsDb::open(&dir.path().join("settings.redb")).unwrap();
        (dir, KeyStore::new(Arc::new(db)))
    }

    fn generate_hex() -> String {
        nostr::Keys::generate().secret_key().to_secret_hex()
    }

    #[test]
    fn missing_key_is_a_precondition_failure() {
        let (_dir, keystore) = keystore();
        assert!(matches!(keystore.keys(), Err(AgentError::NoPrivateKey)));
        assert!(matches!(
            keystore.chain_key(),
            Err(AgentError::NoPrivateKey)
        ));
    }

    #[test]
    fn stores_and_loads_keys() {
        let (_dir, keystore) = keystore();
        let hex_key = generate_hex();
        keystore.set_private_key(&hex_key).unwrap();

        let keys = keystore.keys().unwrap();
        assert_eq!(keys.secret_key().to_secret_hex(), hex_key);
        // The chain key is derived from the same scalar and always carries
        // the even-parity compressed form.
        assert_eq!(keystore.chain_key().unwrap().compressed_public_key()[0], 0x02);
    }

    #[test]
    fn rejects_malformed_private_keys() {
        let (_dir, keystore) = keystore();
        assert!(keystore.set_private_key("not hex").is_err());
        assert!(keystore.set_private_key("abcd").is_err());
    }

    #[test]
    fn conversation_keys_are_cached_per_peer() {
        let (_dir, keystore) = keystore();
        keystore.set_private_key(&generate_hex()).unwrap();
        let peer = nostr::Keys::generate().public_key();

        let first = keystore.conversation_key(&peer).unwrap();
        let second = keystore.conversation_key(&peer).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn key_rotation_drops_the_cache() {
        let (_dir, keystore) = keystore();
        keystore.set_private_key(&generate_hex()).unwrap();
        let peer = nostr::Keys::generate().public_key();
        let before = keystore.conversation_key(&peer).unwrap();

        keystore.set_private_key(&generate_hex()).unwrap();
        let after = keystore.conversation_key(&peer).unwrap();
        assert!(!Arc::ptr_eq(&before, &after));
    }
}
