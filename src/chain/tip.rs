// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Nostr Custody Agent Developers

//! Tip orchestration.
//!
//! Drives one approved tip end to end: recipient resolution, balance
//! fail-fast, UTXO snapshot, offloaded build/sign, broadcast and the
//! optional fire-and-forget recipient notification.

use std::sync::Arc;

use k256::elliptic_curve::sec1::FromEncodedPoint;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::chain::builder::{self, fee_for, ChainKey};
use crate::chain::ledger::Ledger;
use crate::chain::{address, spendable_utxos, DUST_LIMIT};
use crate::error::AgentError;
use crate::notify::Notifier;

/// Smallest tip the agent will send, in satoshi.
pub const MIN_TIP_SAT: u64 = 1_000;

/// Everything a single tip needs from the caller.
pub struct TipRequest {
    /// Nostr identity, used only for the recipient notification DM.
    pub keys: nostr::Keys,
    /// Chain-side signing key derived from the same secret.
    pub chain_key: ChainKey,
    pub recipient: String,
    pub amount_sat: u64,
    pub notify: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TipReceipt {
    pub txid: String,
    pub amount_sat: u64,
    pub recipient_address: String,
}

pub struct TipOrchestrator {
    ledger: Arc<dyn Ledger>,
    notifier: Arc<dyn Notifier>,
    shutdown: CancellationToken,
}

impl TipOrchestrator {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        notifier: Arc<dyn Notifier>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            ledger,
            notifier,
            shutdown,
        }
    }

    pub async fn send(&self, request: TipRequest) -> Result<TipReceipt, AgentError> {
        if request.amount_sat < MIN_TIP_SAT {
            return Err(AgentError::DustAmount(format!(
                "tip amount {} below minimum of {MIN_TIP_SAT} satoshi",
                request.amount_sat
            )));
        }

        let recipient_key = crate::nostr_ops::parse_pubkey(&request.recipient)?;
        let recipient_address = address_for_pubkey(&recipient_key)?;
        let sender_address = request.chain_key.address();

        // A zero balance skips the UTXO fetch entirely.
        let balance = self.ledger.balance(&sender_address).await?;
        if balance == 0 {
            return Err(AgentError::InsufficientFunds(
                "No balance available".to_string(),
            ));
        }

        let fee_rate = self.ledger.fee_rate().await?;

        // Conservative pre-check before touching the UTXO set: assume two
        // inputs and two outputs plus a dust-sized change margin.
        let required = request
            .amount_sat
            .saturating_add(fee_for(2, 2, fee_rate))
            .saturating_add(DUST_LIMIT);
        if balance < required {
            return Err(AgentError::InsufficientFunds(format!(
                "balance {balance} satoshi below required {required}"
            )));
        }

        let utxos = spendable_utxos(self.ledger.utxos(&sender_address).await?);
        if utxos.is_empty() {
            return Err(AgentError::InsufficientFunds(
                "no spendable outputs".to_string(),
            ));
        }

        let raw_tx = builder::build_and_sign_offloaded(
            request.chain_key.clone(),
            utxos,
            recipient_address.clone(),
            request.amount_sat,
            fee_rate,
            self.shutdown.clone(),
        )
        .await?;

        let txid = self.ledger.broadcast(&raw_tx).await?;
        tracing::info!(
            txid,
            amount_sat = request.amount_sat,
            recipient = %recipient_address,
            "Tip broadcast"
        );

        if request.notify {
            let notifier = self.notifier.clone();
            let keys = request.keys.clone();
            let txid_for_dm = txid.clone();
            let amount = request.amount_sat;
            // Notification failures never affect the tip outcome.
            tokio::spawn(async move {
                notifier
                    .send_tip_notification(&keys, &recipient_key, &txid_for_dm, amount)
                    .await;
            });
        }

        Ok(TipReceipt {
            txid,
            amount_sat: request.amount_sat,
            recipient_address,
        })
    }
}

/// P2PKH address for an x-only key.
///
/// The x coordinate is lifted with the even-parity prefix first, odd as a
/// fallback, matching how wallets derive a chain address from a Nostr key.
fn address_for_pubkey(key: &nostr::PublicKey) -> Result<String, AgentError> {
    let x = key.to_bytes();
    let compressed = [0x02u8, 0x03]
        .iter()
        .find_map(|&prefix| {
            let mut sec1 = [0u8; 33];
            sec1[0] = prefix;
            sec1[1..].copy_from_slice(&x);
            let point = k256::EncodedPoint::from_bytes(sec1).ok()?;
            Option::<k256::AffinePoint>::from(k256::AffinePoint::from_encoded_point(&point))
                .map(|_| sec1)
        })
        .ok_or_else(|| {
            AgentError::InvalidRecipient("recipient key is not on the curve".to_string())
        })?;

    let hash = builder::hash160(&compressed);
    Ok(address::encode(
        address::DEFAULT_PREFIX,
        address::VERSION_P2PKH,
        &hash,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::NullNotifier;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct MockLedger {
        balance: u64,
        utxos: Vec<crate::chain::Utxo>,
        utxos_called: AtomicBool,
    }

    impl MockLedger {
        fn new(balance: u64, values: &[u64]) -> Self {
            Self {
                balance,
                utxos: values
                    .iter()
                    .enumerate()
                    .map(|(i, &value)| crate::chain::Utxo {
                        txid: "ab".repeat(32),
                        vout: i as u32,
                        value,
                        height: 100,
                        token_data: None,
                    })
                    .collect(),
                utxos_called: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl Ledger for MockLedger {
        async fn balance(&self, _address: &str) -> Result<u64, AgentError> {
            Ok(self.balance)
        }

        async fn utxos(&self, _address: &str) -> Result<Vec<crate::chain::Utxo>, AgentError> {
            self.utxos_called.store(true, Ordering::SeqCst);
            Ok(self.utxos.clone())
        }

        async fn fee_rate(&self) -> Result<u64, AgentError> {
            Ok(1)
        }

        async fn broadcast(&self, _raw_tx: &[u8]) -> Result<String, AgentError> {
            Ok("f".repeat(64))
        }
    }

    fn request(ledger: &Arc<MockLedger>, amount: u64) -> (TipOrchestrator, TipRequest) {
        let keys = nostr::Keys::generate();
        let secret: [u8; 32] = keys.secret_key().to_secret_bytes();
        let chain_key = ChainKey::from_bytes(&secret).unwrap();
        let orchestrator = TipOrchestrator::new(
            ledger.clone(),
            Arc::new(NullNotifier),
            CancellationToken::new(),
        );
        let recipient = nostr::Keys::generate().public_key().to_hex();
        (
            orchestrator,
            TipRequest {
                keys,
                chain_key,
                recipient,
                amount_sat: amount,
                notify: false,
            },
        )
    }

    #[tokio::test]
    async fn rejects_sub_minimum_amounts() {
        let ledger = Arc::new(MockLedger::new(1_000_000, &[500_000]));
        let (orchestrator, req) = request(&ledger, MIN_TIP_SAT - 1);
        assert!(matches!(
            orchestrator.send(req).await,
            Err(AgentError::DustAmount(_))
        ));
    }

    #[tokio::test]
    async fn zero_balance_fails_before_utxo_fetch() {
        let ledger = Arc::new(MockLedger::new(0, &[500_000]));
        let (orchestrator, req) = request(&ledger, 10_000);
        let result = orchestrator.send(req).await;
        assert!(matches!(result, Err(AgentError::InsufficientFunds(_))));
        assert!(!ledger.utxos_called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn short_balance_fails_conservative_precheck() {
        let ledger = Arc::new(MockLedger::new(10_100, &[10_100]));
        let (orchestrator, req) = request(&ledger, 10_000);
        assert!(matches!(
            orchestrator.send(req).await,
            Err(AgentError::InsufficientFunds(_))
        ));
    }

    #[tokio::test]
    async fn broadcasts_and_returns_receipt() {
        let ledger = Arc::new(MockLedger::new(1_000_000, &[600_000, 400_000]));
        let (orchestrator, req) = request(&ledger, 50_000);
        let receipt = orchestrator.send(req).await.unwrap();
        assert_eq!(receipt.txid, "f".repeat(64));
        assert_eq!(receipt.amount_sat, 50_000);
        assert!(receipt.recipient_address.starts_with("bitcoincash:q"));
    }

    #[tokio::test]
    async fn rejects_garbage_recipient() {
        let ledger = Arc::new(MockLedger::new(1_000_000, &[500_000]));
        let (orchestrator, mut req) = request(&ledger, 10_000);
        req.recipient = "npub1notakey".to_string();
        assert!(matches!(
            orchestrator.send(req).await,
            Err(AgentError::InvalidRecipient(_))
        ));
    }
}
