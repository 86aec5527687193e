// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Nostr Custody Agent Developers

//! Bitcoin Cash integration: address codec, ledger client, transaction
//! construction and the tip orchestrator.

pub mod address;
pub mod builder;
pub mod ledger;
pub mod tip;

use serde::{Deserialize, Serialize};

/// Minimum economical output value in satoshi.
pub const DUST_LIMIT: u64 = 546;

/// An unspent output as normalized from the ledger provider.
///
/// A fetched set is a snapshot: staleness is tolerated and each operation
/// re-fetches rather than tracking spends.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Utxo {
    pub txid: String,
    pub vout: u32,
    /// Value in satoshi.
    pub value: u64,
    /// Confirmation height; 0 for mempool, negative for provider-flagged
    /// unspendable entries.
    pub height: i64,
    /// Token commitment attached by the provider, if any. Outputs carrying
    /// tokens are never spent by the agent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_data: Option<serde_json::Value>,
}

impl Utxo {
    /// Whether this output is plain spendable value.
    pub fn is_spendable(&self) -> bool {
        self.height >= 0 && self.token_data.is_none()
    }
}

/// Drop provider entries the transaction builder must never touch.
pub fn spendable_utxos(utxos: Vec<Utxo>) -> Vec<Utxo> {
    utxos.into_iter().filter(Utxo::is_spendable).collect()
}

/// Sum of a UTXO set, saturating rather than wrapping on absurd inputs.
pub fn total_value(utxos: &[Utxo]) -> u64 {
    utxos.iter().fold(0u64, |sum, u| sum.saturating_add(u.value))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utxo(value: u64, height: i64, token: bool) -> Utxo {
        Utxo {
            txid: "00".repeat(32),
            vout: 0,
            value,
            height,
            token_data: token.then(|| serde_json::json!({"category": "aa"})),
        }
    }

    #[test]
    fn filters_token_and_negative_height_outputs() {
        let utxos = vec![
            utxo(1_000, 5, false),
            utxo(2_000, -1, false),
            utxo(3_000, 9, true),
            utxo(4_000, 0, false),
        ];
        let spendable = spendable_utxos(utxos);
        assert_eq!(
            spendable.iter().map(|u| u.value).collect::<Vec<_>>(),
            vec![1_000, 4_000]
        );
        assert_eq!(total_value(&spendable), 5_000);
    }
}
