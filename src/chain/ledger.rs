// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Nostr Custody Agent Developers

//! Ledger gateway client.
//!
//! Talks to Electrum-style HTTP gateways for balance, UTXO, fee-rate and
//! broadcast queries. Every call walks the configured gateway list in
//! order for up to [`RETRY_ROUNDS`] rounds with a fixed pause between
//! rounds. Reads degrade gracefully (stale cache, then a harmless
//! default); broadcast failures are always surfaced to the caller.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::chain::Utxo;
use crate::error::AgentError;
use crate::storage::{balance_key, SettingsDb, CACHED_FEE_RATE};

/// Full passes over the gateway list before giving up.
const RETRY_ROUNDS: u32 = 3;

/// Pause between retry rounds.
const RETRY_DELAY: Duration = Duration::from_secs(2);

/// Cached balance and fee-rate entries older than this are stale.
const CACHE_TTL_SECS: i64 = 300;

/// Fallback fee rate in satoshi per byte when no estimate is reachable.
const DEFAULT_FEE_RATE: u64 = 1;

/// Read-side and broadcast access to the chain.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Spendable balance of an address in satoshi.
    async fn balance(&self, address: &str) -> Result<u64, AgentError>;

    /// Unspent outputs of an address.
    async fn utxos(&self, address: &str) -> Result<Vec<Utxo>, AgentError>;

    /// Current fee rate in satoshi per byte, always at least 1.
    async fn fee_rate(&self) -> Result<u64, AgentError>;

    /// Submit raw transaction bytes; returns the confirmed txid.
    async fn broadcast(&self, raw_tx: &[u8]) -> Result<String, AgentError>;
}

/// A cached numeric value with its write time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct CachedValue {
    value: u64,
    timestamp: i64,
}

#[derive(Debug, Deserialize)]
struct BalanceResponse {
    confirmed: u64,
    #[serde(default)]
    unconfirmed: i64,
}

/// Gateway UTXO entry, normalized into [`Utxo`].
#[derive(Debug, Deserialize)]
struct UtxoResponse {
    tx_hash: String,
    tx_pos: u32,
    value: u64,
    height: i64,
    #[serde(default)]
    token_data: Option<serde_json::Value>,
}

impl From<UtxoResponse> for Utxo {
    fn from(r: UtxoResponse) -> Self {
        Utxo {
            txid: r.tx_hash,
            vout: r.tx_pos,
            value: r.value,
            height: r.height,
            token_data: r.token_data,
        }
    }
}

#[derive(Debug, Serialize)]
struct BroadcastRequest<'a> {
    raw_tx: &'a str,
}

pub struct HttpLedgerClient {
    client: reqwest::Client,
    endpoints: Vec<Url>,
    db: Arc<SettingsDb>,
}

impl HttpLedgerClient {
    pub fn new(endpoints: Vec<Url>, db: Arc<SettingsDb>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .unwrap_or_default();
        Self {
            client,
            endpoints,
            db,
        }
    }

    /// Join a path onto a gateway base URL.
    fn endpoint_url(base: &Url, path: &str) -> Result<Url, AgentError> {
        let mut url = base.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| AgentError::Network(format!("gateway URL {base} cannot be a base")))?;
            segments.pop_if_empty();
            for segment in path.split('/') {
                segments.push(segment);
            }
        }
        Ok(url)
    }

    /// Walk every gateway for up to [`RETRY_ROUNDS`] rounds.
    async fn with_retries<T, F, Fut>(&self, operation: &str, mut attempt: F) -> Result<T, AgentError>
    where
        F: FnMut(Url) -> Fut,
        Fut: std::future::Future<Output = Result<T, AgentError>>,
    {
        if self.endpoints.is_empty() {
            return Err(AgentError::Network("no ledger gateways configured".to_string()));
        }
        let mut last_error = None;
        for round in 0..RETRY_ROUNDS {
            for base in &self.endpoints {
                match attempt(base.clone()).await {
                    Ok(value) => return Ok(value),
                    Err(e) => {
                        tracing::warn!(
                            operation,
                            gateway = %base,
                            round,
                            error = %e,
                            "Ledger gateway call failed"
                        );
                        last_error = Some(e);
                    }
                }
            }
            if round + 1 < RETRY_ROUNDS {
                tokio::time::sleep(RETRY_DELAY).await;
            }
        }
        Err(last_error
            .unwrap_or_else(|| AgentError::Network(format!("{operation} failed on all gateways"))))
    }

    fn fresh_cache(&self, key: &str) -> Option<u64> {
        let cached: Option<CachedValue> = self.db.get(key).ok().flatten();
        cached
            .filter(|c| Utc::now().timestamp() - c.timestamp < CACHE_TTL_SECS)
            .map(|c| c.value)
    }

    fn stale_cache(&self, key: &str) -> Option<u64> {
        self.db
            .get::<CachedValue>(key)
            .ok()
            .flatten()
            .map(|c| c.value)
    }

    fn store_cache(&self, key: &str, value: u64) {
        let entry = CachedValue {
            value,
            timestamp: Utc::now().timestamp(),
        };
        if let Err(e) = self.db.put(key, &entry) {
            tracing::warn!(key, error = %e, "Failed to persist ledger cache entry");
        }
    }

    async fn fetch_balance(&self, address: &str) -> Result<u64, AgentError> {
        let path = format!("address/{address}/balance");
        self.with_retries("balance", |base| {
            let path = path.clone();
            let client = self.client.clone();
            async move {
                let url = Self::endpoint_url(&base, &path)?;
                let response: BalanceResponse = get_json(&client, url).await?;
                Ok(spendable_balance(&response))
            }
        })
        .await
    }

    async fn fetch_fee_rate(&self) -> Result<u64, AgentError> {
        self.with_retries("fee_rate", |base| {
            let client = self.client.clone();
            async move {
                let url = Self::endpoint_url(&base, "fee/estimate")?;
                let coin_per_kb: f64 = get_json(&client, url).await?;
                Ok(fee_rate_sat_per_byte(coin_per_kb))
            }
        })
        .await
    }
}

async fn get_json<T: serde::de::DeserializeOwned>(
    client: &reqwest::Client,
    url: Url,
) -> Result<T, AgentError> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| AgentError::Network(e.to_string()))?;
    if !response.status().is_success() {
        return Err(AgentError::Network(format!(
            "gateway returned status {}",
            response.status()
        )));
    }
    response
        .json()
        .await
        .map_err(|e| AgentError::Network(format!("malformed gateway response: {e}")))
}

/// Confirmed plus any positive unconfirmed delta.
fn spendable_balance(response: &BalanceResponse) -> u64 {
    if response.unconfirmed >= 0 {
        response.confirmed.saturating_add(response.unconfirmed as u64)
    } else {
        response.confirmed.saturating_sub(response.unconfirmed.unsigned_abs())
    }
}

/// Convert a coin-per-kilobyte estimate into whole satoshi per byte.
///
/// 1 BCH/kB = 100_000 sat/B. Estimates at or below zero (gateways signal
/// "no estimate" with -1) fall back to the floor rate.
fn fee_rate_sat_per_byte(coin_per_kb: f64) -> u64 {
    if !coin_per_kb.is_finite() || coin_per_kb <= 0.0 {
        return DEFAULT_FEE_RATE;
    }
    ((coin_per_kb * 100_000.0).round() as u64).max(DEFAULT_FEE_RATE)
}

/// A broadcast reply must be a 64-digit lowercase hex txid.
fn validate_txid(txid: &str) -> Result<String, AgentError> {
    let trimmed = txid.trim().trim_matches('"');
    if trimmed.len() == 64
        && trimmed
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
    {
        Ok(trimmed.to_string())
    } else {
        Err(AgentError::Network(format!(
            "gateway returned malformed txid: {txid:?}"
        )))
    }
}

#[async_trait]
impl Ledger for HttpLedgerClient {
    async fn balance(&self, address: &str) -> Result<u64, AgentError> {
        let key = balance_key(address);
        if let Some(fresh) = self.fresh_cache(&key) {
            return Ok(fresh);
        }
        match self.fetch_balance(address).await {
            Ok(balance) => {
                self.store_cache(&key, balance);
                Ok(balance)
            }
            Err(e) => {
                tracing::warn!(address, error = %e, "Balance unavailable, degrading to cache");
                Ok(self.stale_cache(&key).unwrap_or(0))
            }
        }
    }

    async fn utxos(&self, address: &str) -> Result<Vec<Utxo>, AgentError> {
        let path = format!("address/{address}/utxos");
        let result = self
            .with_retries("utxos", |base| {
                let path = path.clone();
                let client = self.client.clone();
                async move {
                    let url = Self::endpoint_url(&base, &path)?;
                    let entries: Vec<UtxoResponse> = get_json(&client, url).await?;
                    Ok(entries.into_iter().map(Utxo::from).collect::<Vec<_>>())
                }
            })
            .await;
        match result {
            Ok(utxos) => Ok(utxos),
            Err(e) => {
                tracing::warn!(address, error = %e, "UTXO set unavailable, degrading to empty");
                Ok(Vec::new())
            }
        }
    }

    async fn fee_rate(&self) -> Result<u64, AgentError> {
        if let Some(fresh) = self.fresh_cache(CACHED_FEE_RATE) {
            return Ok(fresh);
        }
        match self.fetch_fee_rate().await {
            Ok(rate) => {
                self.store_cache(CACHED_FEE_RATE, rate);
                Ok(rate)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Fee estimate unavailable, degrading to cache");
                Ok(self.stale_cache(CACHED_FEE_RATE).unwrap_or(DEFAULT_FEE_RATE))
            }
        }
    }

    async fn broadcast(&self, raw_tx: &[u8]) -> Result<String, AgentError> {
        let raw_hex = hex::encode(raw_tx);
        self.with_retries("broadcast", |base| {
            let raw_hex = raw_hex.clone();
            let client = self.client.clone();
            async move {
                let url = Self::endpoint_url(&base, "tx/broadcast")?;
                let response = client
                    .post(url)
                    .json(&BroadcastRequest { raw_tx: &raw_hex })
                    .send()
                    .await
                    .map_err(|e| AgentError::Network(e.to_string()))?;
                if !response.status().is_success() {
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();
                    return Err(AgentError::Network(format!(
                        "broadcast rejected with status {status}: {body}"
                    )));
                }
                let body = response
                    .text()
                    .await
                    .map_err(|e| AgentError::Network(e.to_string()))?;
                // Some gateways return a bare string, some a {"txid": ...}.
                let txid = serde_json::from_str::<serde_json::Value>(&body)
                    .ok()
                    .and_then(|v| match v {
                        serde_json::Value::String(s) => Some(s),
                        serde_json::Value::Object(map) => map
                            .get("txid")
                            .and_then(|t| t.as_str())
                            .map(str::to_string),
                        _ => None,
                    })
                    .unwrap_or(body);
                validate_txid(&txid)
            }
        })
        .await
    }
}
