// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Nostr Custody Agent Developers

//! Shared application state handed to every handler.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::broker::{AuthBroker, NullPromptSurface, PromptSurface, WebhookPromptSurface};
use crate::chain::ledger::{HttpLedgerClient, Ledger};
use crate::chain::tip::TipOrchestrator;
use crate::config::AppConfig;
use crate::error::AgentError;
use crate::keystore::KeyStore;
use crate::notify::{Notifier, NullNotifier, RelayNotifier};
use crate::policy::PolicyStore;
use crate::storage::SettingsDb;

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<SettingsDb>,
    pub keystore: Arc<KeyStore>,
    pub policies: Arc<PolicyStore>,
    pub broker: Arc<AuthBroker>,
    pub tips: Arc<TipOrchestrator>,
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Wire the full production stack from configuration.
    pub fn from_config(config: &AppConfig, shutdown: CancellationToken) -> Result<Self, AgentError> {
        std::fs::create_dir_all(&config.data_dir)
            .map_err(|e| AgentError::Storage(format!("cannot create data dir: {e}")))?;
        let db = Arc::new(SettingsDb::open(&config.data_dir.join("settings.redb"))?);

        let surface: Arc<dyn PromptSurface> = match &config.prompt_webhook_url {
            Some(url) => Arc::new(WebhookPromptSurface::new(url.clone())),
            None => Arc::new(NullPromptSurface),
        };
        let notifier: Arc<dyn Notifier> = if config.notify_relays.is_empty() {
            Arc::new(NullNotifier)
        } else {
            Arc::new(RelayNotifier::new(config.notify_relays.clone()))
        };
        let ledger: Arc<dyn Ledger> =
            Arc::new(HttpLedgerClient::new(config.ledger_urls.clone(), db.clone()));

        Ok(Self::assemble(db, surface, ledger, notifier, shutdown))
    }

    pub fn assemble(
        db: Arc<SettingsDb>,
        surface: Arc<dyn PromptSurface>,
        ledger: Arc<dyn Ledger>,
        notifier: Arc<dyn Notifier>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            keystore: Arc::new(KeyStore::new(db.clone())),
            policies: Arc::new(PolicyStore::new(db.clone())),
            broker: Arc::new(AuthBroker::new(surface)),
            tips: Arc::new(TipOrchestrator::new(ledger, notifier, shutdown.clone())),
            db,
            shutdown,
        }
    }

}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::chain::Utxo;
    use async_trait::async_trait;

    /// Ledger stub with a healthy balance and one large UTXO.
    pub(crate) struct StubLedger;

    #[async_trait]
    impl Ledger for StubLedger {
        async fn balance(&self, _address: &str) -> Result<u64, AgentError> {
            Ok(1_000_000)
        }

        async fn utxos(&self, _address: &str) -> Result<Vec<Utxo>, AgentError> {
            Ok(vec![Utxo {
                txid: "ab".repeat(32),
                vout: 0,
                value: 1_000_000,
                height: 100,
                token_data: None,
            }])
        }

        async fn fee_rate(&self) -> Result<u64, AgentError> {
            Ok(1)
        }

        async fn broadcast(&self, _raw_tx: &[u8]) -> Result<String, AgentError> {
            Ok("e".repeat(64))
        }
    }

    /// Fully wired state over a temp database, stub ledger and a stored
    /// freshly generated key.
    pub(crate) fn test_state() -> (tempfile::TempDir, AppState) {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(SettingsDb::open(&dir.path().join("settings.redb")).unwrap());
        let state = AppState::assemble(
            db,
            Arc::new(NullPromptSurface),
            Arc::new(StubLedger),
            Arc::new(NullNotifier),
            CancellationToken::new(),
        );
        let secret = nostr::Keys::generate().secret_key().to_secret_hex();
        state.keystore.set_private_key(&secret).unwrap();
        (dir, state)
    }
}
