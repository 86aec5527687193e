// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Nostr Custody Agent Developers

//! # Runtime Configuration
//!
//! Configuration is loaded from the environment once at startup.
//!
//! ## Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `DATA_DIR` | Directory holding the settings database | `/data` |
//! | `HOST` | Server bind address | `0.0.0.0` |
//! | `PORT` | Server bind port | `8080` |
//! | `LEDGER_URLS` | Comma-separated ledger gateway base URLs | public gateways |
//! | `NOTIFY_RELAYS` | Comma-separated relay URLs for tip notifications | public relays |
//! | `PROMPT_WEBHOOK_URL` | Confirmation-surface push endpoint | unset (poll only) |
//! | `LOG_FORMAT` | Logging format (`json` or `pretty`) | `pretty` |
//! | `RUST_LOG` | Log level filter | `info` |

use std::env;
use std::path::PathBuf;

use url::Url;

pub const DATA_DIR_ENV: &str = "DATA_DIR";
pub const HOST_ENV: &str = "HOST";
pub const PORT_ENV: &str = "PORT";
pub const LEDGER_URLS_ENV: &str = "LEDGER_URLS";
pub const NOTIFY_RELAYS_ENV: &str = "NOTIFY_RELAYS";
pub const PROMPT_WEBHOOK_URL_ENV: &str = "PROMPT_WEBHOOK_URL";
pub const LOG_FORMAT_ENV: &str = "LOG_FORMAT";

/// Electrum-style HTTP gateways queried for balance/UTXO/fee/broadcast.
pub const DEFAULT_LEDGER_URLS: &str =
    "https://cashnode.bch.ninja/api,https://fulcrum.criptolayer.net/api";

/// Relays the tip notification DM is published to.
pub const DEFAULT_NOTIFY_RELAYS: &str =
    "wss://relay.damus.io,wss://nos.lol,wss://nostr.mom";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub host: String,
    pub port: u16,
    pub ledger_urls: Vec<Url>,
    pub notify_relays: Vec<String>,
    pub prompt_webhook_url: Option<Url>,
    pub json_logs: bool,
}

impl AppConfig {
    /// Load configuration from the environment, falling back to defaults.
    ///
    /// Malformed URLs are skipped with a warning rather than aborting
    /// startup; an empty gateway list only matters once a chain operation
    /// actually runs.
    pub fn from_env() -> Self {
        let data_dir =
            PathBuf::from(env::var(DATA_DIR_ENV).unwrap_or_else(|_| "/data".to_string()));
        let host = env::var(HOST_ENV).unwrap_or_else(|_| "0.0.0.0".to_string());
        let port: u16 = env::var(PORT_ENV)
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .unwrap_or(8080);

        let ledger_urls = parse_url_list(
            &env::var(LEDGER_URLS_ENV).unwrap_or_else(|_| DEFAULT_LEDGER_URLS.to_string()),
        );

        let notify_relays = env::var(NOTIFY_RELAYS_ENV)
            .unwrap_or_else(|_| DEFAULT_NOTIFY_RELAYS.to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let prompt_webhook_url = env::var(PROMPT_WEBHOOK_URL_ENV)
            .ok()
            .and_then(|raw| match raw.parse() {
                Ok(url) => Some(url),
                Err(e) => {
                    tracing::warn!(error = %e, "Ignoring malformed {PROMPT_WEBHOOK_URL_ENV}");
                    None
                }
            });

        let json_logs = env::var(LOG_FORMAT_ENV)
            .map(|v| v.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        Self {
            data_dir,
            host,
            port,
            ledger_urls,
            notify_relays,
            prompt_webhook_url,
            json_logs,
        }
    }
}

fn parse_url_list(raw: &str) -> Vec<Url> {
    raw.split(',')
        .filter_map(|part| {
            let part = part.trim();
            if part.is_empty() {
                return None;
            }
            match part.parse::<Url>() {
                Ok(url) => Some(url),
                Err(e) => {
                    tracing::warn!(url = part, error = %e, "Skipping malformed ledger URL");
                    None
                }
            }
        })
        .collect()
}
