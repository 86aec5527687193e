// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Nostr Custody Agent Developers

//! Nostr custody agent.
//!
//! Holds a user's Nostr secret key and performs operations with it on
//! behalf of untrusted callers: event signing, NIP-04/NIP-44 payload
//! encryption and on-chain Bitcoin Cash tips. Every sensitive operation
//! passes an authorization broker backed by persistent per-host policies
//! and a human confirmation surface; the key itself never leaves the
//! agent.

pub mod api;
pub mod broker;
pub mod chain;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod keystore;
pub mod models;
pub mod nostr_ops;
pub mod notify;
pub mod policy;
pub mod state;
pub mod storage;
