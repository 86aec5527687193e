// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Nostr Custody Agent Developers

//! Embedded settings database backed by redb (pure Rust, ACID).
//!
//! Holds everything the agent persists on behalf of its collaborators:
//!
//! - `private_key`: hex-encoded 32-byte scalar
//! - `policies`: serialized policy tree (host → accept/deny → type)
//! - `cached_fee_rate` / `cached_balance_<address>`: value + timestamp
//! - `protocol_handler`: `replaceURL` template

use std::path::Path;

use redb::{Database, ReadableDatabase, TableDefinition};
use serde::{de::DeserializeOwned, Serialize};

use crate::error::AgentError;

/// Single key/value table: setting name → JSON bytes.
const SETTINGS: TableDefinition<&str, &[u8]> = TableDefinition::new("settings");

pub const PRIVATE_KEY: &str = "private_key";
pub const POLICIES: &str = "policies";
pub const CACHED_FEE_RATE: &str = "cached_fee_rate";
pub const PROTOCOL_HANDLER: &str = "protocol_handler";

/// Key for the cached balance of one address.
pub fn balance_key(address: &str) -> String {
    format!("cached_balance_{}", address.to_lowercase())
}

#[derive(Debug, thiserror::Error)]
pub enum SettingsDbError {
    #[error("redb database error: {0}")]
    RedbDatabase(#[from] redb::DatabaseError),

    #[error("redb transaction error: {0}")]
    RedbTransaction(#[from] redb::TransactionError),

    #[error("redb table error: {0}")]
    RedbTable(#[from] redb::TableError),

    #[error("redb storage error: {0}")]
    RedbStorage(#[from] redb::StorageError),

    #[error("redb commit error: {0}")]
    RedbCommit(#[from] redb::CommitError),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type SettingsDbResult<T> = Result<T, SettingsDbError>;

impl From<SettingsDbError> for AgentError {
    fn from(e: SettingsDbError) -> Self {
        AgentError::Storage(e.to_string())
    }
}

/// Embedded ACID settings store.
pub struct SettingsDb {
    db: Database,
}

impl SettingsDb {
    /// Open (or create) the database at the given path, ensuring the
    /// settings table exists so later reads never hit a missing table.
    pub fn open(path: &Path) -> SettingsDbResult<Self> {
        let db = Database::create(path)?;
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(SETTINGS)?;
        }
        write_txn.commit()?;
        Ok(Self { db })
    }

    /// Read a JSON-encoded value.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> SettingsDbResult<Option<T>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SETTINGS)?;
        match table.get(key)? {
            Some(raw) => Ok(Some(serde_json::from_slice(raw.value())?)),
            None => Ok(None),
        }
    }

    /// Write a JSON-encoded value.
    pub fn put<T: Serialize>(&self, key: &str, value: &T) -> SettingsDbResult<()> {
        let bytes = serde_json::to_vec(value)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(SETTINGS)?;
            table.insert(key, bytes.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn remove(&self, key: &str) -> SettingsDbResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(SETTINGS)?;
            table.remove(key)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// The stored hex secret key, if any. Callers re-read per operation;
    /// the key is never held in memory between operations.
    pub fn private_key(&self) -> SettingsDbResult<Option<String>> {
        self.get::<String>(PRIVATE_KEY)
    }

    pub fn set_private_key(&self, hex_key: &str) -> SettingsDbResult<()> {
        self.put(PRIVATE_KEY, &hex_key.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    fn temp_db() -> (tempfile::TempDir, SettingsDb) {
        let dir = tempfile::tempdir().unwrap();
        let db = SettingsDb::open(&dir.path().join("settings.redb")).unwrap();
        (dir, db)
    }

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Cached {
        value: u64,
        timestamp: i64,
    }

    #[test]
    fn round_trips_json_values() {
        let (_dir, db) = temp_db();
        let cached = Cached {
            value: 42,
            timestamp: 1_700_000_000,
        };
        db.put(CACHED_FEE_RATE, &cached).unwrap();
        assert_eq!(db.get::<Cached>(CACHED_FEE_RATE).unwrap(), Some(cached));
    }

    #[test]
    fn missing_key_is_none() {
        let (_dir, db) = temp_db();
        assert_eq!(db.get::<String>("nothing").unwrap(), None);
    }

    #[test]
    fn remove_deletes_value() {
        let (_dir, db) = temp_db();
        db.set_private_key("ab".repeat(32).as_str()).unwrap();
        assert!(db.private_key().unwrap().is_some());
        db.remove(PRIVATE_KEY).unwrap();
        assert!(db.private_key().unwrap().is_none());
    }

    #[test]
    fn balance_key_is_lowercased() {
        assert_eq!(
            balance_key("BitcoinCash:QQQ"),
            "cached_balance_bitcoincash:qqq"
        );
    }
}
