// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Nostr Custody Agent Developers

//! Persistent authorization policy.
//!
//! Policies are keyed by caller host, then accept/deny bucket, then
//! operation type. An entry may carry a [`Condition`] narrowing it to
//! certain event kinds or an amount ceiling; an entry without a condition
//! is unconditional. A request whose context does not satisfy a matching
//! entry's condition falls through as if the entry were absent, so the
//! confirmation surface is consulted instead.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::AgentError;
use crate::storage::{SettingsDb, POLICIES};

/// Narrowing applied to a stored grant or denial.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Condition {
    /// Event kinds the entry applies to; `None` applies to all kinds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kinds: Option<BTreeSet<u16>>,
    /// Maximum amount in satoshi; `None` means no ceiling.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_amount: Option<u64>,
}

impl Condition {
    /// Whether a request with this kind/amount context satisfies the
    /// condition. A constrained field with no corresponding context value
    /// never matches.
    pub fn matches(&self, kind: Option<u16>, amount: Option<u64>) -> bool {
        if let Some(kinds) = &self.kinds {
            match kind {
                Some(k) if kinds.contains(&k) => {}
                _ => return false,
            }
        }
        if let Some(max) = self.max_amount {
            match amount {
                Some(a) if a <= max => {}
                _ => return false,
            }
        }
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyEntry {
    /// `None` is unconditional.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
    pub created_at: i64,
}

/// Accept and deny buckets for one host, keyed by operation type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct HostPolicies {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub allow: BTreeMap<String, PolicyEntry>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub deny: BTreeMap<String, PolicyEntry>,
}

impl HostPolicies {
    fn is_empty(&self) -> bool {
        self.allow.is_empty() && self.deny.is_empty()
    }

    fn bucket_mut(&mut self, accept: bool) -> &mut BTreeMap<String, PolicyEntry> {
        if accept {
            &mut self.allow
        } else {
            &mut self.deny
        }
    }
}

pub type Policies = BTreeMap<String, HostPolicies>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyDecision {
    Allow,
    Deny,
    /// No matching entry; the confirmation surface decides.
    Unknown,
}

/// Store over the settings database; the full tree is small and is read
/// and rewritten whole per mutation.
pub struct PolicyStore {
    db: Arc<SettingsDb>,
}

impl PolicyStore {
    pub fn new(db: Arc<SettingsDb>) -> Self {
        Self { db }
    }

    pub fn all(&self) -> Result<Policies, AgentError> {
        Ok(self.db.get::<Policies>(POLICIES)?.unwrap_or_default())
    }

    fn save(&self, policies: &Policies) -> Result<(), AgentError> {
        Ok(self.db.put(POLICIES, policies)?)
    }

    /// Decide a request. The allow bucket is consulted before the deny
    /// bucket; within a bucket, a conditional entry whose condition does
    /// not match the request context is skipped.
    pub fn decision(
        &self,
        host: &str,
        operation_type: &str,
        kind: Option<u16>,
        amount: Option<u64>,
    ) -> Result<PolicyDecision, AgentError> {
        let policies = self.all()?;
        let Some(host_policies) = policies.get(host) else {
            return Ok(PolicyDecision::Unknown);
        };

        let applies = |entry: &PolicyEntry| {
            entry
                .condition
                .as_ref()
                .map(|c| c.matches(kind, amount))
                .unwrap_or(true)
        };

        if host_policies
            .allow
            .get(operation_type)
            .is_some_and(applies)
        {
            return Ok(PolicyDecision::Allow);
        }
        if host_policies.deny.get(operation_type).is_some_and(applies) {
            return Ok(PolicyDecision::Deny);
        }
        Ok(PolicyDecision::Unknown)
    }

    /// Record a reply for future requests.
    ///
    /// An existing entry in the same bucket is widened by merging; if the
    /// opposite bucket holds an entry with the exact same condition it is
    /// removed, since the new reply supersedes it.
    pub fn update(
        &self,
        host: &str,
        accept: bool,
        operation_type: &str,
        condition: Option<Condition>,
    ) -> Result<(), AgentError> {
        let mut policies = self.all()?;
        let host_policies = policies.entry(host.to_string()).or_default();

        let merged = match host_policies.bucket_mut(accept).remove(operation_type) {
            Some(existing) => merge_conditions(existing.condition, condition),
            None => condition,
        };
        host_policies.bucket_mut(accept).insert(
            operation_type.to_string(),
            PolicyEntry {
                condition: merged.clone(),
                created_at: Utc::now().timestamp(),
            },
        );

        let opposite = host_policies.bucket_mut(!accept);
        if opposite
            .get(operation_type)
            .is_some_and(|entry| entry.condition == merged)
        {
            opposite.remove(operation_type);
        }

        self.save(&policies)
    }

    pub fn remove(&self, host: &str, accept: bool, operation_type: &str) -> Result<(), AgentError> {
        let mut policies = self.all()?;
        if let Some(host_policies) = policies.get_mut(host) {
            host_policies.bucket_mut(accept).remove(operation_type);
            if host_policies.is_empty() {
                policies.remove(host);
            }
        }
        self.save(&policies)
    }
}

/// Widen two conditions into one.
///
/// An unconditional side wins outright. Otherwise kind sets union (an
/// unrestricted side stays unrestricted) and amount ceilings take the
/// tighter bound, so a later lower ceiling actually lowers the grant.
fn merge_conditions(old: Option<Condition>, new: Option<Condition>) -> Option<Condition> {
    match (old, new) {
        (Some(old), Some(new)) => Some(Condition {
            kinds: match (old.kinds, new.kinds) {
                (Some(a), Some(b)) => Some(a.union(&b).copied().collect()),
                _ => None,
            },
            max_amount: match (old.max_amount, new.max_amount) {
                (Some(a), Some(b)) => Some(a.min(b)),
                _ => None,
            },
        }),
        _ => None,
    }
}
