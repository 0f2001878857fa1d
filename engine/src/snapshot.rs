//! Persisted observed state.
//!
//! A [`StateSnapshot`] is what the agent writes to disk after every pass,
//! successful or not. Uses BTreeMap throughout so the serialized form is
//! deterministic.

use crate::{error::Result, keyed::KeyedState, policy::PolicyRules, Error};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Version of the snapshot format for future compatibility.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// Observed state of every managed collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    /// Snapshot format version
    pub format_version: u32,
    /// Keyed collections by name
    #[serde(default)]
    pub collections: BTreeMap<String, KeyedState>,
    /// Access policies by name
    #[serde(default)]
    pub policies: BTreeMap<String, PolicyRules>,
}

impl Default for StateSnapshot {
    fn default() -> Self {
        Self::new()
    }
}

impl StateSnapshot {
    /// Create a new empty snapshot.
    pub fn new() -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            collections: BTreeMap::new(),
            policies: BTreeMap::new(),
        }
    }

    /// Observed state of a keyed collection; empty if never reconciled.
    pub fn collection(&self, name: &str) -> KeyedState {
        self.collections.get(name).cloned().unwrap_or_default()
    }

    pub fn policy(&self, name: &str) -> PolicyRules {
        self.policies.get(name).cloned().unwrap_or_default()
    }

    pub fn set_collection(&mut self, name: impl Into<String>, state: KeyedState) {
        self.collections.insert(name.into(), state);
    }

    pub fn set_policy(&mut self, name: impl Into<String>, state: PolicyRules) {
        self.policies.insert(name.into(), state);
    }

    /// Count tracked remote entities across all collections and policies.
    pub fn record_count(&self) -> usize {
        let keyed: usize = self.collections.values().map(|c| c.len()).sum();
        let ordered: usize = self
            .policies
            .values()
            .map(|p| p.categories.len() + p.rules.len())
            .sum();
        keyed + ordered
    }

    /// Check internal consistency.
    ///
    /// Every tracked entity must carry a confirmed remote id, and every rule
    /// must belong to a tracked category.
    pub fn validate(&self) -> Result<()> {
        for (name, state) in &self.collections {
            if let Some((key, _)) = state.iter().find(|(_, r)| r.remote_id().is_none()) {
                return Err(Error::InvalidSnapshot(format!(
                    "collection '{name}' tracks '{key}' without a remote id"
                )));
            }
        }

        for (name, policy) in &self.policies {
            let categories: HashSet<&str> =
                policy.categories.iter().map(|c| c.name.as_str()).collect();

            if policy
                .categories
                .iter()
                .any(|c| c.record.remote_id().is_none())
                || policy.rules.iter().any(|r| r.record.remote_id().is_none())
            {
                return Err(Error::InvalidSnapshot(format!(
                    "policy '{name}' tracks an entry without a remote id"
                )));
            }
            if let Some(rule) = policy
                .rules
                .iter()
                .find(|r| !categories.contains(r.category.as_str()))
            {
                return Err(Error::InvalidSnapshot(format!(
                    "policy '{name}' has a rule in untracked category '{}'",
                    rule.category
                )));
            }
        }

        Ok(())
    }

    /// Serialize to JSON with deterministic ordering.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let snapshot: Self =
            serde_json::from_str(json).map_err(|e| Error::InvalidSnapshot(e.to_string()))?;
        snapshot.check_format_version()?;
        Ok(snapshot)
    }

    /// Reject snapshots written by a newer format.
    pub fn check_format_version(&self) -> Result<()> {
        if self.format_version > SNAPSHOT_FORMAT_VERSION {
            return Err(Error::InvalidSnapshot(format!(
                "unsupported snapshot format version: {} (max supported: {})",
                self.format_version, SNAPSHOT_FORMAT_VERSION
            )));
        }
        Ok(())
    }
}

/// Counts describing a snapshot, for logging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotSummary {
    pub format_version: u32,
    pub collections: usize,
    pub policies: usize,
    /// Tracked remote entities
    pub record_count: usize,
}

impl From<&StateSnapshot> for SnapshotSummary {
    fn from(snapshot: &StateSnapshot) -> Self {
        Self {
            format_version: snapshot.format_version,
            collections: snapshot.collections.len(),
            policies: snapshot.policies.len(),
            record_count: snapshot.record_count(),
        }
    }
}
