//! Running observed state for a reconciliation pass.
//!
//! Every confirmed remote effect is committed here the moment its response
//! arrives, never buffered until the end of the pass. If the pass aborts, the
//! snapshot still reflects exactly what exists remotely, so a later pass does
//! not trust stale identifiers.

use crate::{
    keyed::KeyedState,
    ordered::Phase,
    policy::{Category, PolicyRules, Rule},
    Error, Record, RemoteId,
};
use serde::{Deserialize, Serialize};

/// Counters for one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PassReport {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    /// Placeholder items dropped from bulk-create responses
    pub placeholders_skipped: usize,
    /// Requests issued against the remote API
    pub requests: usize,
    /// Final phase of an ordered pass
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,
    /// Step an ordered pass was in when it aborted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<Phase>,
}

impl PassReport {
    /// Whether the pass changed anything remotely.
    pub fn is_noop(&self) -> bool {
        self.created == 0 && self.updated == 0 && self.deleted == 0
    }

    pub fn absorb(&mut self, other: &PassReport) {
        self.created += other.created;
        self.updated += other.updated;
        self.deleted += other.deleted;
        self.placeholders_skipped += other.placeholders_skipped;
        self.requests += other.requests;
    }
}

/// Result of a pass: the observed state is always present, error or not.
#[derive(Debug, Clone, PartialEq)]
pub struct PassOutcome<S> {
    /// State to persist, unconditionally
    pub observed: S,
    pub report: PassReport,
    /// The error that stopped the pass, if any
    pub error: Option<Error>,
}

impl<S> PassOutcome<S> {
    pub fn new(observed: S, report: PassReport, error: Option<Error>) -> Self {
        Self {
            observed,
            report,
            error,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// Split into the state to persist and the pass result.
    pub fn into_parts(self) -> (S, Result<PassReport, Error>) {
        let result = match self.error {
            Some(err) => Err(err),
            None => Ok(self.report),
        };
        (self.observed, result)
    }
}

/// Tracks a name-keyed collection.
#[derive(Debug, Clone, Default)]
pub struct KeyedTracker {
    records: KeyedState,
}

impl KeyedTracker {
    /// Start from prior observed state.
    ///
    /// Records without a confirmed remote id do not exist remotely and are
    /// dropped.
    pub fn new(mut observed: KeyedState) -> Self {
        observed.retain(|_, record| record.remote_id().is_some());
        Self { records: observed }
    }

    pub fn record_created(&mut self, key: &str, record: Record, remote_id: impl Into<RemoteId>) {
        self.records
            .insert(key.to_string(), record.confirmed(remote_id));
    }

    /// Replace a record after a successful update.
    pub fn record_updated(&mut self, key: &str, record: Record) {
        self.records.insert(key.to_string(), record);
    }

    /// Move a record to a new key after an update that renamed it.
    ///
    /// `from` is only cleared while it still holds this record. A different
    /// record already sitting under `to` moves to the freed `from` key, so
    /// swapping two names keeps both records tracked.
    pub fn record_renamed(&mut self, from: &str, to: &str, record: Record) {
        let id = record.remote_id().map(String::from);
        if self
            .records
            .get(from)
            .is_some_and(|r| r.remote_id() == id.as_deref())
        {
            self.records.remove(from);
        }

        let displaced = self.records.insert(to.to_string(), record);
        if let Some(displaced) = displaced {
            if displaced.remote_id() != id.as_deref() && !self.records.contains_key(from) {
                self.records.insert(from.to_string(), displaced);
            }
        }
    }

    pub fn record_deleted(&mut self, key: &str) {
        self.records.remove(key);
    }

    pub fn get(&self, key: &str) -> Option<&Record> {
        self.records.get(key)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn snapshot(&self) -> KeyedState {
        self.records.clone()
    }

    pub fn into_snapshot(self) -> KeyedState {
        self.records
    }
}

/// Tracks an access policy's categories and rules.
#[derive(Debug, Clone, Default)]
pub struct OrderedTracker {
    state: PolicyRules,
}

impl OrderedTracker {
    /// Start from prior observed state, dropping unconfirmed entries.
    pub fn new(mut observed: PolicyRules) -> Self {
        observed
            .categories
            .retain(|c| c.record.remote_id().is_some());
        observed.rules.retain(|r| r.record.remote_id().is_some());
        Self { state: observed }
    }

    pub fn state(&self) -> &PolicyRules {
        &self.state
    }

    pub fn record_category_created(&mut self, category: Category, remote_id: impl Into<RemoteId>) {
        let category = Category {
            record: category.record.confirmed(remote_id),
            ..category
        };
        match self
            .state
            .categories
            .iter_mut()
            .find(|c| c.name == category.name)
        {
            Some(existing) => *existing = category,
            None => self.state.categories.push(category),
        }
    }

    pub fn record_category_deleted(&mut self, name: &str) {
        self.state.categories.retain(|c| c.name != name);
    }

    pub fn record_rule_created(&mut self, rule: Rule, remote_id: impl Into<RemoteId>) {
        let rule = Rule {
            record: rule.record.confirmed(remote_id),
            ..rule
        };
        let id = rule.record.remote_id().map(String::from);
        match self
            .state
            .rules
            .iter_mut()
            .find(|r| r.record.remote_id().map(String::from) == id)
        {
            Some(existing) => *existing = rule,
            None => self.state.rules.push(rule),
        }
    }

    pub fn record_rule_deleted(&mut self, remote_id: &str) {
        self.state
            .rules
            .retain(|r| r.record.remote_id() != Some(remote_id));
    }

    /// Remote id of a tracked category.
    pub fn category_id(&self, name: &str) -> Option<&str> {
        self.state
            .categories
            .iter()
            .find(|c| c.name == name)
            .and_then(|c| c.record.remote_id())
    }

    pub fn snapshot(&self) -> PolicyRules {
        self.state.clone()
    }

    pub fn into_snapshot(self) -> PolicyRules {
        self.state
    }
}
