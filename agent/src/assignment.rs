//! Policy assignment lists.
//!
//! Several policies may share one assignment list on the server, and the API
//! only offers whole-list reads and writes. Every read-modify-write of a list
//! runs under a lock keyed by the list's path, so concurrent passes never
//! overwrite each other's changes while unrelated lists proceed in parallel.

use crate::retry::FixedBackoff;
use converge_engine::{error::Result, Error, Transport};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// One membership a pass keeps in place.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentSpec {
    /// Endpoint holding the assignment list
    pub path: String,
    /// Identifier added to the list
    pub member: String,
    /// Field of the list body holding the members
    #[serde(default = "default_field")]
    pub field: String,
}

fn default_field() -> String {
    "assignments".to_string()
}

impl AssignmentSpec {
    pub fn new(path: impl Into<String>, member: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            member: member.into(),
            field: default_field(),
        }
    }
}

/// Locks serializing assignment updates, one per list path.
///
/// Thread-safe and can be shared across passes via `Arc`.
#[derive(Debug, Default)]
pub struct AssignmentLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl AssignmentLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// The lock guarding `path`, created on first use.
    pub fn lock_for(&self, path: &str) -> Arc<Mutex<()>> {
        self.locks.entry(path.to_string()).or_default().clone()
    }
}

/// Add the member to its list. Returns whether the list changed.
pub async fn assign<T: Transport + ?Sized>(
    transport: &T,
    locks: &AssignmentLocks,
    backoff: &FixedBackoff,
    spec: &AssignmentSpec,
) -> Result<bool> {
    let changed = update_members(transport, locks, backoff, spec, |members| {
        let member = Value::String(spec.member.clone());
        if members.contains(&member) {
            return false;
        }
        members.push(member);
        true
    })
    .await?;

    if changed {
        info!(path = %spec.path, member = %spec.member, "Assigned policy");
    }
    Ok(changed)
}

/// Remove the member from its list. Returns whether the list changed.
pub async fn unassign<T: Transport + ?Sized>(
    transport: &T,
    locks: &AssignmentLocks,
    backoff: &FixedBackoff,
    spec: &AssignmentSpec,
) -> Result<bool> {
    let changed = update_members(transport, locks, backoff, spec, |members| {
        let before = members.len();
        members.retain(|m| m.as_str() != Some(spec.member.as_str()));
        members.len() != before
    })
    .await?;

    if changed {
        info!(path = %spec.path, member = %spec.member, "Unassigned policy");
    }
    Ok(changed)
}

async fn update_members<T, F>(
    transport: &T,
    locks: &AssignmentLocks,
    backoff: &FixedBackoff,
    spec: &AssignmentSpec,
    change: F,
) -> Result<bool>
where
    T: Transport + ?Sized,
    F: FnOnce(&mut Vec<Value>) -> bool,
{
    let lock = locks.lock_for(&spec.path);
    let _guard = lock.lock().await;

    let mut body = backoff.run(move || transport.get(&spec.path)).await?;
    let Some(obj) = body.as_object_mut() else {
        return Err(unexpected(spec, "assignment list is not an object"));
    };

    let members = obj
        .entry(spec.field.clone())
        .or_insert_with(|| Value::Array(Vec::new()));
    if members.is_null() {
        *members = Value::Array(Vec::new());
    }
    let Value::Array(members) = members else {
        return Err(unexpected(spec, "member field is not an array"));
    };

    if !change(members) {
        debug!(path = %spec.path, member = %spec.member, "Assignment already in place");
        return Ok(false);
    }

    backoff
        .run(move || transport.put(&spec.path, body.clone()))
        .await?;
    Ok(true)
}

fn unexpected(spec: &AssignmentSpec, reason: &str) -> Error {
    Error::UnexpectedResponse {
        path: spec.path.clone(),
        reason: format!("{reason} (field '{}')", spec.field),
    }
}
