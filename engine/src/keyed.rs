//! Reconciliation of name-keyed collections.
//!
//! # Algorithm
//!
//! 1. Index observed records by confirmed remote id
//! 2. Delete observed records whose id no desired record claims
//! 3. Create desired records without a usable id
//! 4. Update desired records whose content differs from the record they claim
//! 5. Apply deletes, then creates, then updates
//!
//! Deletes go first so a name can be freed and recreated in the same pass.
//! Bulk or sequential execution is chosen per operation kind by the server's
//! capability version. Every confirmed effect lands in a [`KeyedTracker`]
//! immediately.

use crate::{
    batch::{partition_filter, partition_payloads, Limits},
    capability::{BulkSupport, Strategy, Version},
    error::Result,
    record::id_from_body,
    shape::Shape,
    tracker::{KeyedTracker, PassOutcome, PassReport},
    transport::{response_items, tolerate_missing, Endpoint, Transport},
    Error, Record,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, info, warn};

/// Records of a keyed collection by local name.
pub type KeyedState = BTreeMap<String, Record>;

/// A keyed collection on the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyedTarget {
    pub endpoint: Endpoint,
    #[serde(default)]
    pub shape: Shape,
    #[serde(default)]
    pub bulk: BulkSupport,
}

impl KeyedTarget {
    pub fn new(endpoint: Endpoint, shape: Shape, bulk: BulkSupport) -> Self {
        Self {
            endpoint,
            shape,
            bulk,
        }
    }

    /// Request body: the record's known fields plus its name.
    fn body(&self, key: &str, record: &Record) -> Value {
        let mut body = record.to_body();
        body.insert(
            self.endpoint.name_field.clone(),
            Value::String(key.to_string()),
        );
        Value::Object(body)
    }
}

/// A desired record paired with the observed record it claims.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyedUpdate<'a> {
    pub key: &'a str,
    pub desired: &'a Record,
    pub observed_key: &'a str,
    pub observed: &'a Record,
}

/// Operations needed to move a keyed collection to its desired state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeyedPlan<'a> {
    pub to_delete: Vec<(&'a str, &'a Record)>,
    pub to_create: Vec<(&'a str, &'a Record)>,
    pub to_update: Vec<KeyedUpdate<'a>>,
}

impl KeyedPlan<'_> {
    pub fn is_empty(&self) -> bool {
        self.to_delete.is_empty() && self.to_create.is_empty() && self.to_update.is_empty()
    }
}

/// Copy remote ids from prior state into desired records with the same key.
pub fn prime_keyed_ids(desired: &mut KeyedState, observed: &KeyedState) {
    for (key, record) in desired.iter_mut() {
        if !record.remote_id.is_unset() {
            continue;
        }
        if let Some(prior) = observed.get(key).filter(|p| p.remote_id().is_some()) {
            record.remote_id = prior.remote_id.clone();
        }
    }
}

/// Compute the plan for a keyed collection.
///
/// A desired record claims the observed record carrying the same remote id.
/// Desired records with no id, or with an id the observed state does not
/// know, are created. Observed records nobody claims are deleted.
pub fn plan_keyed<'a>(
    shape: &Shape,
    desired: &'a KeyedState,
    observed: &'a KeyedState,
) -> KeyedPlan<'a> {
    let by_id: HashMap<&str, &str> = observed
        .iter()
        .filter_map(|(key, record)| record.remote_id().map(|id| (id, key.as_str())))
        .collect();

    let mut plan = KeyedPlan::default();
    let mut claimed: HashSet<&str> = HashSet::new();

    for (key, record) in desired {
        let claim = record
            .remote_id()
            .and_then(|id| by_id.get(id).map(|observed_key| (id, *observed_key)));

        match claim {
            Some((id, observed_key)) if claimed.insert(id) => {
                let prior = &observed[observed_key];
                if observed_key != key || !shape.content_eq(record, prior) {
                    plan.to_update.push(KeyedUpdate {
                        key,
                        desired: record,
                        observed_key,
                        observed: prior,
                    });
                }
            }
            _ => plan.to_create.push((key, record)),
        }
    }

    for (key, record) in observed {
        if let Some(id) = record.remote_id() {
            if !claimed.contains(id) {
                plan.to_delete.push((key, record));
            }
        }
    }

    plan
}

/// Applies keyed plans against a transport.
pub struct KeyedReconciler<'a, T: ?Sized> {
    transport: &'a T,
    target: &'a KeyedTarget,
    server_version: &'a Version,
    limits: Limits,
}

impl<'a, T: Transport + ?Sized> KeyedReconciler<'a, T> {
    pub fn new(
        transport: &'a T,
        target: &'a KeyedTarget,
        server_version: &'a Version,
        limits: Limits,
    ) -> Self {
        Self {
            transport,
            target,
            server_version,
            limits,
        }
    }

    /// Run one pass. Desired records without an id pick up the id of the
    /// observed record under the same key. The returned state is valid
    /// whether or not the pass completed.
    pub async fn reconcile(
        &self,
        desired: &KeyedState,
        observed: KeyedState,
    ) -> PassOutcome<KeyedState> {
        let mut tracker = KeyedTracker::new(observed);
        let current = tracker.snapshot();
        let mut primed = desired.clone();
        prime_keyed_ids(&mut primed, &current);
        let plan = plan_keyed(&self.target.shape, &primed, &current);
        let mut report = PassReport::default();

        debug!(
            path = %self.target.endpoint.path,
            deletes = plan.to_delete.len(),
            creates = plan.to_create.len(),
            updates = plan.to_update.len(),
            "Planned keyed collection"
        );

        let result = self.apply(&plan, &mut tracker, &mut report).await;

        match &result {
            Ok(()) if report.is_noop() => {
                debug!(path = %self.target.endpoint.path, "Keyed collection up to date")
            }
            Ok(()) => info!(
                path = %self.target.endpoint.path,
                created = report.created,
                updated = report.updated,
                deleted = report.deleted,
                "Reconciled keyed collection"
            ),
            Err(err) => warn!(
                path = %self.target.endpoint.path,
                error = %err,
                created = report.created,
                deleted = report.deleted,
                "Keyed reconciliation aborted"
            ),
        }

        PassOutcome::new(tracker.into_snapshot(), report, result.err())
    }

    async fn apply(
        &self,
        plan: &KeyedPlan<'_>,
        tracker: &mut KeyedTracker,
        report: &mut PassReport,
    ) -> Result<()> {
        self.delete_all(&plan.to_delete, tracker, report).await?;
        self.create_all(&plan.to_create, tracker, report).await?;
        self.update_all(&plan.to_update, tracker, report).await
    }

    async fn delete_all(
        &self,
        deletes: &[(&str, &Record)],
        tracker: &mut KeyedTracker,
        report: &mut PassReport,
    ) -> Result<()> {
        if deletes.is_empty() {
            return Ok(());
        }
        let endpoint = &self.target.endpoint;

        match self.target.bulk.delete_strategy(self.server_version) {
            Strategy::Bulk => {
                let ids: Vec<&str> = deletes
                    .iter()
                    .map(|(_, record)| record.remote_id().unwrap_or_default())
                    .collect();

                for batch in partition_filter(&ids, self.limits.max_filter_length) {
                    let query = vec![
                        ("bulk".to_string(), "true".to_string()),
                        (
                            "filter".to_string(),
                            format!("{}=in=({})", endpoint.id_field, batch.filter),
                        ),
                    ];
                    report.requests += 1;
                    tolerate_missing(self.transport.delete(&endpoint.path, &query).await)?;

                    for (key, _) in &deletes[batch.range.clone()] {
                        tracker.record_deleted(key);
                        report.deleted += 1;
                    }
                    debug!(path = %endpoint.path, count = batch.range.len(), "Bulk deleted batch");
                }
            }
            Strategy::Sequential => {
                for (key, record) in deletes {
                    if let Some(id) = record.remote_id() {
                        report.requests += 1;
                        tolerate_missing(self.transport.delete(&endpoint.item(id), &[]).await)?;
                    }
                    tracker.record_deleted(key);
                    report.deleted += 1;
                }
            }
        }

        Ok(())
    }

    async fn create_all(
        &self,
        creates: &[(&str, &Record)],
        tracker: &mut KeyedTracker,
        report: &mut PassReport,
    ) -> Result<()> {
        if creates.is_empty() {
            return Ok(());
        }
        let endpoint = &self.target.endpoint;

        match self.target.bulk.create_strategy(self.server_version) {
            Strategy::Bulk => {
                let bodies: Vec<Value> = creates
                    .iter()
                    .map(|(key, record)| self.target.body(key, record))
                    .collect();
                let query = vec![("bulk".to_string(), "true".to_string())];

                for batch in partition_payloads(&bodies, self.limits.max_payload_bytes) {
                    let body = Value::Array(bodies[batch.range.clone()].to_vec());
                    report.requests += 1;
                    let response = self.transport.post(&endpoint.path, &query, body).await?;

                    self.commit_bulk_created(
                        &creates[batch.range.clone()],
                        response,
                        tracker,
                        report,
                    )?;
                    debug!(
                        path = %endpoint.path,
                        count = batch.range.len(),
                        bytes = batch.bytes,
                        "Bulk created batch"
                    );
                }
            }
            Strategy::Sequential => {
                for (key, record) in creates {
                    report.requests += 1;
                    let response = self
                        .transport
                        .post(&endpoint.path, &[], self.target.body(key, record))
                        .await?;

                    let id = id_from_body(&response, &endpoint.id_field).ok_or_else(|| {
                        Error::UnexpectedResponse {
                            path: endpoint.path.clone(),
                            reason: format!("created item '{key}' has no identifier"),
                        }
                    })?;

                    let mut created = (*record).clone();
                    created.absorb_computed(&self.target.shape, &response);
                    tracker.record_created(key, created, id);
                    report.created += 1;
                }
            }
        }

        Ok(())
    }

    /// Match a bulk response back to the batch by name.
    ///
    /// Every matchable item is committed before any anomaly is reported, so
    /// nothing the server created is lost from the returned state.
    fn commit_bulk_created(
        &self,
        members: &[(&str, &Record)],
        response: Value,
        tracker: &mut KeyedTracker,
        report: &mut PassReport,
    ) -> Result<()> {
        let endpoint = &self.target.endpoint;
        let mut pending: BTreeMap<&str, &Record> = members.iter().copied().collect();
        let mut problems = Vec::new();

        for item in response_items(response) {
            if endpoint.is_placeholder(&item) {
                debug!(path = %endpoint.path, "Skipping placeholder in bulk response");
                report.placeholders_skipped += 1;
                continue;
            }

            let name = item
                .get(&endpoint.name_field)
                .and_then(Value::as_str)
                .unwrap_or_default();
            let Some(record) = pending.remove(name) else {
                problems.push(format!("item '{name}' was not part of the request"));
                continue;
            };
            let Some(id) = id_from_body(&item, &endpoint.id_field) else {
                problems.push(format!("created item '{name}' has no identifier"));
                continue;
            };

            let mut created = record.clone();
            created.absorb_computed(&self.target.shape, &item);
            tracker.record_created(name, created, id);
            report.created += 1;
        }

        if !pending.is_empty() {
            let missing: Vec<&str> = pending.keys().copied().collect();
            problems.push(format!("no result for {}", missing.join(", ")));
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(Error::UnexpectedResponse {
                path: endpoint.path.clone(),
                reason: problems.join("; "),
            })
        }
    }

    async fn update_all(
        &self,
        updates: &[KeyedUpdate<'_>],
        tracker: &mut KeyedTracker,
        report: &mut PassReport,
    ) -> Result<()> {
        let endpoint = &self.target.endpoint;

        for update in updates {
            let Some(id) = update.observed.remote_id() else {
                continue;
            };

            debug!(
                path = %endpoint.path,
                key = update.key,
                fields = ?self.target.shape.changed_fields(update.desired, update.observed),
                "Updating item"
            );

            let mut body = self.target.body(update.key, update.desired);
            if let Value::Object(obj) = &mut body {
                obj.insert(endpoint.id_field.clone(), Value::String(id.to_string()));
            }

            report.requests += 1;
            let response = self.transport.put(&endpoint.item(id), body).await?;

            let mut updated = update.desired.clone().confirmed(id);
            updated.absorb_computed(&self.target.shape, &response);
            if update.observed_key == update.key {
                tracker.record_updated(update.key, updated);
            } else {
                tracker.record_renamed(update.observed_key, update.key, updated);
            }
            report.updated += 1;
        }

        Ok(())
    }
}

/// Re-read every observed item and fold the remote truth back in.
///
/// A 404 drops the item. Otherwise the tracked fields, plus any computed
/// fields of the shape, take the remote values; fields the state never
/// tracked are left out so undeclared server attributes do not show up as
/// drift.
pub async fn refresh_keyed<T: Transport + ?Sized>(
    transport: &T,
    target: &KeyedTarget,
    observed: KeyedState,
) -> PassOutcome<KeyedState> {
    let mut tracker = KeyedTracker::new(observed);
    let mut report = PassReport::default();
    let endpoint = &target.endpoint;
    let mut error = None;

    for (key, record) in tracker.snapshot() {
        let Some(id) = record.remote_id() else {
            continue;
        };

        report.requests += 1;
        match transport.get(&endpoint.item(id)).await {
            Ok(body) => {
                let reserved = [endpoint.id_field.as_str(), endpoint.name_field.as_str()];
                let remote = Record::from_body(&body, &reserved);
                let mut fresh = record.clone();
                let tracked: Vec<String> = record
                    .fields
                    .keys()
                    .cloned()
                    .chain(target.shape.computed_fields().map(|d| d.name.clone()))
                    .collect();
                for name in tracked {
                    fresh.set_field(name.clone(), remote.field(&name).clone());
                }
                if fresh != record {
                    debug!(path = %endpoint.path, key = %key, "Observed drift");
                }
                tracker.record_updated(&key, fresh);
            }
            Err(err) if err.is_not_found() => {
                debug!(path = %endpoint.path, key = %key, "Item no longer exists");
                tracker.record_deleted(&key);
            }
            Err(err) => {
                error = Some(err.into());
                break;
            }
        }
    }

    PassOutcome::new(tracker.into_snapshot(), report, error)
}
