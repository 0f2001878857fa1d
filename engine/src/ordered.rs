//! Reconciliation of an access policy's ordered categories and rules.
//!
//! The server can only append to the end of a `(category, section)` group
//! and delete. So the pass keeps the longest prefix that already matches,
//! deletes everything after it from the back, and appends the rest:
//!
//! ```text
//! Start -> ComputeKeptPrefix -> TruncateRules -> TruncateCategories
//!       -> CreateCategories -> CreateRules -> Done
//! ```
//!
//! Any step may end in `Aborted`. The state returned then still holds every
//! deletion and creation the server confirmed, so rerunning the pass picks
//! up where it stopped.

use crate::{
    batch::{partition_payloads, Limits},
    capability::{BulkSupport, Strategy, Version},
    error::Result,
    policy::{Category, PolicyRules, Rule},
    record::id_from_body,
    shape::Shape,
    tracker::{OrderedTracker, PassOutcome, PassReport},
    transport::{response_items, tolerate_missing, Endpoint, Transport},
    Error,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use tracing::{debug, info, warn};

/// Steps of an ordered pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Phase {
    Start,
    ComputeKeptPrefix,
    TruncateRules,
    TruncateCategories,
    CreateCategories,
    CreateRules,
    Done,
    Aborted,
}

/// Whether a pass may keep a matching prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum KeptPrefixMode {
    /// Keep the longest matching prefix
    #[default]
    Preserve,
    /// Always truncate everything and recreate
    Replace,
}

/// Lengths of the kept prefixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeptPrefix {
    pub categories: usize,
    pub rules: usize,
}

/// An access policy's two collections on the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyTarget {
    pub categories: Endpoint,
    pub rules: Endpoint,
    #[serde(default)]
    pub category_shape: Shape,
    #[serde(default)]
    pub rule_shape: Shape,
    /// Minimum versions for bulk rule creation
    #[serde(default)]
    pub rule_bulk: BulkSupport,
    #[serde(default)]
    pub kept_prefix: KeptPrefixMode,
}

impl PolicyTarget {
    pub fn new(categories: Endpoint, rules: Endpoint) -> Self {
        Self {
            categories,
            rules,
            category_shape: Shape::default(),
            rule_shape: Shape::default(),
            rule_bulk: BulkSupport::none(),
            kept_prefix: KeptPrefixMode::default(),
        }
    }

    /// Kept prefix under this target's shapes and mode.
    pub fn kept_prefix(&self, desired: &PolicyRules, observed: &PolicyRules) -> KeptPrefix {
        match self.kept_prefix {
            KeptPrefixMode::Preserve => {
                kept_prefix(&self.category_shape, &self.rule_shape, desired, observed)
            }
            KeptPrefixMode::Replace => KeptPrefix::default(),
        }
    }
}

/// Compute the longest prefix of both lists that needs no remote change.
///
/// A category is kept while its name, identity and content match. A rule is
/// kept while its remote id, group and content match and its category lies
/// inside the kept category prefix. Both scans stop at the first mismatch.
pub fn kept_prefix(
    category_shape: &Shape,
    rule_shape: &Shape,
    desired: &PolicyRules,
    observed: &PolicyRules,
) -> KeptPrefix {
    let categories = desired
        .categories
        .iter()
        .zip(&observed.categories)
        .take_while(|(want, have)| same_category(category_shape, want, have))
        .count();

    let kept: HashSet<&str> = desired.categories[..categories]
        .iter()
        .map(|c| c.name.as_str())
        .collect();

    let rules = desired
        .rules
        .iter()
        .zip(&observed.rules)
        .take_while(|(want, have)| {
            kept.contains(want.category.as_str()) && same_rule(rule_shape, want, have)
        })
        .count();

    KeptPrefix { categories, rules }
}

fn same_category(shape: &Shape, want: &Category, have: &Category) -> bool {
    let Some(id) = have.record.remote_id() else {
        return false;
    };
    let compatible = want.record.remote_id().map_or(true, |wanted| wanted == id);
    want.name == have.name && compatible && shape.content_eq(&want.record, &have.record)
}

fn same_rule(shape: &Shape, want: &Rule, have: &Rule) -> bool {
    match (want.record.remote_id(), have.record.remote_id()) {
        (Some(a), Some(b)) if a == b => {
            want.group_key() == have.group_key() && shape.content_eq(&want.record, &have.record)
        }
        _ => false,
    }
}

/// Applies ordered policy passes against a transport.
pub struct OrderedReconciler<'a, T: ?Sized> {
    transport: &'a T,
    target: &'a PolicyTarget,
    server_version: &'a Version,
    limits: Limits,
}

impl<'a, T: Transport + ?Sized> OrderedReconciler<'a, T> {
    pub fn new(
        transport: &'a T,
        target: &'a PolicyTarget,
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

    /// Run one pass.
    ///
    /// The desired declaration is validated before any request is sent. The
    /// report names the last phase reached and, on failure, the step that
    /// failed.
    pub async fn reconcile(
        &self,
        desired: &PolicyRules,
        observed: PolicyRules,
    ) -> PassOutcome<PolicyRules> {
        let mut tracker = OrderedTracker::new(observed);
        let mut report = PassReport::default();
        let mut phase = Phase::Start;

        let result = self
            .run(desired, &mut tracker, &mut report, &mut phase)
            .await;

        match &result {
            Ok(()) => {
                report.phase = Some(Phase::Done);
                if report.is_noop() {
                    debug!(path = %self.target.rules.path, "Policy up to date");
                } else {
                    info!(
                        path = %self.target.rules.path,
                        created = report.created,
                        deleted = report.deleted,
                        "Reconciled policy"
                    );
                }
            }
            Err(err) => {
                report.phase = Some(Phase::Aborted);
                report.failed_step = Some(phase);
                warn!(
                    path = %self.target.rules.path,
                    step = ?phase,
                    error = %err,
                    "Policy reconciliation aborted"
                );
            }
        }

        PassOutcome::new(tracker.into_snapshot(), report, result.err())
    }

    async fn run(
        &self,
        desired: &PolicyRules,
        tracker: &mut OrderedTracker,
        report: &mut PassReport,
        phase: &mut Phase,
    ) -> Result<()> {
        *phase = Phase::ComputeKeptPrefix;
        desired.validate()?;

        let mut primed = desired.clone();
        primed.adopt_ids_from(tracker.state());
        let kept = self.target.kept_prefix(&primed, tracker.state());
        debug!(
            path = %self.target.rules.path,
            kept_categories = kept.categories,
            kept_rules = kept.rules,
            observed_categories = tracker.state().categories.len(),
            observed_rules = tracker.state().rules.len(),
            "Computed kept prefix"
        );

        *phase = Phase::TruncateRules;
        self.truncate_rules(kept.rules, tracker, report).await?;

        *phase = Phase::TruncateCategories;
        self.truncate_categories(kept.categories, tracker, report)
            .await?;

        *phase = Phase::CreateCategories;
        self.create_categories(&desired.categories[kept.categories..], tracker, report)
            .await?;

        *phase = Phase::CreateRules;
        self.create_rules(&desired.rules, kept.rules, tracker, report)
            .await
    }

    async fn truncate_rules(
        &self,
        keep: usize,
        tracker: &mut OrderedTracker,
        report: &mut PassReport,
    ) -> Result<()> {
        let stale: Vec<String> = tracker.state().rules[keep..]
            .iter()
            .rev()
            .filter_map(|r| r.record.remote_id().map(String::from))
            .collect();

        for id in stale {
            report.requests += 1;
            tolerate_missing(
                self.transport
                    .delete(&self.target.rules.item(&id), &[])
                    .await,
            )?;
            tracker.record_rule_deleted(&id);
            report.deleted += 1;
        }
        Ok(())
    }

    async fn truncate_categories(
        &self,
        keep: usize,
        tracker: &mut OrderedTracker,
        report: &mut PassReport,
    ) -> Result<()> {
        let stale: Vec<(String, String)> = tracker.state().categories[keep..]
            .iter()
            .rev()
            .filter_map(|c| {
                c.record
                    .remote_id()
                    .map(|id| (c.name.clone(), id.to_string()))
            })
            .collect();

        for (name, id) in stale {
            report.requests += 1;
            tolerate_missing(
                self.transport
                    .delete(&self.target.categories.item(&id), &[])
                    .await,
            )?;
            tracker.record_category_deleted(&name);
            report.deleted += 1;
        }
        Ok(())
    }

    async fn create_categories(
        &self,
        categories: &[Category],
        tracker: &mut OrderedTracker,
        report: &mut PassReport,
    ) -> Result<()> {
        let endpoint = &self.target.categories;

        for category in categories {
            let mut body = category.record.to_body();
            body.insert(
                endpoint.name_field.clone(),
                Value::String(category.name.clone()),
            );

            report.requests += 1;
            let response = self
                .transport
                .post(&endpoint.path, &[], Value::Object(body))
                .await?;
            let id = id_from_body(&response, &endpoint.id_field).ok_or_else(|| {
                Error::UnexpectedResponse {
                    path: endpoint.path.clone(),
                    reason: format!("created category '{}' has no identifier", category.name),
                }
            })?;

            let mut created = category.clone();
            created
                .record
                .absorb_computed(&self.target.category_shape, &response);
            tracker.record_category_created(created, id);
            report.created += 1;
        }
        Ok(())
    }

    /// Append `rules[from..]`, one run per contiguous group.
    async fn create_rules(
        &self,
        rules: &[Rule],
        from: usize,
        tracker: &mut OrderedTracker,
        report: &mut PassReport,
    ) -> Result<()> {
        let mut start = from;

        while start < rules.len() {
            let key = rules[start].group_key();
            let len = rules[start..]
                .iter()
                .take_while(|r| r.group_key() == key)
                .count();
            let run = &rules[start..start + len];

            let category_id = tracker
                .category_id(key.category)
                .map(String::from)
                .ok_or_else(|| Error::UnknownCategory {
                    index: start,
                    category: key.category.to_string(),
                })?;
            let query = vec![
                ("category".to_string(), category_id),
                ("section".to_string(), key.section.to_string()),
            ];

            debug!(
                category = key.category,
                section = key.section,
                count = run.len(),
                "Creating rule run"
            );
            self.create_run(run, query, tracker, report).await?;
            start += len;
        }
        Ok(())
    }

    async fn create_run(
        &self,
        run: &[Rule],
        query: Vec<(String, String)>,
        tracker: &mut OrderedTracker,
        report: &mut PassReport,
    ) -> Result<()> {
        let endpoint = &self.target.rules;

        match self.target.rule_bulk.create_strategy(self.server_version) {
            Strategy::Bulk => {
                let bodies: Vec<Value> = run
                    .iter()
                    .map(|r| Value::Object(r.record.to_body()))
                    .collect();
                let mut bulk_query = query;
                bulk_query.push(("bulk".to_string(), "true".to_string()));

                for batch in partition_payloads(&bodies, self.limits.max_payload_bytes) {
                    let body = Value::Array(bodies[batch.range.clone()].to_vec());
                    report.requests += 1;
                    let response = self.transport.post(&endpoint.path, &bulk_query, body).await?;
                    self.commit_bulk_created(&run[batch.range], response, tracker, report)?;
                }
            }
            Strategy::Sequential => {
                for rule in run {
                    report.requests += 1;
                    let response = self
                        .transport
                        .post(&endpoint.path, &query, Value::Object(rule.record.to_body()))
                        .await?;
                    let id = id_from_body(&response, &endpoint.id_field).ok_or_else(|| {
                        Error::UnexpectedResponse {
                            path: endpoint.path.clone(),
                            reason: "created rule has no identifier".to_string(),
                        }
                    })?;
                    tracker.record_rule_created(self.created_rule(rule, &response), id);
                    report.created += 1;
                }
            }
        }
        Ok(())
    }

    /// Match a bulk response back to the batch by position.
    ///
    /// Placeholder items are dropped before matching. Every item carrying an
    /// id is committed before any anomaly is reported.
    fn commit_bulk_created(
        &self,
        batch: &[Rule],
        response: Value,
        tracker: &mut OrderedTracker,
        report: &mut PassReport,
    ) -> Result<()> {
        let endpoint = &self.target.rules;
        let items: Vec<Value> = response_items(response)
            .into_iter()
            .filter(|item| {
                let placeholder = endpoint.is_placeholder(item);
                if placeholder {
                    debug!(path = %endpoint.path, "Skipping placeholder in bulk response");
                    report.placeholders_skipped += 1;
                }
                !placeholder
            })
            .collect();

        let received = items.len();
        let mut problems = Vec::new();
        for (position, (rule, item)) in batch.iter().zip(&items).enumerate() {
            let Some(id) = id_from_body(item, &endpoint.id_field) else {
                problems.push(format!("created rule at position {position} has no identifier"));
                continue;
            };
            tracker.record_rule_created(self.created_rule(rule, item), id);
            report.created += 1;
        }

        if received != batch.len() {
            problems.push(format!("sent {} rules, got {received} back", batch.len()));
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

    fn created_rule(&self, rule: &Rule, response: &Value) -> Rule {
        let mut created = rule.clone();
        created
            .record
            .absorb_computed(&self.target.rule_shape, response);
        created
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{shape::FieldDef, Record};

    fn shapes() -> (Shape, Shape) {
        (
            Shape::new(vec![FieldDef::computed("createdAt")]),
            Shape::new(vec![FieldDef::plain("name"), FieldDef::plain("action")]),
        )
    }

    fn rule(category: &str, name: &str, id: Option<&str>) -> Rule {
        let mut record = Record::new()
            .with_field("name", name)
            .with_field("action", "allow");
        if let Some(id) = id {
            record = record.with_remote_id(id);
        }
        Rule::new(category, "top", record)
    }

    fn observed(rules: &[&str]) -> PolicyRules {
        PolicyRules::new(
            vec![Category::new("web", Record::new().with_remote_id("c1"))],
            rules
                .iter()
                .enumerate()
                .map(|(i, name)| rule("web", name, Some(&format!("id-{i}"))))
                .collect(),
        )
    }

    fn desired(rules: &[&str]) -> PolicyRules {
        PolicyRules::new(
            vec![Category::new("web", Record::new())],
            rules.iter().map(|name| rule("web", name, None)).collect(),
        )
    }

    fn prefix(desired: &PolicyRules, observed: &PolicyRules) -> KeptPrefix {
        let (category_shape, rule_shape) = shapes();
        let mut primed = desired.clone();
        primed.adopt_ids_from(observed);
        kept_prefix(&category_shape, &rule_shape, &primed, observed)
    }

    #[test]
    fn keeps_matching_rules() {
        let kept = prefix(&desired(&["r1", "r2", "r4"]), &observed(&["r1", "r2", "r3"]));
        assert_eq!(kept, KeptPrefix { categories: 1, rules: 2 });
    }

    #[test]
    fn growing_list_keeps_everything_observed() {
        let kept = prefix(&desired(&["r1", "r2", "r3"]), &observed(&["r1"]));
        assert_eq!(kept.rules, 1);

        let kept = prefix(&desired(&["r1"]), &observed(&["r1", "r2"]));
        assert_eq!(kept.rules, 1);
    }

    #[test]
    fn changed_category_drops_its_rules() {
        let mut want = desired(&["r1", "r2"]);
        want.categories[0].name = "mail".into();
        for r in &mut want.rules {
            r.category = "mail".into();
        }

        let kept = prefix(&want, &observed(&["r1", "r2"]));
        assert_eq!(kept, KeptPrefix::default());
    }

    #[test]
    fn section_change_stops_prefix() {
        let mut want = desired(&["r1", "r2"]);
        want.rules[1].section = "bottom".into();

        let kept = prefix(&want, &observed(&["r1", "r2"]));
        assert_eq!(kept.rules, 1);
    }

    #[test]
    fn unconfirmed_observed_rule_stops_prefix() {
        let mut have = observed(&["r1", "r2"]);
        have.rules[0].record.remote_id = crate::Slot::Pending;

        let kept = prefix(&desired(&["r1", "r2"]), &have);
        assert_eq!(kept.rules, 0);
    }

    #[test]
    fn replace_mode_keeps_nothing() {
        let mut target = PolicyTarget::new(Endpoint::new("/categories"), Endpoint::new("/rules"));
        target.kept_prefix = KeptPrefixMode::Replace;

        let have = observed(&["r1"]);
        let mut want = desired(&["r1"]);
        want.adopt_ids_from(&have);
        assert_eq!(target.kept_prefix(&want, &have), KeptPrefix::default());

        target.kept_prefix = KeptPrefixMode::Preserve;
        assert_eq!(target.kept_prefix(&want, &have).rules, 1);
    }

    #[test]
    fn phase_serialization() {
        assert_eq!(
            serde_json::to_string(&Phase::TruncateCategories).unwrap(),
            "\"truncateCategories\""
        );
    }

    mod property_tests {
        use super::{desired, observed, prefix};
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_kept_prefix_is_first_difference(
                names in proptest::collection::vec("[a-c]", 0..8),
                tail in proptest::collection::vec("[x-z]", 0..4),
                cut in 0usize..8,
            ) {
                let cut = cut.min(names.len());
                let have: Vec<&str> = names.iter().map(String::as_str).collect();
                let mut want: Vec<&str> = have[..cut].to_vec();
                want.extend(tail.iter().map(String::as_str));

                // Tail names never occur in the observed list.
                let kept = prefix(&desired(&want), &observed(&have));
                prop_assert_eq!(kept.rules, cut);
            }
        }
    }
}
