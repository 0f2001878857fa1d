//! One reconciliation pass over a whole manifest.
//!
//! Keyed collections go first, then access policies, then assignments.
//! Policies may reference keyed records by id and assignments reference
//! policies, so the first error stops the pass. Whatever was confirmed up to
//! that point, the failing collection's partial state included, is already in
//! the [`StateFile`] when the error is returned.

use crate::assignment::{assign, unassign, AssignmentLocks};
use crate::config::Config;
use crate::error::Result;
use crate::manifest::Manifest;
use crate::retry::FixedBackoff;
use crate::state::StateFile;
use converge_engine::{
    refresh_keyed, KeptPrefixMode, KeyedReconciler, Limits, OrderedReconciler, PassReport,
    PolicyTarget, Transport, Version,
};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Knobs shared by every collection in a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassSettings {
    pub limits: Limits,
    /// Overrides each policy's own kept-prefix mode
    pub kept_prefix: Option<KeptPrefixMode>,
    /// Re-read keyed collections before planning
    pub refresh: bool,
    /// Retry policy for assignment updates
    pub backoff: FixedBackoff,
}

impl Default for PassSettings {
    fn default() -> Self {
        Self {
            limits: Limits::default(),
            kept_prefix: None,
            refresh: true,
            backoff: FixedBackoff::default(),
        }
    }
}

impl From<&Config> for PassSettings {
    fn from(config: &Config) -> Self {
        Self {
            limits: config.limits,
            kept_prefix: config.kept_prefix,
            refresh: config.refresh,
            backoff: FixedBackoff::new(config.retry_attempts, config.retry_delay),
        }
    }
}

/// What a pass did, per collection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PassSummary {
    pub collections: BTreeMap<String, PassReport>,
    pub policies: BTreeMap<String, PassReport>,
    pub assigned: usize,
    pub unassigned: usize,
}

impl PassSummary {
    /// Counters summed over every collection and policy.
    pub fn total(&self) -> PassReport {
        let mut total = PassReport::default();
        for report in self.collections.values().chain(self.policies.values()) {
            total.absorb(report);
        }
        total
    }

    pub fn is_noop(&self) -> bool {
        self.total().is_noop() && self.assigned == 0 && self.unassigned == 0
    }
}

/// Runs passes against one server.
pub struct Pass<'a, T: ?Sized> {
    transport: &'a T,
    server_version: &'a Version,
    settings: &'a PassSettings,
    locks: &'a AssignmentLocks,
}

impl<'a, T: Transport + ?Sized> Pass<'a, T> {
    pub fn new(
        transport: &'a T,
        server_version: &'a Version,
        settings: &'a PassSettings,
        locks: &'a AssignmentLocks,
    ) -> Self {
        Self {
            transport,
            server_version,
            settings,
            locks,
        }
    }

    /// Reconcile everything the manifest declares, updating `state` as
    /// effects are confirmed.
    pub async fn run(&self, manifest: &Manifest, state: &mut StateFile) -> Result<PassSummary> {
        let mut summary = PassSummary::default();

        info!(
            server_version = %self.server_version,
            collections = manifest.collections.len(),
            policies = manifest.policies.len(),
            assignments = manifest.assignments.len(),
            "Starting pass"
        );

        self.run_collections(manifest, state, &mut summary).await?;
        self.run_policies(manifest, state, &mut summary).await?;
        self.run_assignments(manifest, state, &mut summary).await?;

        let total = summary.total();
        info!(
            created = total.created,
            updated = total.updated,
            deleted = total.deleted,
            requests = total.requests,
            assigned = summary.assigned,
            unassigned = summary.unassigned,
            "Pass complete"
        );
        Ok(summary)
    }

    async fn run_collections(
        &self,
        manifest: &Manifest,
        state: &mut StateFile,
        summary: &mut PassSummary,
    ) -> Result<()> {
        for name in state.snapshot.collections.keys() {
            if !manifest.collections.contains_key(name) {
                warn!(collection = %name, "Collection no longer declared, leaving it in place");
            }
        }

        for (name, collection) in &manifest.collections {
            let mut report = PassReport::default();
            let mut observed = state.snapshot.collection(name);

            if self.settings.refresh && !observed.is_empty() {
                let refreshed =
                    refresh_keyed(self.transport, &collection.target, observed).await;
                report.absorb(&refreshed.report);
                let (fresh, result) = refreshed.into_parts();
                state.snapshot.set_collection(name.clone(), fresh.clone());
                if let Err(err) = result {
                    summary.collections.insert(name.clone(), report);
                    return Err(err.into());
                }
                observed = fresh;
            }

            let desired = collection.desired();
            let outcome = KeyedReconciler::new(
                self.transport,
                &collection.target,
                self.server_version,
                self.settings.limits,
            )
            .reconcile(&desired, observed)
            .await;

            report.absorb(&outcome.report);
            let (observed, result) = outcome.into_parts();
            state.snapshot.set_collection(name.clone(), observed);
            summary.collections.insert(name.clone(), report);
            result?;
        }

        Ok(())
    }

    async fn run_policies(
        &self,
        manifest: &Manifest,
        state: &mut StateFile,
        summary: &mut PassSummary,
    ) -> Result<()> {
        for name in state.snapshot.policies.keys() {
            if !manifest.policies.contains_key(name) {
                warn!(policy = %name, "Policy no longer declared, leaving it in place");
            }
        }

        for (name, policy) in &manifest.policies {
            let target = match self.settings.kept_prefix {
                Some(mode) => PolicyTarget {
                    kept_prefix: mode,
                    ..policy.target.clone()
                },
                None => policy.target.clone(),
            };

            let desired = policy.desired();
            let observed = state.snapshot.policy(name);
            let outcome = OrderedReconciler::new(
                self.transport,
                &target,
                self.server_version,
                self.settings.limits,
            )
            .reconcile(&desired, observed)
            .await;

            let (observed, result) = outcome.into_parts();
            state.snapshot.set_policy(name.clone(), observed);
            match result {
                Ok(report) => {
                    summary.policies.insert(name.clone(), report);
                }
                Err(err) => {
                    warn!(policy = %name, error = %err, "Policy pass aborted");
                    return Err(err.into());
                }
            }
        }

        Ok(())
    }

    async fn run_assignments(
        &self,
        manifest: &Manifest,
        state: &mut StateFile,
        summary: &mut PassSummary,
    ) -> Result<()> {
        let backoff = &self.settings.backoff;

        // Only memberships this agent added are owned. One that was already
        // present belongs to whoever put it there.
        for spec in &manifest.assignments {
            if assign(self.transport, self.locks, backoff, spec).await? {
                summary.assigned += 1;
                state.add_assignment(spec);
            } else if !state.assignments.contains(spec) {
                debug!(
                    path = %spec.path,
                    member = %spec.member,
                    "Membership already present, not taking ownership"
                );
            }
        }

        let stale: Vec<_> = state
            .assignments
            .iter()
            .filter(|owned| !manifest.assignments.contains(*owned))
            .cloned()
            .collect();
        for spec in &stale {
            if unassign(self.transport, self.locks, backoff, spec).await? {
                summary.unassigned += 1;
            }
            state.remove_assignment(spec);
        }

        Ok(())
    }
}
