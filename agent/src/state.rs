//! The state file.
//!
//! Holds the observed state of every managed collection plus the assignment
//! memberships the agent put in place. It is rewritten after every pass,
//! including failed ones, so a rerun starts from what actually exists
//! remotely.

use crate::assignment::AssignmentSpec;
use crate::error::{AgentError, Result};
use chrono::{DateTime, Utc};
use converge_engine::{SnapshotSummary, StateSnapshot};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info, warn};

/// Contents of the state file.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saved_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub snapshot: StateSnapshot,
    /// Memberships this agent added and still owns
    #[serde(default)]
    pub assignments: Vec<AssignmentSpec>,
}

impl StateFile {
    /// Read the state file. A missing file is an empty state.
    pub fn load(path: &Path) -> Result<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "No state file, starting from empty state");
                return Ok(Self::default());
            }
            Err(e) => return Err(AgentError::io(path, e)),
        };

        let state: Self = serde_json::from_str(&text).map_err(|e| AgentError::json(path, e))?;
        state.snapshot.check_format_version()?;
        if let Err(err) = state.snapshot.validate() {
            warn!(path = %path.display(), error = %err, "State file is inconsistent");
        }

        let summary = SnapshotSummary::from(&state.snapshot);
        debug!(
            path = %path.display(),
            collections = summary.collections,
            policies = summary.policies,
            records = summary.record_count,
            "Loaded state file"
        );
        Ok(state)
    }

    /// Write the state file, replacing the previous one atomically.
    pub fn save(&mut self, path: &Path) -> Result<()> {
        self.saved_at = Some(Utc::now());
        let json = serde_json::to_string_pretty(self).map_err(|e| AgentError::json(path, e))?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| AgentError::io(parent, e))?;
        }
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, json).map_err(|e| AgentError::io(&tmp, e))?;
        std::fs::rename(&tmp, path).map_err(|e| AgentError::io(path, e))?;

        debug!(path = %path.display(), "Saved state file");
        Ok(())
    }

    pub fn add_assignment(&mut self, spec: &AssignmentSpec) {
        if !self.assignments.contains(spec) {
            self.assignments.push(spec.clone());
        }
    }

    pub fn remove_assignment(&mut self, spec: &AssignmentSpec) {
        self.assignments.retain(|a| a != spec);
    }
}
