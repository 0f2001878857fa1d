//! Declared configuration.
//!
//! A manifest names every keyed collection and access policy the agent
//! manages, where each lives on the server, and the records it should hold.
//! Declared fields carry no remote ids; those are joined in from the state
//! file before planning.

use crate::assignment::AssignmentSpec;
use crate::error::{AgentError, Result};
use converge_engine::{
    Category, KeyedState, KeyedTarget, PolicyRules, PolicyTarget, Record, Rule, Slot,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::Path;

/// Everything one agent pass reconciles.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    #[serde(default)]
    pub collections: BTreeMap<String, CollectionManifest>,
    #[serde(default)]
    pub policies: BTreeMap<String, PolicyManifest>,
    /// Assignment list memberships kept in place
    #[serde(default)]
    pub assignments: Vec<AssignmentSpec>,
}

/// A keyed collection and its declared records by name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionManifest {
    pub target: KeyedTarget,
    #[serde(default)]
    pub items: BTreeMap<String, Map<String, Value>>,
}

/// An access policy and its declared categories and rules, in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyManifest {
    pub target: PolicyTarget,
    #[serde(default)]
    pub categories: Vec<CategoryManifest>,
    #[serde(default)]
    pub rules: Vec<RuleManifest>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryManifest {
    pub name: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleManifest {
    pub category: String,
    pub section: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Manifest {
    /// Read a manifest file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| AgentError::io(path, e))?;
        serde_json::from_str(&text).map_err(|e| AgentError::json(path, e))
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

impl CollectionManifest {
    pub fn desired(&self) -> KeyedState {
        self.items
            .iter()
            .map(|(key, fields)| (key.clone(), declared_record(fields)))
            .collect()
    }
}

impl PolicyManifest {
    pub fn desired(&self) -> PolicyRules {
        let categories = self
            .categories
            .iter()
            .map(|c| Category::new(c.name.clone(), declared_record(&c.fields)))
            .collect();
        let rules = self
            .rules
            .iter()
            .map(|r| Rule::new(r.category.clone(), r.section.clone(), declared_record(&r.fields)))
            .collect();
        PolicyRules::new(categories, rules)
    }
}

/// Declared fields as a record. `null` means the field is left unset.
fn declared_record(fields: &Map<String, Value>) -> Record {
    let mut record = Record::new();
    for (name, value) in fields {
        if !value.is_null() {
            record.set_field(name.clone(), Slot::Known(value.clone()));
        }
    }
    record
}
