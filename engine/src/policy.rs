//! Access-policy categories and rules.
//!
//! Both lists are positional. Every rule belongs to a group, the
//! `(category, section)` pair, and rules of one group must stay contiguous
//! with groups following the declared category order. The server can only
//! append to the end of a group, which is what makes these lists hard.

use crate::{error::Result, Error, Record};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// A named rule category.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Category {
    pub name: String,
    #[serde(flatten)]
    pub record: Record,
}

impl Category {
    pub fn new(name: impl Into<String>, record: Record) -> Self {
        Self {
            name: name.into(),
            record,
        }
    }
}

/// A rule positioned inside a category section.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    pub category: String,
    pub section: String,
    #[serde(flatten)]
    pub record: Record,
}

impl Rule {
    pub fn new(category: impl Into<String>, section: impl Into<String>, record: Record) -> Self {
        Self {
            category: category.into(),
            section: section.into(),
            record,
        }
    }

    pub fn group_key(&self) -> GroupKey<'_> {
        GroupKey {
            category: &self.category,
            section: &self.section,
        }
    }
}

/// The `(category, section)` pair a rule is appended to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GroupKey<'a> {
    pub category: &'a str,
    pub section: &'a str,
}

/// Categories and rules of one access policy, in declared order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyRules {
    #[serde(default)]
    pub categories: Vec<Category>,
    #[serde(default)]
    pub rules: Vec<Rule>,
}

impl PolicyRules {
    pub fn new(categories: Vec<Category>, rules: Vec<Rule>) -> Self {
        Self { categories, rules }
    }

    /// Carry remote ids over from prior state.
    ///
    /// Categories match by name, rules by position. Ids the declaration
    /// already carries are left alone.
    pub fn adopt_ids_from(&mut self, observed: &PolicyRules) {
        let by_name: HashMap<&str, &Record> = observed
            .categories
            .iter()
            .map(|c| (c.name.as_str(), &c.record))
            .collect();

        for category in &mut self.categories {
            if category.record.remote_id.is_unset() {
                if let Some(prior) = by_name.get(category.name.as_str()) {
                    category.record.remote_id = prior.remote_id.clone();
                }
            }
        }

        for (rule, prior) in self.rules.iter_mut().zip(&observed.rules) {
            if rule.record.remote_id.is_unset() {
                rule.record.remote_id = prior.record.remote_id.clone();
            }
        }
    }

    /// Check that the declaration can be built by appending only.
    ///
    /// Category names must be unique, rules must reference declared
    /// categories, each group must be contiguous, and groups must follow
    /// the category declaration order.
    pub fn validate(&self) -> Result<()> {
        let mut order: HashMap<&str, usize> = HashMap::new();
        for (index, category) in self.categories.iter().enumerate() {
            if order.insert(category.name.as_str(), index).is_some() {
                return Err(Error::DuplicateCategory(category.name.clone()));
            }
        }

        let mut closed: HashSet<GroupKey<'_>> = HashSet::new();
        let mut current: Option<(GroupKey<'_>, usize)> = None;

        for (index, rule) in self.rules.iter().enumerate() {
            let key = rule.group_key();
            let position = *order
                .get(key.category)
                .ok_or_else(|| Error::UnknownCategory {
                    index,
                    category: rule.category.clone(),
                })?;

            match current {
                Some((open, _)) if open == key => continue,
                Some((open, open_position)) => {
                    if closed.contains(&key) {
                        return Err(group_order(index, rule, "group already closed"));
                    }
                    if position < open_position {
                        return Err(group_order(
                            index,
                            rule,
                            "category is declared before the preceding rule's category",
                        ));
                    }
                    closed.insert(open);
                }
                None => {}
            }
            current = Some((key, position));
        }

        Ok(())
    }
}

fn group_order(index: usize, rule: &Rule, reason: &str) -> Error {
    Error::GroupOrder {
        index,
        category: rule.category.clone(),
        section: rule.section.clone(),
        reason: reason.to_string(),
    }
}
