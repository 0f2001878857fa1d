//! Record shapes and structural comparison.
//!
//! A [`Shape`] tells the differ how to compare each field: plainly, not at all
//! (server-computed), or recursively as a nested object, ordered list, or
//! unordered set. One generic comparison covers every collection type.

use crate::{Record, Slot};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

/// How a field is compared.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FieldKind {
    /// Compared by JSON equality
    #[default]
    Plain,
    /// Computed by the server; never compared
    Computed,
    /// Unordered collection of nested values
    Set(Shape),
    /// Ordered collection of nested values
    List(Shape),
    /// Nested object
    Object(Shape),
}

/// Definition of a field in a shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDef {
    /// Field name
    pub name: String,
    /// Comparison kind
    #[serde(default)]
    pub kind: FieldKind,
    /// Whether the server fills this field in when the user leaves it unset
    #[serde(default)]
    pub server_default: bool,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            server_default: false,
        }
    }

    pub fn plain(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Plain)
    }

    pub fn computed(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Computed)
    }

    /// Accept any server value while the user leaves this field unset.
    pub fn server_default(mut self) -> Self {
        self.server_default = true;
        self
    }
}

/// Descriptor for one record type.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Shape {
    #[serde(default)]
    pub fields: Vec<FieldDef>,
}

impl Shape {
    pub fn new(fields: Vec<FieldDef>) -> Self {
        Self { fields }
    }

    pub fn with_field(mut self, def: FieldDef) -> Self {
        self.fields.push(def);
        self
    }

    /// Look up a field definition by name.
    pub fn def(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|d| d.name == name)
    }

    pub fn computed_fields(&self) -> impl Iterator<Item = &FieldDef> {
        self.fields
            .iter()
            .filter(|d| matches!(d.kind, FieldKind::Computed))
    }

    /// Names of fields whose desired content differs from the observed one.
    ///
    /// The remote id and computed fields are never reported.
    pub fn changed_fields(&self, desired: &Record, observed: &Record) -> Vec<String> {
        let names: BTreeSet<&String> = desired
            .fields
            .keys()
            .chain(observed.fields.keys())
            .collect();

        names
            .into_iter()
            .filter(|name| !self.slot_eq(name, desired.field(name), observed.field(name)))
            .cloned()
            .collect()
    }

    /// Check whether two records carry the same content.
    pub fn content_eq(&self, desired: &Record, observed: &Record) -> bool {
        self.changed_fields(desired, observed).is_empty()
    }

    fn slot_eq(&self, name: &str, desired: &Slot<Value>, observed: &Slot<Value>) -> bool {
        let def = self.def(name);
        if matches!(def.map(|d| &d.kind), Some(FieldKind::Computed)) {
            return true;
        }

        match (normalize(desired), normalize(observed)) {
            (Slot::Pending, _) | (_, Slot::Pending) => false,
            (Slot::Unset, Slot::Unset) => true,
            (Slot::Unset, Slot::Known(_)) => def.is_some_and(|d| d.server_default),
            (Slot::Known(_), Slot::Unset) => false,
            (Slot::Known(a), Slot::Known(b)) => match def {
                Some(def) => def.kind.value_eq(a, b),
                None => a == b,
            },
        }
    }

    /// Compare two nested values under this shape.
    pub fn value_eq(&self, a: &Value, b: &Value) -> bool {
        let (Value::Object(left), Value::Object(right)) = (a, b) else {
            return a == b;
        };

        let keys: BTreeSet<&String> = left.keys().chain(right.keys()).collect();
        keys.into_iter().all(|key| {
            let def = self.def(key);
            let l = left.get(key).filter(|v| !v.is_null());
            let r = right.get(key).filter(|v| !v.is_null());
            match (def, l, r) {
                (Some(def), _, _) if matches!(def.kind, FieldKind::Computed) => true,
                (_, None, None) => true,
                (Some(def), None, Some(_)) => def.server_default,
                (_, None, Some(_)) | (_, Some(_), None) => false,
                (Some(def), Some(l), Some(r)) => def.kind.value_eq(l, r),
                (None, Some(l), Some(r)) => l == r,
            }
        })
    }
}

impl FieldKind {
    fn value_eq(&self, a: &Value, b: &Value) -> bool {
        match self {
            FieldKind::Plain => a == b,
            FieldKind::Computed => true,
            FieldKind::Object(shape) => shape.value_eq(a, b),
            FieldKind::List(shape) => {
                let (left, right) = (elements(a), elements(b));
                match (left, right) {
                    (Some(l), Some(r)) => {
                        l.len() == r.len() && l.iter().zip(r).all(|(x, y)| shape.value_eq(x, y))
                    }
                    _ => a == b,
                }
            }
            FieldKind::Set(shape) => match (elements(a), elements(b)) {
                (Some(l), Some(r)) => multiset_eq(shape, l, r),
                _ => a == b,
            },
        }
    }
}

/// Explicit nulls read the same as unset values.
fn normalize(slot: &Slot<Value>) -> Slot<&Value> {
    match slot {
        Slot::Known(Value::Null) => Slot::Unset,
        other => other.as_ref(),
    }
}

/// Array elements; `null` reads as an empty collection.
fn elements(value: &Value) -> Option<&[Value]> {
    match value {
        Value::Array(items) => Some(items.as_slice()),
        Value::Null => Some(&[]),
        _ => None,
    }
}

fn multiset_eq(shape: &Shape, left: &[Value], right: &[Value]) -> bool {
    if left.len() != right.len() {
        return false;
    }

    let mut used = vec![false; right.len()];
    left.iter().all(|l| {
        let found = right
            .iter()
            .enumerate()
            .find(|(i, r)| !used[*i] && shape.value_eq(l, r))
            .map(|(i, _)| i);
        match found {
            Some(i) => {
                used[i] = true;
                true
            }
            None => false,
        }
    })
}
