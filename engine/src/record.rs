//! Record types for desired and observed state.
//!
//! Desired and observed records share one shape. An observed record is simply
//! one whose `remote_id` has been confirmed by the server.

use crate::{shape::Shape, RemoteId, Slot};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Field values by name.
pub type Fields = BTreeMap<String, Slot<Value>>;

static UNSET: Slot<Value> = Slot::Unset;

/// One managed entity.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    /// Identifier assigned by the server at creation time
    #[serde(default, skip_serializing_if = "Slot::is_unset")]
    pub remote_id: Slot<RemoteId>,
    /// Typed fields, nested child collections included
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: Fields,
}

impl Record {
    /// Create an empty record with no remote identity.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a known field value.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), Slot::Known(value.into()));
        self
    }

    /// Mark a field as awaiting server assignment.
    pub fn with_pending(mut self, name: impl Into<String>) -> Self {
        self.fields.insert(name.into(), Slot::Pending);
        self
    }

    pub fn with_remote_id(mut self, id: impl Into<RemoteId>) -> Self {
        self.remote_id = Slot::Known(id.into());
        self
    }

    /// The confirmed remote identifier. Empty identifiers count as unknown.
    pub fn remote_id(&self) -> Option<&str> {
        self.remote_id.non_empty()
    }

    /// Get a field slot; absent fields read as unset.
    pub fn field(&self, name: &str) -> &Slot<Value> {
        self.fields.get(name).unwrap_or(&UNSET)
    }

    pub fn set_field(&mut self, name: impl Into<String>, value: Slot<Value>) {
        self.fields.insert(name.into(), value);
    }

    /// Request body for this record: every known field, nothing else.
    pub fn to_body(&self) -> Map<String, Value> {
        self.fields
            .iter()
            .filter_map(|(name, slot)| slot.known().map(|v| (name.clone(), v.clone())))
            .collect()
    }

    /// Build a record from a server response body.
    ///
    /// Keys listed in `reserved` (identifier and name fields) are not copied
    /// into `fields`. The remote id is left unset.
    pub fn from_body(body: &Value, reserved: &[&str]) -> Self {
        let fields = body
            .as_object()
            .map(|obj| {
                obj.iter()
                    .filter(|(name, _)| !reserved.contains(&name.as_str()))
                    .map(|(name, value)| (name.clone(), Slot::Known(value.clone())))
                    .collect()
            })
            .unwrap_or_default();

        Self {
            remote_id: Slot::Unset,
            fields,
        }
    }

    /// Copy server-computed fields from a response body.
    pub fn absorb_computed(&mut self, shape: &Shape, body: &Value) {
        for def in shape.computed_fields() {
            match body.get(&def.name) {
                Some(Value::Null) | None => {}
                Some(value) => {
                    self.fields
                        .insert(def.name.clone(), Slot::Known(value.clone()));
                }
            }
        }
    }

    /// This record, confirmed under the given identifier.
    pub fn confirmed(mut self, id: impl Into<RemoteId>) -> Self {
        self.remote_id = Slot::Known(id.into());
        self
    }
}

/// Read an identifier out of a response body. Numeric ids are stringified.
pub fn id_from_body(body: &Value, id_field: &str) -> Option<RemoteId> {
    match body.get(id_field)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape::{FieldDef, FieldKind};
    use serde_json::json;

    #[test]
    fn create_record() {
        let record = Record::new()
            .with_field("name", "web")
            .with_pending("fingerprint");

        assert_eq!(record.remote_id(), None);
        assert_eq!(record.field("name"), &Slot::Known(json!("web")));
        assert!(record.field("fingerprint").is_pending());
        assert!(record.field("missing").is_unset());
    }

    #[test]
    fn body_contains_only_known_fields() {
        let record = Record::new()
            .with_field("port", 443)
            .with_pending("fingerprint")
            .with_remote_id("7");

        let body = record.to_body();
        assert_eq!(Value::Object(body), json!({"port": 443}));
    }

    #[test]
    fn from_body_skips_reserved_keys() {
        let body = json!({"id": "9", "name": "db", "port": 5432});
        let record = Record::from_body(&body, &["id", "name"]);

        assert_eq!(record.fields.len(), 1);
        assert_eq!(record.field("port"), &Slot::Known(json!(5432)));
        assert!(record.remote_id.is_unset());
    }

    #[test]
    fn absorb_computed_fields() {
        let shape = Shape::new(vec![
            FieldDef::plain("port"),
            FieldDef::new("createdAt", FieldKind::Computed),
        ]);
        let mut record = Record::new().with_field("port", 80);
        record.absorb_computed(&shape, &json!({"port": 81, "createdAt": "2024-01-01"}));

        assert_eq!(record.field("port"), &Slot::Known(json!(80)));
        assert_eq!(record.field("createdAt"), &Slot::Known(json!("2024-01-01")));
    }

    #[test]
    fn numeric_ids_are_stringified() {
        assert_eq!(id_from_body(&json!({"id": 12}), "id"), Some("12".into()));
        assert_eq!(id_from_body(&json!({"id": ""}), "id"), None);
        assert_eq!(id_from_body(&json!({}), "id"), None);
    }

    #[test]
    fn serialization_roundtrip() {
        let record = Record::new()
            .with_field("tags", json!(["a", "b"]))
            .with_pending("hash")
            .with_remote_id("abc");

        let json = serde_json::to_string(&record).unwrap();
        let parsed: Record = serde_json::from_str(&json).unwrap();

        assert_eq!(record, parsed);
    }
}
