//! Batch header: the evolving typed field set of an open stream
//!
//! Each consumed record merges into the stream's [`BatchHeader`]: new field
//! names append in first-seen order, repeated fields fold their value types
//! through the widening join. Caller-supplied dialect type overrides ride
//! along and win at materialization time.

use crate::datatype::DataType;
use crate::object::{infer_type, Object, TypePolicy};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// A typed field of the evolving header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub data_type: DataType,
    /// Caller-forced dialect SQL type for this column, if any.
    pub override_type: Option<String>,
}

impl Field {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            override_type: None,
        }
    }
}

/// Per-column dialect type overrides, keyed by field name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SqlTypes(IndexMap<String, String>);

impl SqlTypes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, column: impl Into<String>, sql_type: impl Into<String>) -> Self {
        self.0.insert(column.into(), sql_type.into());
        self
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        self.0.get(column).map(|s| s.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Ordered, name-deduplicated set of typed fields for one open stream.
///
/// The field set is the union of names ever seen; each field's type is the
/// join of its observed value types.
#[derive(Debug, Clone)]
pub struct BatchHeader {
    table_name: String,
    fields: IndexMap<String, Field>,
}

impl BatchHeader {
    pub fn new(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            fields: IndexMap::new(),
        }
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.get(name)
    }

    pub fn fields(&self) -> impl Iterator<Item = &Field> {
        self.fields.values()
    }

    /// Merge one record into the header: infer each value's type and join it
    /// into the accumulated field type. Returns `true` when the merge changed
    /// the header (a new field appeared or an existing one widened).
    pub fn merge_object(&mut self, object: &Object, policy: TypePolicy) -> bool {
        let mut changed = false;
        for (name, value) in object {
            let observed = infer_type(value, policy);
            match self.fields.entry(name.clone()) {
                indexmap::map::Entry::Occupied(mut slot) => {
                    let field = slot.get_mut();
                    let joined = field.data_type.join(observed);
                    if joined != field.data_type {
                        field.data_type = joined;
                        changed = true;
                    }
                }
                indexmap::map::Entry::Vacant(slot) => {
                    slot.insert(Field::new(name.clone(), observed));
                    changed = true;
                }
            }
        }
        changed
    }

    /// Attach caller-supplied dialect overrides to matching fields.
    pub fn apply_overrides(&mut self, overrides: &SqlTypes) {
        if overrides.is_empty() {
            return;
        }
        for field in self.fields.values_mut() {
            if let Some(sql_type) = overrides.get(&field.name) {
                field.override_type = Some(sql_type.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: serde_json::Value) -> Object {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn test_fields_keep_first_seen_order() {
        let mut header = BatchHeader::new("events");
        header.merge_object(&obj(json!({"b": 1, "a": 2})), TypePolicy::default());
        header.merge_object(&obj(json!({"c": 3, "a": 4})), TypePolicy::default());

        let names: Vec<&str> = header.fields().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["b", "a", "c"]);
    }

    #[test]
    fn test_repeated_field_widens() {
        let mut header = BatchHeader::new("events");
        assert!(header.merge_object(&obj(json!({"a": 1})), TypePolicy::default()));
        assert!(header.merge_object(&obj(json!({"a": 1.5})), TypePolicy::default()));
        assert_eq!(header.field("a").unwrap().data_type, DataType::Float64);

        // Same shape again: no change
        assert!(!header.merge_object(&obj(json!({"a": 2.5})), TypePolicy::default()));
    }

    #[test]
    fn test_null_only_field_stays_unknown() {
        let mut header = BatchHeader::new("events");
        header.merge_object(&obj(json!({"a": 1, "b": null})), TypePolicy::default());
        header.merge_object(&obj(json!({"a": 2, "b": null})), TypePolicy::default());
        assert_eq!(header.field("b").unwrap().data_type, DataType::Unknown);
    }

    #[test]
    fn test_null_then_value_pins_type() {
        let mut header = BatchHeader::new("events");
        header.merge_object(&obj(json!({"b": null})), TypePolicy::default());
        header.merge_object(&obj(json!({"b": true})), TypePolicy::default());
        assert_eq!(header.field("b").unwrap().data_type, DataType::Bool);
    }

    #[test]
    fn test_apply_overrides() {
        let mut header = BatchHeader::new("events");
        header.merge_object(
            &obj(json!({"x": 1, "y": "2023-01-01T00:00:00Z"})),
            TypePolicy::default(),
        );
        header.apply_overrides(&SqlTypes::new().with("y", "text"));

        let y = header.field("y").unwrap();
        assert_eq!(y.data_type, DataType::Timestamp);
        assert_eq!(y.override_type.as_deref(), Some("text"));
        assert!(header.field("x").unwrap().override_type.is_none());
    }
}
