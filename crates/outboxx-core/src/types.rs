use std::collections::HashMap;

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};

use crate::error::CoreResult;

/// A column value carried by a change event.
///
/// Values arrive from the replication stream in PostgreSQL's text format;
/// the source maps common type OIDs to typed variants and leaves everything
/// else as `Text`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Array(Vec<Value>),
    Object(HashMap<String, Value>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else if let Some(f) = n.as_f64() {
                    Value::Float(f)
                } else {
                    Value::Null
                }
            }
            serde_json::Value::String(s) => Value::Text(s),
            serde_json::Value::Array(arr) => {
                Value::Array(arr.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(obj) => {
                Value::Object(obj.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

/// The row operation that produced a change event.
///
/// Serialized uppercase on the wire (`"INSERT"`); configuration files use
/// their own lowercase spelling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Insert => "INSERT",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
        }
    }
}

/// An ordered row: column name/value pairs in relation-column order.
///
/// Order matters for the wire contract, so this is a `Vec` rather than a
/// map; it serializes as a JSON object with keys in insertion order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RowData {
    columns: Vec<(String, Value)>,
}

impl RowData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            columns: Vec::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, name: impl Into<String>, value: Value) {
        self.columns.push((name.into(), value));
    }

    /// Look up a column by name (first match wins).
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.columns
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, Value)> {
        self.columns.iter()
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

impl FromIterator<(String, Value)> for RowData {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self {
            columns: iter.into_iter().collect(),
        }
    }
}

impl Serialize for RowData {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.columns.len()))?;
        for (name, value) in &self.columns {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

/// Event metadata: where the change came from and when.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Meta {
    /// Source system identifier, always `"postgres"` for this pipeline.
    pub source: String,
    /// Schema (namespace) of the changed relation.
    pub schema: String,
    /// Relation (table) name.
    pub resource: String,
    /// Commit time as Unix seconds.
    pub timestamp: i64,
    /// WAL position of the originating frame, `"HI/LO"` uppercase hex.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lsn: Option<String>,
}

impl Meta {
    pub fn postgres(
        schema: impl Into<String>,
        resource: impl Into<String>,
        timestamp: i64,
        lsn: Option<String>,
    ) -> Self {
        Self {
            source: "postgres".to_string(),
            schema: schema.into(),
            resource: resource.into(),
            timestamp,
            lsn,
        }
    }
}

/// Event payload: a plain row for INSERT/DELETE, a new/old pair for UPDATE.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum EventData {
    Row(RowData),
    Diff { new: RowData, old: RowData },
}

/// One row-level change, ready for routing and serialization.
///
/// Field order is the wire order: `op`, `data`, `meta`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeEvent {
    pub op: Operation,
    pub data: EventData,
    pub meta: Meta,
}

impl ChangeEvent {
    /// The row that identifies the affected entity: the new row for
    /// INSERT/UPDATE, the key/old row for DELETE.
    pub fn key_row(&self) -> &RowData {
        match &self.data {
            EventData::Row(row) => row,
            EventData::Diff { new, old } => match self.op {
                Operation::Delete => old,
                _ => new,
            },
        }
    }

    /// Serialize to the JSON wire format.
    pub fn to_json(&self) -> CoreResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pairs: &[(&str, Value)]) -> RowData {
        pairs
            .iter()
            .map(|(n, v)| (n.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_value_accessors() {
        assert!(Value::Null.is_null());
        assert_eq!(Value::Bool(true).as_bool(), Some(true));
        assert_eq!(Value::Int(42).as_i64(), Some(42));
        assert_eq!(Value::Int(42).as_f64(), Some(42.0));
        assert_eq!(Value::Text("hi".into()).as_str(), Some("hi"));
        assert_eq!(Value::Text("hi".into()).as_i64(), None);
    }

    #[test]
    fn test_row_data_preserves_order() {
        let row = row(&[
            ("zeta", Value::Int(1)),
            ("alpha", Value::Int(2)),
            ("mid", Value::Int(3)),
        ]);

        let names: Vec<&str> = row.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["zeta", "alpha", "mid"]);

        let json = serde_json::to_string(&row).unwrap();
        assert_eq!(json, r#"{"zeta":1,"alpha":2,"mid":3}"#);
    }

    #[test]
    fn test_row_data_get() {
        let row = row(&[("id", Value::Int(7)), ("name", Value::Text("x".into()))]);
        assert_eq!(row.get("id"), Some(&Value::Int(7)));
        assert!(row.get("missing").is_none());
    }

    #[test]
    fn test_insert_event_wire_shape() {
        let event = ChangeEvent {
            op: Operation::Insert,
            data: EventData::Row(row(&[
                ("id", Value::Int(42)),
                ("email", Value::Text("a@b.c".into())),
            ])),
            meta: Meta::postgres("public", "users", 1720000000, Some("16/B374D848".into())),
        };

        let json = String::from_utf8(event.to_json().unwrap()).unwrap();
        assert_eq!(
            json,
            r#"{"op":"INSERT","data":{"id":42,"email":"a@b.c"},"meta":{"source":"postgres","schema":"public","resource":"users","timestamp":1720000000,"lsn":"16/B374D848"}}"#
        );
    }

    #[test]
    fn test_update_event_carries_new_and_old() {
        let event = ChangeEvent {
            op: Operation::Update,
            data: EventData::Diff {
                new: row(&[("id", Value::Int(1)), ("name", Value::Text("Bob".into()))]),
                old: row(&[("id", Value::Int(1)), ("name", Value::Text("Alice".into()))]),
            },
            meta: Meta::postgres("public", "users", 0, None),
        };

        let parsed: serde_json::Value =
            serde_json::from_slice(&event.to_json().unwrap()).unwrap();
        assert_eq!(parsed["op"], "UPDATE");
        assert_eq!(parsed["data"]["new"]["name"], "Bob");
        assert_eq!(parsed["data"]["old"]["name"], "Alice");
        // No lsn field when absent.
        assert!(parsed["meta"].get("lsn").is_none());
    }

    #[test]
    fn test_string_escaping_round_trips() {
        let tricky = "line1\nline2\ttab \"quoted\" back\\slash\rend";
        let event = ChangeEvent {
            op: Operation::Insert,
            data: EventData::Row(row(&[("note", Value::Text(tricky.into()))])),
            meta: Meta::postgres("public", "notes", 0, None),
        };

        let bytes = event.to_json().unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed["data"]["note"], tricky);
    }

    #[test]
    fn test_null_serializes_as_json_null() {
        let row = row(&[("gone", Value::Null)]);
        assert_eq!(serde_json::to_string(&row).unwrap(), r#"{"gone":null}"#);
    }

    #[test]
    fn test_key_row_by_operation() {
        let new = row(&[("id", Value::Int(2))]);
        let old = row(&[("id", Value::Int(1))]);

        let update = ChangeEvent {
            op: Operation::Update,
            data: EventData::Diff {
                new: new.clone(),
                old: old.clone(),
            },
            meta: Meta::postgres("public", "t", 0, None),
        };
        assert_eq!(update.key_row().get("id"), Some(&Value::Int(2)));

        let delete = ChangeEvent {
            op: Operation::Delete,
            data: EventData::Row(old),
            meta: Meta::postgres("public", "t", 0, None),
        };
        assert_eq!(delete.key_row().get("id"), Some(&Value::Int(1)));
    }

    #[test]
    fn test_value_from_json() {
        let json: serde_json::Value =
            serde_json::from_str(r#"{"a":1,"b":[true,null],"c":"x"}"#).unwrap();
        match Value::from(json) {
            Value::Object(obj) => {
                assert_eq!(obj["a"], Value::Int(1));
                assert_eq!(obj["b"], Value::Array(vec![Value::Bool(true), Value::Null]));
                assert_eq!(obj["c"], Value::Text("x".into()));
            }
            other => panic!("expected object, got {:?}", other),
        }
    }
}
