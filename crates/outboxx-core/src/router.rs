//! Matches change events against configured streams and derives the
//! partition key that keeps all events for one entity on one partition.

use crate::types::{ChangeEvent, Operation, Value};

/// Runtime form of one configured stream.
#[derive(Debug, Clone)]
pub struct StreamRoute {
    /// Stream name, used for logging only.
    pub name: String,
    /// Source relation this stream listens to.
    pub resource: String,
    /// Operations the stream subscribes to.
    pub operations: Vec<Operation>,
    /// Destination topic.
    pub destination: String,
    /// Column whose value becomes the partition key; the resource name is
    /// used when unset or when the column is absent/NULL.
    pub routing_key: Option<String>,
}

impl StreamRoute {
    pub fn matches(&self, event: &ChangeEvent) -> bool {
        event.meta.resource == self.resource && self.operations.contains(&event.op)
    }

    /// Partition key for an event. INSERT/UPDATE key on the new row,
    /// DELETE on the key/old row, so one entity always maps to one key.
    pub fn routing_key_for(&self, event: &ChangeEvent) -> String {
        self.routing_key
            .as_deref()
            .and_then(|column| event.key_row().get(column))
            .and_then(value_to_key)
            .unwrap_or_else(|| event.meta.resource.clone())
    }
}

/// Routes events to the streams that subscribe to them.
pub struct Router {
    streams: Vec<StreamRoute>,
}

impl Router {
    pub fn new(streams: Vec<StreamRoute>) -> Self {
        Self { streams }
    }

    /// All streams matching an event, in configuration order.
    pub fn route<'a>(&'a self, event: &ChangeEvent) -> Vec<&'a StreamRoute> {
        self.streams.iter().filter(|s| s.matches(event)).collect()
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}

fn value_to_key(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::Bool(b) => Some(b.to_string()),
        Value::Int(i) => Some(i.to_string()),
        Value::Float(f) => Some(f.to_string()),
        Value::Text(s) => Some(s.clone()),
        Value::Array(_) | Value::Object(_) => serde_json::to_string(value).ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EventData, Meta, RowData};

    fn stream(resource: &str, operations: Vec<Operation>, key: Option<&str>) -> StreamRoute {
        StreamRoute {
            name: format!("{}-stream", resource),
            resource: resource.to_string(),
            operations,
            destination: format!("cdc.{}", resource),
            routing_key: key.map(str::to_string),
        }
    }

    fn row(pairs: &[(&str, Value)]) -> RowData {
        pairs
            .iter()
            .map(|(n, v)| (n.to_string(), v.clone()))
            .collect()
    }

    fn insert_event(resource: &str, data: RowData) -> ChangeEvent {
        ChangeEvent {
            op: Operation::Insert,
            data: EventData::Row(data),
            meta: Meta::postgres("public", resource, 0, None),
        }
    }

    #[test]
    fn test_route_matches_resource_and_operation() {
        let router = Router::new(vec![
            stream("users", vec![Operation::Insert, Operation::Update], None),
            stream("orders", vec![Operation::Insert], None),
        ]);

        let event = insert_event("users", row(&[("id", Value::Int(1))]));
        let matched = router.route(&event);
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].name, "users-stream");
    }

    #[test]
    fn test_route_filters_unsubscribed_operation() {
        let router = Router::new(vec![stream("users", vec![Operation::Delete], None)]);

        let event = insert_event("users", row(&[("id", Value::Int(1))]));
        assert!(router.route(&event).is_empty());
    }

    #[test]
    fn test_route_no_match_for_other_resource() {
        let router = Router::new(vec![stream("users", vec![Operation::Insert], None)]);

        let event = insert_event("orders", row(&[("id", Value::Int(1))]));
        assert!(router.route(&event).is_empty());
    }

    #[test]
    fn test_routing_key_from_new_row() {
        let s = stream("users", vec![Operation::Insert], Some("id"));
        let event = insert_event("users", row(&[("id", Value::Int(1))]));
        assert_eq!(s.routing_key_for(&event), "1");
    }

    #[test]
    fn test_routing_key_same_for_update_and_delete_of_entity() {
        let s = stream(
            "users",
            vec![Operation::Update, Operation::Delete],
            Some("id"),
        );

        let update = ChangeEvent {
            op: Operation::Update,
            data: EventData::Diff {
                new: row(&[("id", Value::Int(1)), ("name", Value::Text("Bob".into()))]),
                old: row(&[("id", Value::Int(1)), ("name", Value::Text("Alice".into()))]),
            },
            meta: Meta::postgres("public", "users", 0, None),
        };
        let delete = ChangeEvent {
            op: Operation::Delete,
            data: EventData::Row(row(&[("id", Value::Int(1))])),
            meta: Meta::postgres("public", "users", 0, None),
        };

        assert_eq!(s.routing_key_for(&update), "1");
        assert_eq!(s.routing_key_for(&delete), "1");
    }

    #[test]
    fn test_routing_key_falls_back_to_resource() {
        // No key configured.
        let unkeyed = stream("users", vec![Operation::Insert], None);
        let event = insert_event("users", row(&[("id", Value::Int(1))]));
        assert_eq!(unkeyed.routing_key_for(&event), "users");

        // Configured column missing from the row.
        let missing = stream("users", vec![Operation::Insert], Some("uuid"));
        assert_eq!(missing.routing_key_for(&event), "users");

        // Configured column present but NULL.
        let nulled = stream("users", vec![Operation::Insert], Some("id"));
        let null_event = insert_event("users", row(&[("id", Value::Null)]));
        assert_eq!(nulled.routing_key_for(&null_event), "users");
    }

    #[test]
    fn test_routing_key_text_value_is_unquoted() {
        let s = stream("users", vec![Operation::Insert], Some("email"));
        let event = insert_event("users", row(&[("email", Value::Text("a@b.c".into()))]));
        assert_eq!(s.routing_key_for(&event), "a@b.c");
    }
}
