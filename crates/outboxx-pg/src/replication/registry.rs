//! Registry of relation metadata.
//!
//! PostgreSQL sends a Relation message before the first row operation on
//! each table in a replication session, and again whenever the table's
//! definition changes. The registry keeps the latest view so relation ids
//! in Insert/Update/Delete messages can be resolved.

use std::collections::HashMap;

use super::pgoutput::{ColumnInfo, RelationMessage, ReplicaIdentity};

/// Current metadata for one relation (table).
#[derive(Debug, Clone)]
pub struct RelationInfo {
    pub namespace: String,
    pub name: String,
    pub replica_identity: ReplicaIdentity,
    pub columns: Vec<ColumnInfo>,
}

impl From<&RelationMessage> for RelationInfo {
    fn from(msg: &RelationMessage) -> Self {
        Self {
            namespace: msg.namespace.clone(),
            name: msg.name.clone(),
            replica_identity: msg.replica_identity,
            columns: msg.columns.clone(),
        }
    }
}

/// relation_id → metadata, rebuilt from the stream after every (re)connect.
#[derive(Debug, Default)]
pub struct RelationRegistry {
    relations: HashMap<u32, RelationInfo>,
}

impl RelationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install or replace the entry for a relation id.
    pub fn register(&mut self, msg: &RelationMessage) {
        self.relations.insert(msg.relation_id, msg.into());
    }

    pub fn get(&self, relation_id: u32) -> Option<&RelationInfo> {
        self.relations.get(&relation_id)
    }

    /// Drop every entry; used on reset/reconnect.
    pub fn clear(&mut self) {
        self.relations.clear();
    }

    pub fn len(&self) -> usize {
        self.relations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relation_message(relation_id: u32, columns: &[&str]) -> RelationMessage {
        RelationMessage {
            relation_id,
            namespace: "public".to_string(),
            name: "users".to_string(),
            replica_identity: ReplicaIdentity::Default,
            columns: columns
                .iter()
                .enumerate()
                .map(|(i, name)| ColumnInfo {
                    flags: u8::from(i == 0),
                    name: name.to_string(),
                    type_oid: 25,
                    type_modifier: -1,
                })
                .collect(),
        }
    }

    #[test]
    fn test_register_and_get() {
        let mut registry = RelationRegistry::new();
        registry.register(&relation_message(16384, &["id", "name"]));

        let info = registry.get(16384).unwrap();
        assert_eq!(info.namespace, "public");
        assert_eq!(info.name, "users");
        assert_eq!(info.columns.len(), 2);
        assert_eq!(info.columns[0].name, "id");
    }

    #[test]
    fn test_get_miss() {
        let registry = RelationRegistry::new();
        assert!(registry.get(12345).is_none());
    }

    #[test]
    fn test_reregister_replaces_entry() {
        let mut registry = RelationRegistry::new();
        registry.register(&relation_message(16384, &["id", "name"]));
        registry.register(&relation_message(16384, &["id", "name", "email"]));

        assert_eq!(registry.len(), 1);
        let info = registry.get(16384).unwrap();
        assert_eq!(info.columns.len(), 3);
        assert_eq!(info.columns[2].name, "email");
    }

    #[test]
    fn test_clear() {
        let mut registry = RelationRegistry::new();
        registry.register(&relation_message(16384, &["id"]));
        assert_eq!(registry.len(), 1);

        registry.clear();
        assert!(registry.is_empty());
    }
}
