//! Projects export payloads onto feed table rows.
//!
//! The payload is stored as canonical JSON (object keys sorted at every
//! level) and hashed with SHA-256 after dropping the hash-excluded top-level
//! fields, so a payload that differs only in `updatedAt` keeps its hash.

use std::collections::BTreeMap;

use chrono::Utc;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::error::FeedIndexError;
use crate::metadata::FeedIndexMetadata;
use crate::types::{EntityId, ExportStatus, FeedRow};

/// Payload field flagging an entity the export processor considers deleted.
pub const DELETED_FIELD: &str = "deleted";

/// Turns export payloads into [`FeedRow`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct DataSerializer;

impl DataSerializer {
    pub fn new() -> Self {
        Self
    }

    pub fn serialize(
        &self,
        meta: &FeedIndexMetadata,
        payloads: Vec<Value>,
    ) -> Result<Vec<FeedRow>, FeedIndexError> {
        let now = Utc::now();
        payloads
            .into_iter()
            .map(|payload| {
                let source_id = source_id(meta, &payload)?;
                let mut identity = BTreeMap::new();
                for col in &meta.identity_columns {
                    let value = payload
                        .get(&col.payload_field)
                        .and_then(scalar_to_string)
                        .ok_or_else(|| missing_field(meta, &col.payload_field))?;
                    identity.insert(col.column.clone(), value);
                }
                let is_deleted = payload
                    .get(DELETED_FIELD)
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                Ok(FeedRow {
                    source_id,
                    identity,
                    feed_hash: feed_hash(meta, &payload)?,
                    feed_data: serde_json::to_string(&canonicalize(&payload))?,
                    is_deleted,
                    status: ExportStatus::Persisted.code(),
                    errors: None,
                    modified_at: now,
                })
            })
            .collect()
    }
}

/// Hex SHA-256 of the payload without its hash-excluded fields.
pub fn feed_hash(meta: &FeedIndexMetadata, payload: &Value) -> Result<String, FeedIndexError> {
    let mut hashed = canonicalize(payload);
    if let Value::Object(map) = &mut hashed {
        for field in meta.hash_excluded_fields() {
            map.remove(field);
        }
    }
    let bytes = serde_json::to_vec(&hashed)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// Rebuild `value` with object keys sorted at every depth.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::with_capacity(map.len());
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

fn source_id(meta: &FeedIndexMetadata, payload: &Value) -> Result<EntityId, FeedIndexError> {
    let field = payload
        .get(&meta.feed_identity)
        .ok_or_else(|| missing_field(meta, &meta.feed_identity))?;
    match field {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
    .ok_or_else(|| FeedIndexError::Export {
        feed: meta.feed_name.clone(),
        reason: format!("'{}' is not an integer id: {field}", meta.feed_identity),
    })
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn missing_field(meta: &FeedIndexMetadata, field: &str) -> FeedIndexError {
    FeedIndexError::Export {
        feed: meta.feed_name.clone(),
        reason: format!("payload is missing '{field}'"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::IdentityColumn;
    use serde_json::json;

    fn meta() -> FeedIndexMetadata {
        FeedIndexMetadata {
            identity_columns: vec![IdentityColumn::new("store_view_code", "storeViewCode")],
            exclude_from_hash_fields: vec!["lowStock".into()],
            ..Default::default()
        }
    }

    #[test]
    fn projects_identity_and_data() {
        let rows = DataSerializer::new()
            .serialize(
                &meta(),
                vec![json!({"productId": "42", "storeViewCode": "default", "sku": "A"})],
            )
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].source_id, 42);
        assert_eq!(rows[0].identity["store_view_code"], "default");
        assert!(!rows[0].is_deleted);
        assert_eq!(
            rows[0].feed_data,
            r#"{"productId":"42","sku":"A","storeViewCode":"default"}"#
        );
    }

    #[test]
    fn excluded_fields_do_not_change_hash() {
        let m = meta();
        let a = json!({"productId": 1, "storeViewCode": "default", "name": "x", "updatedAt": "2024-01-01", "lowStock": true});
        let b = json!({"productId": 1, "storeViewCode": "default", "name": "x", "updatedAt": "2025-06-30", "modifiedAt": "now", "lowStock": false});
        assert_eq!(feed_hash(&m, &a).unwrap(), feed_hash(&m, &b).unwrap());
    }

    #[test]
    fn other_fields_change_hash() {
        let m = meta();
        let a = json!({"productId": 1, "storeViewCode": "default", "name": "x"});
        let b = json!({"productId": 1, "storeViewCode": "default", "name": "y"});
        assert_ne!(feed_hash(&m, &a).unwrap(), feed_hash(&m, &b).unwrap());
    }

    #[test]
    fn hash_ignores_key_order() {
        let m = meta();
        let a: Value = serde_json::from_str(r#"{"productId":1,"attrs":{"b":2,"a":1}}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"attrs":{"a":1,"b":2},"productId":1}"#).unwrap();
        assert_eq!(feed_hash(&m, &a).unwrap(), feed_hash(&m, &b).unwrap());
    }

    #[test]
    fn deleted_flag_is_read_from_payload() {
        let rows = DataSerializer::new()
            .serialize(
                &meta(),
                vec![json!({"productId": 5, "storeViewCode": "us", "deleted": true})],
            )
            .unwrap();
        assert!(rows[0].is_deleted);
    }

    #[test]
    fn missing_identity_is_export_error() {
        let err = DataSerializer::new()
            .serialize(&meta(), vec![json!({"productId": 5})])
            .unwrap_err();
        assert!(matches!(err, FeedIndexError::Export { .. }));
    }
}
