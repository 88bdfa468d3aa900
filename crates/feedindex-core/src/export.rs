//! Collaborators that build and ship payloads.
//!
//! All catalog business rules live behind [`ExportProcessor`]: given id
//! argument rows it returns the full payload of every entity to export.

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::FeedIndexError;
use crate::metadata::FeedIndexMetadata;
use crate::types::{EntityId, ExportStatus, FeedRow};

/// Builds feed payloads for a set of ids.
#[async_trait]
pub trait ExportProcessor: Send + Sync {
    /// `arguments` holds one object per id, e.g. `{"productId": 42}`.
    async fn process(&self, feed_name: &str, arguments: &[Value]) -> Result<Vec<Value>, FeedIndexError>;
}

/// Remote target rows are shipped to in export-immediately mode.
#[async_trait]
pub trait FeedSender: Send + Sync {
    async fn send(&self, meta: &FeedIndexMetadata, rows: &[FeedRow]) -> ExportStatus;
}

/// One argument row per id, keyed by the feed's identity field.
pub fn id_arguments(meta: &FeedIndexMetadata, ids: &[EntityId]) -> Vec<Value> {
    ids.iter()
        .map(|id| {
            let mut row = Map::new();
            row.insert(meta.feed_identity.clone(), Value::from(*id));
            Value::Object(row)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn arguments_use_feed_identity() {
        let meta = FeedIndexMetadata {
            feed_identity: "productId".into(),
            ..Default::default()
        };
        let args = id_arguments(&meta, &[1, 2]);
        assert_eq!(args, vec![json!({"productId": 1}), json!({"productId": 2})]);
    }
}
