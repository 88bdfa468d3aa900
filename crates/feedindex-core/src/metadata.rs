//! Per-feed configuration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::FeedIndexError;

/// Payload fields that never contribute to `feed_hash`.
pub const DEFAULT_HASH_EXCLUDED_FIELDS: [&str; 2] = ["modifiedAt", "updatedAt"];

/// Column names shared by every feed table.
pub mod columns {
    pub const FEED_DATA: &str = "feed_data";
    pub const IS_DELETED: &str = "is_deleted";
    pub const FEED_HASH: &str = "feed_hash";
    pub const STATUS: &str = "status";
    pub const ERRORS: &str = "errors";
    pub const MODIFIED_AT: &str = "modified_at";

    /// All non-identity columns, in storage order.
    pub const ALL: [&str; 6] = [FEED_DATA, IS_DELETED, FEED_HASH, STATUS, ERRORS, MODIFIED_AT];
}

/// An extra natural-key column of a feed table, filled from a payload field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityColumn {
    /// Column name in the feed table (e.g. `"store_view_code"`).
    pub column: String,
    /// Payload field the value is read from (e.g. `"storeViewCode"`).
    pub payload_field: String,
}

impl IdentityColumn {
    pub fn new(column: impl Into<String>, payload_field: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            payload_field: payload_field.into(),
        }
    }
}

/// Static configuration for one feed.
///
/// Created once at startup and shared by every component that touches the
/// feed. `modified_since` is the only field meant to change after startup: it
/// narrows `all_ids` to source rows modified inside the window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedIndexMetadata {
    /// Unique feed name, also the key handed to the export processor.
    pub feed_name: String,
    /// Payload field carrying the source entity id (e.g. `"productId"`).
    pub feed_identity: String,
    /// Live source table scanned by full reindex and the orphan anti-join.
    pub source_table_name: String,
    /// Id column of the source table.
    pub source_table_field: String,
    /// Optional modification-time column of the source table.
    #[serde(default)]
    pub source_modified_field: Option<String>,
    /// Feed table name.
    pub feed_table_name: String,
    /// Feed table column holding the source id.
    pub feed_table_field: String,
    /// Extra natural-key columns besides `feed_table_field`.
    #[serde(default)]
    pub identity_columns: Vec<IdentityColumn>,
    /// Columns rewritten when a row already exists.
    #[serde(default = "default_mutable_columns")]
    pub feed_table_mutable_columns: Vec<String>,
    /// Ids per batch, and rows per write.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Upper bound on materializer workers for this feed.
    #[serde(default = "default_thread_count")]
    pub thread_count: usize,
    /// Payload fields excluded from the hash on top of the defaults.
    #[serde(default)]
    pub exclude_from_hash_fields: Vec<String>,
    /// Names of affected-id resolvers, applied in order.
    #[serde(default)]
    pub affected_id_resolvers: Vec<String>,
    /// Truncate the feed table before a full reindex.
    #[serde(default)]
    pub truncate_on_full_reindex: bool,
    /// Stream rows through the state provider and `FeedUpdater` instead of
    /// writing each chunk straight away.
    #[serde(default)]
    pub export_immediately: bool,
    /// Reindex window cursor.
    #[serde(default)]
    pub modified_since: Option<DateTime<Utc>>,
}

fn default_mutable_columns() -> Vec<String> {
    columns::ALL.iter().map(|c| c.to_string()).collect()
}

fn default_batch_size() -> usize {
    100
}

fn default_thread_count() -> usize {
    1
}

impl Default for FeedIndexMetadata {
    fn default() -> Self {
        Self {
            feed_name: "products".into(),
            feed_identity: "productId".into(),
            source_table_name: "catalog_product_entity".into(),
            source_table_field: "entity_id".into(),
            source_modified_field: None,
            feed_table_name: "catalog_data_exporter_products".into(),
            feed_table_field: "source_entity_id".into(),
            identity_columns: Vec::new(),
            feed_table_mutable_columns: default_mutable_columns(),
            batch_size: default_batch_size(),
            thread_count: default_thread_count(),
            exclude_from_hash_fields: Vec::new(),
            affected_id_resolvers: Vec::new(),
            truncate_on_full_reindex: false,
            export_immediately: false,
            modified_since: None,
        }
    }
}

impl FeedIndexMetadata {
    /// Every payload field excluded from `feed_hash`.
    pub fn hash_excluded_fields(&self) -> impl Iterator<Item = &str> {
        DEFAULT_HASH_EXCLUDED_FIELDS
            .iter()
            .copied()
            .chain(self.exclude_from_hash_fields.iter().map(String::as_str))
    }

    /// Identity column names, `feed_table_field` first.
    pub fn key_columns(&self) -> Vec<&str> {
        std::iter::once(self.feed_table_field.as_str())
            .chain(self.identity_columns.iter().map(|c| c.column.as_str()))
            .collect()
    }

    /// Narrow subsequent `all_ids` scans to rows modified at or after `since`.
    pub fn set_modified_since(&mut self, since: Option<DateTime<Utc>>) {
        self.modified_since = since;
    }

    /// Startup checks. Every problem here is a configuration error.
    pub fn validate(&self) -> Result<(), FeedIndexError> {
        let required = [
            ("feed_name", &self.feed_name),
            ("feed_identity", &self.feed_identity),
            ("source_table_name", &self.source_table_name),
            ("source_table_field", &self.source_table_field),
            ("feed_table_name", &self.feed_table_name),
            ("feed_table_field", &self.feed_table_field),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(FeedIndexError::Config(format!(
                    "feed '{}': {name} must not be empty",
                    self.feed_name
                )));
            }
        }
        if self.batch_size == 0 {
            return Err(FeedIndexError::Config(format!(
                "feed '{}': batch_size must be > 0",
                self.feed_name
            )));
        }
        if self.thread_count == 0 {
            return Err(FeedIndexError::Config(format!(
                "feed '{}': thread_count must be > 0",
                self.feed_name
            )));
        }
        let keys = self.key_columns();
        if let Some(col) = self
            .feed_table_mutable_columns
            .iter()
            .find(|c| keys.contains(&c.as_str()))
        {
            return Err(FeedIndexError::Config(format!(
                "feed '{}': identity column '{col}' cannot be mutable",
                self.feed_name
            )));
        }
        if let Some(col) = self
            .feed_table_mutable_columns
            .iter()
            .find(|c| !columns::ALL.contains(&c.as_str()))
        {
            return Err(FeedIndexError::Config(format!(
                "feed '{}': unknown mutable column '{col}'",
                self.feed_name
            )));
        }
        Ok(())
    }
}
