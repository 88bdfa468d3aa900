//! Storage contract consumed by the feed pipeline.
//!
//! The pipeline never renders SQL itself. It describes what it needs with
//! small values ([`KeysetQuery`], [`FeedTable`], [`OrphanPredicate`]) and each
//! backend turns them into statements. The orphan predicate in particular is
//! built once and rendered by the backend into both its `SELECT` and its
//! `UPDATE` form, so the two strategies can never disagree on which rows are
//! orphaned.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::FeedIndexError;
use crate::metadata::{columns, FeedIndexMetadata};
use crate::types::{EntityId, ExportStatus, FeedRow, RowKey};

// ─── Query descriptions ───────────────────────────────────────────────────────

/// One keyset page: `WHERE field > after ORDER BY field LIMIT limit`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeysetQuery {
    pub table: String,
    pub field: String,
    pub after: Option<EntityId>,
    pub limit: usize,
    /// `(column, since)` window filter on the modification time.
    pub modified_window: Option<(String, DateTime<Utc>)>,
    /// Collapse duplicate ids (relation tables).
    pub distinct: bool,
}

/// Layout of a feed table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedTable {
    pub name: String,
    /// Column holding the source id.
    pub source_column: String,
    /// Extra natural-key columns.
    pub identity_columns: Vec<String>,
}

impl FeedTable {
    pub fn from_metadata(meta: &FeedIndexMetadata) -> Self {
        Self {
            name: meta.feed_table_name.clone(),
            source_column: meta.feed_table_field.clone(),
            identity_columns: meta
                .identity_columns
                .iter()
                .map(|c| c.column.clone())
                .collect(),
        }
    }

    /// Check the live table against the layout this feed expects.
    pub async fn verify(&self, conn: &dyn FeedConnection) -> Result<(), FeedIndexError> {
        let described = conn.describe_table(&self.name).await?;
        let missing: Vec<&str> = std::iter::once(self.source_column.as_str())
            .chain(self.identity_columns.iter().map(String::as_str))
            .chain(columns::ALL)
            .filter(|col| !described.iter().any(|d| d == col))
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(FeedIndexError::Config(format!(
                "feed table '{}' is missing columns: {}",
                self.name,
                missing.join(", ")
            )))
        }
    }
}

/// Stored hash state of a feed row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredHash {
    pub feed_hash: String,
    pub is_deleted: bool,
    /// Export status code of the last write.
    pub status: i32,
}

impl StoredHash {
    /// True when `row` would rewrite exactly what is stored and the stored
    /// version was not rejected by the export target.
    pub fn is_current(&self, row: &FeedRow) -> bool {
        self.feed_hash == row.feed_hash
            && self.is_deleted == row.is_deleted
            && self.status != ExportStatus::FAILED_CODE
    }
}

// ─── OrphanPredicate ──────────────────────────────────────────────────────────

/// Which feed rows a reconciliation pass looks at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrphanScope {
    /// Only rows for these source ids.
    Ids(Vec<EntityId>),
    /// Every row of the feed table.
    All,
}

/// Anti-join describing feed rows that no longer have a live source.
///
/// Only rows not already flagged `is_deleted` match, plus flagged rows whose
/// deletion the export target rejected (`status` 500), so the deletion is
/// sent again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrphanPredicate {
    /// Feed row whose source id has no row in the source table.
    MissingSource {
        feed_table: String,
        feed_field: String,
        source_table: String,
        source_field: String,
        scope: OrphanScope,
    },
    /// Variant row `(child, parent)` that no relation row links anymore.
    ///
    /// A row matches when the child entity is gone, or when no relation row
    /// for the child points at a parent whose current entity id, resolved
    /// through `entity_link_field`, equals the row's parent.
    DetachedVariant {
        feed_table: String,
        feed_child_field: String,
        feed_parent_field: String,
        relation_table: String,
        relation_child_field: String,
        relation_parent_field: String,
        entity_table: String,
        entity_id_field: String,
        entity_link_field: String,
        scope: OrphanScope,
    },
}

impl OrphanPredicate {
    /// Anti-join of the feed table against its source table.
    pub fn missing_source(meta: &FeedIndexMetadata, scope: OrphanScope) -> Self {
        Self::MissingSource {
            feed_table: meta.feed_table_name.clone(),
            feed_field: meta.feed_table_field.clone(),
            source_table: meta.source_table_name.clone(),
            source_field: meta.source_table_field.clone(),
            scope,
        }
    }

    pub fn feed_table(&self) -> &str {
        match self {
            Self::MissingSource { feed_table, .. } | Self::DetachedVariant { feed_table, .. } => {
                feed_table
            }
        }
    }

    /// Feed column holding the source id; pages of removed rows are keyed on it.
    pub fn feed_id_field(&self) -> &str {
        match self {
            Self::MissingSource { feed_field, .. } => feed_field,
            Self::DetachedVariant {
                feed_child_field, ..
            } => feed_child_field,
        }
    }

    pub fn scope(&self) -> &OrphanScope {
        match self {
            Self::MissingSource { scope, .. } | Self::DetachedVariant { scope, .. } => scope,
        }
    }

    /// `true` when the scope cannot match anything.
    pub fn is_empty(&self) -> bool {
        matches!(self.scope(), OrphanScope::Ids(ids) if ids.is_empty())
    }
}

// ─── FeedConnection ───────────────────────────────────────────────────────────

/// Relational store used by every feed component.
///
/// Implementations must support partial-column upsert keyed by the feed
/// table's natural key.
#[async_trait]
pub trait FeedConnection: Send + Sync {
    /// Run one keyset page.
    async fn select_ids_after(&self, query: &KeysetQuery) -> Result<Vec<EntityId>, FeedIndexError>;

    /// Run a registered, parameterized query with `ids` bound.
    async fn select_named(
        &self,
        query_name: &str,
        ids: &[EntityId],
    ) -> Result<Vec<EntityId>, FeedIndexError>;

    /// Insert rows; on natural-key conflict rewrite only `update_columns`.
    async fn insert_on_duplicate(
        &self,
        table: &FeedTable,
        rows: &[FeedRow],
        update_columns: &[String],
    ) -> Result<u64, FeedIndexError>;

    /// Plain bulk insert. Conflicts are errors.
    async fn insert_array(&self, table: &FeedTable, rows: &[FeedRow]) -> Result<u64, FeedIndexError>;

    async fn truncate_table(&self, table: &FeedTable) -> Result<(), FeedIndexError>;

    /// Column names of `table`; empty when the table does not exist.
    async fn describe_table(&self, table: &str) -> Result<Vec<String>, FeedIndexError>;

    /// Subset of `keys` already present in the feed table.
    async fn existing_keys(
        &self,
        table: &FeedTable,
        keys: &[RowKey],
    ) -> Result<HashSet<RowKey>, FeedIndexError>;

    /// Stored hashes of every row for the given source ids.
    async fn fetch_hashes(
        &self,
        table: &FeedTable,
        source_ids: &[EntityId],
    ) -> Result<HashMap<RowKey, StoredHash>, FeedIndexError>;

    /// `UPDATE … SET is_deleted = 1, status = 0, errors = NULL,
    /// modified_at = at WHERE <predicate>`.
    async fn mark_removed(
        &self,
        predicate: &OrphanPredicate,
        at: DateTime<Utc>,
    ) -> Result<u64, FeedIndexError>;

    /// `SELECT … WHERE <predicate>`: every matching row for the first `limit`
    /// distinct source ids greater than `after`, ordered by source id.
    async fn select_removed(
        &self,
        predicate: &OrphanPredicate,
        after: Option<EntityId>,
        limit: usize,
    ) -> Result<Vec<FeedRow>, FeedIndexError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::IdentityColumn;

    #[test]
    fn feed_table_from_metadata() {
        let meta = FeedIndexMetadata {
            identity_columns: vec![IdentityColumn::new("store_view_code", "storeViewCode")],
            ..Default::default()
        };
        let table = FeedTable::from_metadata(&meta);
        assert_eq!(table.source_column, "source_entity_id");
        assert_eq!(table.identity_columns, vec!["store_view_code"]);
    }

    #[test]
    fn empty_scope_predicate() {
        let meta = FeedIndexMetadata::default();
        let empty = OrphanPredicate::missing_source(&meta, OrphanScope::Ids(vec![]));
        assert!(empty.is_empty());
        let all = OrphanPredicate::missing_source(&meta, OrphanScope::All);
        assert!(!all.is_empty());
        assert_eq!(all.feed_id_field(), "source_entity_id");
        assert_eq!(all.feed_table(), meta.feed_table_name);
    }
}
