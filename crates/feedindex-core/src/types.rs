//! Shared types for the feed pipeline.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Natural key of a source entity.
pub type EntityId = i64;

/// One page of ids, ordered and bounded by the feed's batch size.
pub type IdBatch = Vec<EntityId>;

// ─── RowKey ───────────────────────────────────────────────────────────────────

/// Natural key of a feed row: the source id plus the extra identity columns.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RowKey {
    pub source_id: EntityId,
    pub identity: BTreeMap<String, String>,
}

impl RowKey {
    pub fn new(source_id: EntityId) -> Self {
        Self {
            source_id,
            identity: BTreeMap::new(),
        }
    }

    pub fn with(mut self, column: impl Into<String>, value: impl Into<String>) -> Self {
        self.identity.insert(column.into(), value.into());
        self
    }
}

impl std::fmt::Display for RowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.source_id)?;
        for (col, value) in &self.identity {
            write!(f, ":{col}={value}")?;
        }
        Ok(())
    }
}

// ─── FeedRow ──────────────────────────────────────────────────────────────────

/// A serialized feed row as stored in the feed table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedRow {
    pub source_id: EntityId,
    /// Extra identity column values, keyed by column name.
    pub identity: BTreeMap<String, String>,
    /// Canonical JSON of the payload.
    pub feed_data: String,
    /// Hex SHA-256 of the payload minus hash-excluded fields.
    pub feed_hash: String,
    pub is_deleted: bool,
    /// Export status code (see [`ExportStatus::code`]).
    pub status: i32,
    pub errors: Option<String>,
    pub modified_at: DateTime<Utc>,
}

impl FeedRow {
    pub fn key(&self) -> RowKey {
        RowKey {
            source_id: self.source_id,
            identity: self.identity.clone(),
        }
    }
}

// ─── ExportStatus ─────────────────────────────────────────────────────────────

/// Outcome of handing a batch of rows to the export target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExportStatus {
    /// Rows were not sent; nothing must be persisted for them.
    Skipped,
    /// Rows were persisted locally without a remote target.
    Persisted,
    /// Remote target accepted the rows.
    Exported,
    /// Remote target rejected the rows; retry on the next run.
    Failed { reason: String },
}

impl ExportStatus {
    /// `status` of a row whose last export was rejected.
    pub const FAILED_CODE: i32 = 500;

    /// Value stored in the feed table's `status` column.
    pub fn code(&self) -> i32 {
        match self {
            Self::Skipped => -1,
            Self::Persisted => 0,
            Self::Exported => 200,
            Self::Failed { .. } => Self::FAILED_CODE,
        }
    }

    /// Value stored in the feed table's `errors` column.
    pub fn errors(&self) -> Option<String> {
        match self {
            Self::Failed { reason } => Some(reason.clone()),
            _ => None,
        }
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped)
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_key_orders_by_source_id_first() {
        let a = RowKey::new(1).with("store_view_code", "z");
        let b = RowKey::new(2).with("store_view_code", "a");
        assert!(a < b);
    }

    #[test]
    fn row_key_display() {
        let key = RowKey::new(7).with("store_view_code", "default");
        assert_eq!(key.to_string(), "7:store_view_code=default");
    }

    #[test]
    fn export_status_columns() {
        let failed = ExportStatus::Failed {
            reason: "503".into(),
        };
        assert_eq!(failed.code(), 500);
        assert_eq!(failed.errors().as_deref(), Some("503"));
        assert!(ExportStatus::Exported.errors().is_none());
        assert!(ExportStatus::Skipped.is_skipped());
    }
}
