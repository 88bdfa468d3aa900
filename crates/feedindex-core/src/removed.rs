//! Orphan reconciliation: flag feed rows whose source is gone.
//!
//! Two strategies share one [`OrphanPredicate`] value. [`MarkRemovedEntities`]
//! flips `is_deleted` in place. [`DeletedEntitiesProvider`] pages the same
//! rows out so they can be exported as deletions before being persisted.
//! Neither ever removes a row or touches its `feed_data`.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};

use crate::connection::{FeedConnection, OrphanPredicate, OrphanScope};
use crate::error::FeedIndexError;
use crate::metadata::FeedIndexMetadata;
use crate::types::{EntityId, FeedRow};
use crate::variant::VariantRelation;

/// How a feed decides that a row lost its source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciliation {
    /// Source id missing from `source_table_name`.
    MissingSource,
    /// Variant detached from its parent, or the variant entity itself gone.
    DetachedVariant(VariantRelation),
}

impl Reconciliation {
    pub fn predicate(&self, meta: &FeedIndexMetadata, scope: OrphanScope) -> OrphanPredicate {
        match self {
            Self::MissingSource => OrphanPredicate::missing_source(meta, scope),
            Self::DetachedVariant(relation) => relation.predicate(meta, scope),
        }
    }
}

// ─── MarkRemovedEntities ──────────────────────────────────────────────────────

/// Flags orphans with a single `UPDATE`.
#[derive(Clone)]
pub struct MarkRemovedEntities {
    conn: Arc<dyn FeedConnection>,
}

impl MarkRemovedEntities {
    pub fn new(conn: Arc<dyn FeedConnection>) -> Self {
        Self { conn }
    }

    /// Returns the number of rows flagged.
    pub async fn execute(&self, predicate: &OrphanPredicate) -> Result<u64, FeedIndexError> {
        if predicate.is_empty() {
            return Ok(0);
        }
        let flagged = self.conn.mark_removed(predicate, Utc::now()).await?;
        if flagged > 0 {
            info!(table = predicate.feed_table(), flagged, "feed rows marked as deleted");
        }
        Ok(flagged)
    }
}

// ─── DeletedEntitiesProvider ──────────────────────────────────────────────────

/// Pages orphan rows out of the feed table.
#[derive(Clone)]
pub struct DeletedEntitiesProvider {
    conn: Arc<dyn FeedConnection>,
}

impl DeletedEntitiesProvider {
    pub fn new(conn: Arc<dyn FeedConnection>) -> Self {
        Self { conn }
    }

    /// Orphan rows in batches of at most `batch_size` source ids. Rows whose
    /// stored hash is in `processed` were already handled this run and are
    /// skipped.
    pub fn removed(
        &self,
        predicate: OrphanPredicate,
        batch_size: usize,
        processed: HashSet<String>,
    ) -> RemovedBatches {
        RemovedBatches {
            conn: self.conn.clone(),
            predicate,
            batch_size: batch_size.max(1),
            processed,
            after: None,
            exhausted: false,
        }
    }
}

/// Lazy pages of orphan rows, each flagged `is_deleted` and stamped now.
pub struct RemovedBatches {
    conn: Arc<dyn FeedConnection>,
    predicate: OrphanPredicate,
    batch_size: usize,
    processed: HashSet<String>,
    after: Option<EntityId>,
    exhausted: bool,
}

impl RemovedBatches {
    pub async fn next_batch(&mut self) -> Result<Option<Vec<FeedRow>>, FeedIndexError> {
        if self.predicate.is_empty() {
            self.exhausted = true;
        }
        while !self.exhausted {
            let page = self
                .conn
                .select_removed(&self.predicate, self.after, self.batch_size)
                .await?;
            let Some(last) = page.iter().map(|r| r.source_id).max() else {
                self.exhausted = true;
                break;
            };
            self.after = Some(last);

            let total = page.len();
            let now = Utc::now();
            let rows: Vec<FeedRow> = page
                .into_iter()
                .filter(|r| !self.processed.contains(&r.feed_hash))
                .map(|mut r| {
                    r.is_deleted = true;
                    r.modified_at = now;
                    r
                })
                .collect();
            debug!(
                table = self.predicate.feed_table(),
                total,
                skipped = total - rows.len(),
                "removed rows page"
            );
            if !rows.is_empty() {
                return Ok(Some(rows));
            }
        }
        Ok(None)
    }
}
