//! Full and partial reindex orchestration.
//!
//! ```text
//! ids ─► affected ids ─► ExportProcessor ─► DataSerializer ─┬─► upsert (mutable columns)
//!                                                          └─► hash check ─► IndexStateProvider
//!                                                                 ─► FeedSender ─► FeedUpdater
//! ```
//!
//! The lower branch is taken when the feed sets `export_immediately`.
//! Storage and export errors are not caught here: the caller owns retry and
//! logging policy.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::connection::{FeedConnection, FeedTable, OrphanScope};
use crate::error::FeedIndexError;
use crate::export::{id_arguments, ExportProcessor, FeedSender};
use crate::ids::EntityIdsProvider;
use crate::metadata::FeedIndexMetadata;
use crate::removed::{DeletedEntitiesProvider, MarkRemovedEntities, Reconciliation};
use crate::serializer::DataSerializer;
use crate::state::IndexStateProvider;
use crate::types::{EntityId, ExportStatus, FeedRow};
use crate::updater::{FeedUpdater, UpdateOutcome, UpdateRetryPolicy};

/// Counters for one reindex call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReindexStats {
    /// Ids after affected-id expansion.
    pub ids: usize,
    /// Rows written (or handed to the updater).
    pub rows_written: usize,
    /// Rows skipped because their stored hash was unchanged.
    pub rows_unchanged: usize,
    /// Rows flagged as deleted by reconciliation.
    pub rows_removed: u64,
    /// Batches the updater gave up on.
    pub failed_batches: usize,
}

impl ReindexStats {
    fn merge(&mut self, other: ReindexStats) {
        self.ids += other.ids;
        self.rows_written += other.rows_written;
        self.rows_unchanged += other.rows_unchanged;
        self.rows_removed += other.rows_removed;
        self.failed_batches += other.failed_batches;
    }
}

/// Reindex strategy of a feed.
#[async_trait]
pub trait FeedIndexProcessor: Send + Sync {
    /// Rebuild the whole feed from the source table.
    async fn full_reindex(
        &self,
        meta: &FeedIndexMetadata,
        ids: &EntityIdsProvider,
    ) -> Result<ReindexStats, FeedIndexError>;

    /// Rebuild the rows of `ids` and of every id they affect.
    async fn partial_reindex(
        &self,
        meta: &FeedIndexMetadata,
        ids: &EntityIdsProvider,
        entity_ids: &[EntityId],
    ) -> Result<ReindexStats, FeedIndexError>;
}

// ─── CreateUpdateProcessor ────────────────────────────────────────────────────

/// Creates and updates feed rows; never flags deletions.
pub struct CreateUpdateProcessor {
    conn: Arc<dyn FeedConnection>,
    exporter: Arc<dyn ExportProcessor>,
    serializer: DataSerializer,
    sender: Option<Arc<dyn FeedSender>>,
    updater: FeedUpdater,
}

impl CreateUpdateProcessor {
    pub fn new(conn: Arc<dyn FeedConnection>, exporter: Arc<dyn ExportProcessor>) -> Self {
        Self {
            updater: FeedUpdater::new(conn.clone()),
            conn,
            exporter,
            serializer: DataSerializer::new(),
            sender: None,
        }
    }

    /// Remote target used in export-immediately mode.
    pub fn with_sender(mut self, sender: Arc<dyn FeedSender>) -> Self {
        self.sender = Some(sender);
        self
    }

    pub fn with_retry(mut self, retry: UpdateRetryPolicy) -> Self {
        self.updater = self.updater.with_retry(retry);
        self
    }

    pub(crate) fn connection(&self) -> Arc<dyn FeedConnection> {
        self.conn.clone()
    }

    /// Reindex `entity_ids`; returns the stats and the expanded id list.
    pub(crate) async fn reindex_ids(
        &self,
        meta: &FeedIndexMetadata,
        ids: &EntityIdsProvider,
        entity_ids: &[EntityId],
        state: &mut IndexStateProvider,
    ) -> Result<(ReindexStats, Vec<EntityId>), FeedIndexError> {
        let expanded = ids.affected_ids(entity_ids).await?;
        let mut stats = ReindexStats {
            ids: expanded.len(),
            ..Default::default()
        };
        if expanded.is_empty() {
            return Ok((stats, expanded));
        }
        let table = FeedTable::from_metadata(meta);

        for chunk in expanded.chunks(meta.batch_size.max(1)) {
            let payloads = self
                .exporter
                .process(&meta.feed_name, &id_arguments(meta, chunk))
                .await?;
            let rows = self.serializer.serialize(meta, payloads)?;
            debug!(feed = %meta.feed_name, ids = chunk.len(), rows = rows.len(), "payloads serialized");

            if meta.export_immediately {
                let changed = self.suppress_unchanged(&table, rows, &mut stats).await?;
                state.push(changed);
                while state.is_batch_full() {
                    if let Some(batch) = state.take_batch() {
                        self.flush(meta, batch, &mut stats).await;
                    }
                }
            } else {
                for part in rows.chunks(meta.batch_size.max(1)) {
                    self.conn
                        .insert_on_duplicate(&table, part, &meta.feed_table_mutable_columns)
                        .await?;
                    stats.rows_written += part.len();
                }
            }
        }

        while let Some(batch) = state.take_batch() {
            self.flush(meta, batch, &mut stats).await;
        }
        Ok((stats, expanded))
    }

    /// Drop rows already stored as-is, unless their last export failed.
    async fn suppress_unchanged(
        &self,
        table: &FeedTable,
        rows: Vec<FeedRow>,
        stats: &mut ReindexStats,
    ) -> Result<Vec<FeedRow>, FeedIndexError> {
        let mut source_ids: Vec<EntityId> = rows.iter().map(|r| r.source_id).collect();
        source_ids.sort_unstable();
        source_ids.dedup();
        let stored = self.conn.fetch_hashes(table, &source_ids).await?;

        let before = rows.len();
        let changed: Vec<FeedRow> = rows
            .into_iter()
            .filter(|row| {
                stored.get(&row.key()).map_or(true, |s| !s.is_current(row))
            })
            .collect();
        stats.rows_unchanged += before - changed.len();
        Ok(changed)
    }

    /// Ship one batch and persist it with the resulting status.
    pub(crate) async fn flush(
        &self,
        meta: &FeedIndexMetadata,
        batch: Vec<FeedRow>,
        stats: &mut ReindexStats,
    ) -> UpdateOutcome {
        let status = match &self.sender {
            Some(sender) => sender.send(meta, &batch).await,
            None => ExportStatus::Persisted,
        };
        let len = batch.len();
        let outcome = self.updater.execute(batch, &status, meta).await;
        match outcome {
            UpdateOutcome::Written { .. } => stats.rows_written += len,
            UpdateOutcome::Failed { .. } => stats.failed_batches += 1,
            UpdateOutcome::Skipped => {}
        }
        outcome
    }

    /// Optional truncate, then every source id batch through `processor`.
    async fn full_scan(
        &self,
        meta: &FeedIndexMetadata,
        ids: &EntityIdsProvider,
        processor: &dyn FeedIndexProcessor,
    ) -> Result<ReindexStats, FeedIndexError> {
        if meta.truncate_on_full_reindex {
            self.conn.truncate_table(&FeedTable::from_metadata(meta)).await?;
            info!(feed = %meta.feed_name, "feed table truncated");
        }
        let mut stats = ReindexStats::default();
        let mut batches = ids.all_ids(meta);
        let mut batch_no = 0usize;
        while let Some(batch) = batches.next_batch().await? {
            batch_no += 1;
            stats.merge(processor.partial_reindex(meta, ids, &batch).await?);
            info!(
                feed = %meta.feed_name,
                batch = batch_no,
                ids = batch.len(),
                rows = stats.rows_written,
                "full reindex progress"
            );
        }
        Ok(stats)
    }
}

#[async_trait]
impl FeedIndexProcessor for CreateUpdateProcessor {
    async fn full_reindex(
        &self,
        meta: &FeedIndexMetadata,
        ids: &EntityIdsProvider,
    ) -> Result<ReindexStats, FeedIndexError> {
        self.full_scan(meta, ids, self).await
    }

    async fn partial_reindex(
        &self,
        meta: &FeedIndexMetadata,
        ids: &EntityIdsProvider,
        entity_ids: &[EntityId],
    ) -> Result<ReindexStats, FeedIndexError> {
        let mut state = IndexStateProvider::new(meta.batch_size);
        let (stats, _) = self.reindex_ids(meta, ids, entity_ids, &mut state).await?;
        Ok(stats)
    }
}

// ─── CreateUpdateDeleteProcessor ──────────────────────────────────────────────

/// Create/update followed by orphan reconciliation on the same ids.
pub struct CreateUpdateDeleteProcessor {
    inner: CreateUpdateProcessor,
    reconciliation: Reconciliation,
    marker: MarkRemovedEntities,
    deleted: DeletedEntitiesProvider,
}

impl CreateUpdateDeleteProcessor {
    pub fn new(inner: CreateUpdateProcessor, reconciliation: Reconciliation) -> Self {
        let conn = inner.connection();
        Self {
            marker: MarkRemovedEntities::new(conn.clone()),
            deleted: DeletedEntitiesProvider::new(conn),
            inner,
            reconciliation,
        }
    }

    async fn reconcile(
        &self,
        meta: &FeedIndexMetadata,
        scope: OrphanScope,
        state: &IndexStateProvider,
        stats: &mut ReindexStats,
    ) -> Result<(), FeedIndexError> {
        let predicate = self.reconciliation.predicate(meta, scope);
        if !meta.export_immediately {
            stats.rows_removed += self.marker.execute(&predicate).await?;
            return Ok(());
        }
        let mut batches =
            self.deleted
                .removed(predicate, meta.batch_size, state.processed_hashes().clone());
        while let Some(batch) = batches.next_batch().await? {
            let len = batch.len() as u64;
            if let UpdateOutcome::Written { .. } = self.inner.flush(meta, batch, stats).await {
                stats.rows_removed += len;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl FeedIndexProcessor for CreateUpdateDeleteProcessor {
    async fn full_reindex(
        &self,
        meta: &FeedIndexMetadata,
        ids: &EntityIdsProvider,
    ) -> Result<ReindexStats, FeedIndexError> {
        let mut stats = self.inner.full_scan(meta, ids, self).await?;
        // Rows whose source vanished before the scan never show up in a batch.
        if !meta.truncate_on_full_reindex {
            let state = IndexStateProvider::new(meta.batch_size);
            self.reconcile(meta, OrphanScope::All, &state, &mut stats).await?;
        }
        Ok(stats)
    }

    async fn partial_reindex(
        &self,
        meta: &FeedIndexMetadata,
        ids: &EntityIdsProvider,
        entity_ids: &[EntityId],
    ) -> Result<ReindexStats, FeedIndexError> {
        let mut state = IndexStateProvider::new(meta.batch_size);
        let (mut stats, expanded) = self
            .inner
            .reindex_ids(meta, ids, entity_ids, &mut state)
            .await?;
        self.reconcile(meta, OrphanScope::Ids(expanded), &state, &mut stats)
            .await?;
        Ok(stats)
    }
}
