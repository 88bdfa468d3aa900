//! Entry points of a feed: full, list, row and changelog-driven reindex.

use std::sync::{Arc, RwLock};
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::info;

use crate::connection::FeedConnection;
use crate::error::FeedIndexError;
use crate::export::ExportProcessor;
use crate::ids::EntityIdsProvider;
use crate::materializer::ViewAction;
use crate::metadata::FeedIndexMetadata;
use crate::processor::{
    CreateUpdateDeleteProcessor, CreateUpdateProcessor, FeedIndexProcessor, ReindexStats,
};
use crate::removed::Reconciliation;
use crate::resolver::ResolverRegistry;
use crate::types::EntityId;

/// One feed wired to its id provider and reindex strategy.
///
/// Each call works on a snapshot of the metadata taken when it starts, so
/// [`set_modified_since`](Self::set_modified_since) only affects later calls.
pub struct FeedIndexer {
    meta: RwLock<FeedIndexMetadata>,
    ids: EntityIdsProvider,
    processor: Arc<dyn FeedIndexProcessor>,
}

impl FeedIndexer {
    /// Fails on invalid metadata.
    pub fn new(
        meta: FeedIndexMetadata,
        ids: EntityIdsProvider,
        processor: Arc<dyn FeedIndexProcessor>,
    ) -> Result<Self, FeedIndexError> {
        meta.validate()?;
        Ok(Self {
            meta: RwLock::new(meta),
            ids,
            processor,
        })
    }

    /// Feed that creates and updates rows but never flags deletions.
    pub fn create_update(
        meta: FeedIndexMetadata,
        conn: Arc<dyn FeedConnection>,
        registry: &ResolverRegistry,
        exporter: Arc<dyn ExportProcessor>,
    ) -> Result<Self, FeedIndexError> {
        let ids = EntityIdsProvider::new(conn.clone(), &meta, registry)?;
        let processor = CreateUpdateProcessor::new(conn, exporter);
        Self::new(meta, ids, Arc::new(processor))
    }

    /// Feed that also soft-deletes rows whose source row is gone.
    pub fn create_update_delete(
        meta: FeedIndexMetadata,
        conn: Arc<dyn FeedConnection>,
        registry: &ResolverRegistry,
        exporter: Arc<dyn ExportProcessor>,
    ) -> Result<Self, FeedIndexError> {
        let ids = EntityIdsProvider::new(conn.clone(), &meta, registry)?;
        let processor = CreateUpdateDeleteProcessor::new(
            CreateUpdateProcessor::new(conn, exporter),
            Reconciliation::MissingSource,
        );
        Self::new(meta, ids, Arc::new(processor))
    }

    /// Snapshot of the current metadata.
    pub fn metadata(&self) -> FeedIndexMetadata {
        self.meta
            .read()
            .map(|m| m.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }

    pub fn feed_name(&self) -> String {
        self.metadata().feed_name
    }

    /// Restrict later full reindexes to source rows modified since `since`.
    pub fn set_modified_since(&self, since: Option<DateTime<Utc>>) {
        let mut meta = self.meta.write().unwrap_or_else(|e| e.into_inner());
        meta.set_modified_since(since);
    }

    /// Rebuild the whole feed.
    pub async fn execute_full(&self) -> Result<ReindexStats, FeedIndexError> {
        let meta = self.metadata();
        let started = Instant::now();
        info!(feed = %meta.feed_name, since = ?meta.modified_since, "full reindex started");
        let stats = self.processor.full_reindex(&meta, &self.ids).await?;
        info!(
            feed = %meta.feed_name,
            ids = stats.ids,
            written = stats.rows_written,
            unchanged = stats.rows_unchanged,
            removed = stats.rows_removed,
            failed_batches = stats.failed_batches,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "full reindex finished"
        );
        Ok(stats)
    }

    /// Reindex the given ids and everything they affect.
    pub async fn execute_list(&self, ids: &[EntityId]) -> Result<ReindexStats, FeedIndexError> {
        let meta = self.metadata();
        let stats = self.processor.partial_reindex(&meta, &self.ids, ids).await?;
        info!(
            feed = %meta.feed_name,
            requested = ids.len(),
            ids = stats.ids,
            written = stats.rows_written,
            removed = stats.rows_removed,
            "partial reindex finished"
        );
        Ok(stats)
    }

    pub async fn execute_row(&self, id: EntityId) -> Result<ReindexStats, FeedIndexError> {
        self.execute_list(&[id]).await
    }

    /// Changelog entry point.
    pub async fn execute(&self, ids: &[EntityId]) -> Result<ReindexStats, FeedIndexError> {
        self.execute_list(ids).await
    }
}

#[async_trait]
impl ViewAction for FeedIndexer {
    fn metadata(&self) -> FeedIndexMetadata {
        FeedIndexer::metadata(self)
    }

    async fn execute(&self, ids: &[EntityId]) -> Result<(), FeedIndexError> {
        FeedIndexer::execute(self, ids).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryConnection;
    use crate::types::RowKey;
    use serde_json::{json, Value};

    struct EchoExporter;

    #[async_trait]
    impl ExportProcessor for EchoExporter {
        async fn process(&self, _feed: &str, arguments: &[Value]) -> Result<Vec<Value>, FeedIndexError> {
            Ok(arguments
                .iter()
                .map(|a| json!({"productId": a["productId"], "sku": format!("SKU-{}", a["productId"])}))
                .collect())
        }
    }

    fn meta() -> FeedIndexMetadata {
        FeedIndexMetadata {
            source_table_name: "src".into(),
            batch_size: 2,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn invalid_metadata_is_rejected() {
        let conn = Arc::new(MemoryConnection::new());
        let bad = FeedIndexMetadata {
            batch_size: 0,
            ..meta()
        };
        let result = FeedIndexer::create_update(bad, conn, &ResolverRegistry::new(), Arc::new(EchoExporter));
        assert!(result.err().unwrap().is_config());
    }

    #[tokio::test]
    async fn unknown_resolver_is_rejected_at_construction() {
        let conn = Arc::new(MemoryConnection::new());
        let m = FeedIndexMetadata {
            affected_id_resolvers: vec!["parents".into()],
            ..meta()
        };
        let err = FeedIndexer::create_update(m, conn, &ResolverRegistry::new(), Arc::new(EchoExporter))
            .err()
            .unwrap();
        assert!(matches!(err, FeedIndexError::UnknownResolver { .. }));
    }

    #[tokio::test]
    async fn row_and_view_action_share_the_same_path() {
        let conn = Arc::new(MemoryConnection::new());
        let indexer =
            FeedIndexer::create_update(meta(), conn.clone(), &ResolverRegistry::new(), Arc::new(EchoExporter))
                .unwrap();
        indexer.execute_row(4).await.unwrap();
        ViewAction::execute(&indexer, &[5]).await.unwrap();

        let table = indexer.metadata().feed_table_name;
        assert!(conn.row(&table, &RowKey::new(4)).is_some());
        assert!(conn.row(&table, &RowKey::new(5)).is_some());
    }

    #[tokio::test]
    async fn modified_since_applies_to_later_calls() {
        let conn = Arc::new(MemoryConnection::new());
        let indexer =
            FeedIndexer::create_update(meta(), conn, &ResolverRegistry::new(), Arc::new(EchoExporter)).unwrap();
        let since = Utc::now();
        indexer.set_modified_since(Some(since));
        assert_eq!(indexer.metadata().modified_since, Some(since));
    }
}
