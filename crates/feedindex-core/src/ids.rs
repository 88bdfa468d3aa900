//! Id providers: keyset pagination over a source table and affected-id
//! expansion.

use std::sync::Arc;

use futures::Stream;
use tracing::trace;

use crate::connection::{FeedConnection, KeysetQuery};
use crate::error::FeedIndexError;
use crate::metadata::FeedIndexMetadata;
use crate::resolver::{AffectedIdsResolverPool, ResolverRegistry};
use crate::types::{EntityId, IdBatch};

// ─── IdBatches ────────────────────────────────────────────────────────────────

/// Lazy, finite sequence of id batches.
///
/// Each call to [`next_batch`](Self::next_batch) runs one keyset page after
/// the last id seen, so memory stays bounded to one batch and rows inserted
/// behind the cursor cannot shift later pages. The sequence ends at the first
/// empty page and cannot be restarted.
pub struct IdBatches {
    conn: Arc<dyn FeedConnection>,
    query: KeysetQuery,
    exhausted: bool,
}

impl IdBatches {
    pub fn new(conn: Arc<dyn FeedConnection>, query: KeysetQuery) -> Self {
        Self {
            conn,
            query,
            exhausted: false,
        }
    }

    /// Fetch the next page, or `None` once the source is exhausted.
    pub async fn next_batch(&mut self) -> Result<Option<IdBatch>, FeedIndexError> {
        if self.exhausted {
            return Ok(None);
        }
        let ids = self.conn.select_ids_after(&self.query).await?;
        match ids.last() {
            Some(&last) => {
                trace!(table = %self.query.table, after = ?self.query.after, count = ids.len(), "id page");
                self.query.after = Some(last);
                Ok(Some(ids))
            }
            None => {
                self.exhausted = true;
                Ok(None)
            }
        }
    }

    /// Last id handed out so far.
    pub fn cursor(&self) -> Option<EntityId> {
        self.query.after
    }

    /// Adapt into a `Stream` of batches.
    pub fn into_stream(self) -> impl Stream<Item = Result<IdBatch, FeedIndexError>> + Send {
        futures::stream::try_unfold(self, |mut batches| async move {
            Ok(batches.next_batch().await?.map(|batch| (batch, batches)))
        })
    }
}

// ─── AllIdsResolver ───────────────────────────────────────────────────────────

/// Produces every source id of a feed.
#[derive(Clone)]
pub struct AllIdsResolver {
    conn: Arc<dyn FeedConnection>,
    distinct: bool,
}

impl AllIdsResolver {
    pub fn new(conn: Arc<dyn FeedConnection>) -> Self {
        Self {
            conn,
            distinct: false,
        }
    }

    /// Scan that collapses repeated ids, for relation tables where one child
    /// may appear under several parents.
    pub fn distinct(conn: Arc<dyn FeedConnection>) -> Self {
        Self {
            conn,
            distinct: true,
        }
    }

    /// Keyset scan of `source_table_name.source_table_field`, restricted to
    /// the feed's modification window when one is set.
    pub fn all_ids(&self, meta: &FeedIndexMetadata) -> IdBatches {
        let modified_window = match (&meta.source_modified_field, meta.modified_since) {
            (Some(field), Some(since)) => Some((field.clone(), since)),
            _ => None,
        };
        IdBatches::new(
            self.conn.clone(),
            KeysetQuery {
                table: meta.source_table_name.clone(),
                field: meta.source_table_field.clone(),
                after: None,
                limit: meta.batch_size,
                modified_window,
                distinct: self.distinct,
            },
        )
    }
}

// ─── EntityIdsProvider ────────────────────────────────────────────────────────

/// All-ids scan plus affected-id expansion for one feed.
pub struct EntityIdsProvider {
    conn: Arc<dyn FeedConnection>,
    all: AllIdsResolver,
    pool: AffectedIdsResolverPool,
}

impl EntityIdsProvider {
    /// Fails when the feed names an unregistered resolver.
    pub fn new(
        conn: Arc<dyn FeedConnection>,
        meta: &FeedIndexMetadata,
        registry: &ResolverRegistry,
    ) -> Result<Self, FeedIndexError> {
        Ok(Self {
            all: AllIdsResolver::new(conn.clone()),
            pool: AffectedIdsResolverPool::for_feed(meta, registry)?,
            conn,
        })
    }

    /// Replace the all-ids source, keeping the resolver pool.
    pub fn with_all_ids(mut self, all: AllIdsResolver) -> Self {
        self.all = all;
        self
    }

    pub fn all_ids(&self, meta: &FeedIndexMetadata) -> IdBatches {
        self.all.all_ids(meta)
    }

    pub async fn affected_ids(&self, ids: &[EntityId]) -> Result<Vec<EntityId>, FeedIndexError> {
        self.pool.affected_ids(self.conn.as_ref(), ids).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryConnection, SourceRecord};
    use chrono::{Duration, Utc};
    use futures::TryStreamExt;

    fn meta(batch_size: usize) -> FeedIndexMetadata {
        FeedIndexMetadata {
            source_table_name: "src".into(),
            batch_size,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn pages_until_empty_batch() {
        let conn = Arc::new(MemoryConnection::new());
        for id in 1..=3 {
            conn.add_source("src", id);
        }
        let mut batches = AllIdsResolver::new(conn).all_ids(&meta(2));
        assert_eq!(batches.next_batch().await.unwrap(), Some(vec![1, 2]));
        assert_eq!(batches.next_batch().await.unwrap(), Some(vec![3]));
        assert_eq!(batches.next_batch().await.unwrap(), None);
        assert_eq!(batches.next_batch().await.unwrap(), None);
        assert_eq!(batches.cursor(), Some(3));
    }

    #[tokio::test]
    async fn covers_every_id_without_repeats() {
        let conn = Arc::new(MemoryConnection::new());
        for id in (1..=250).map(|i| i * 3) {
            conn.add_source("src", id);
        }
        let batches: Vec<IdBatch> = AllIdsResolver::new(conn)
            .all_ids(&meta(7))
            .into_stream()
            .try_collect()
            .await
            .unwrap();
        assert!(batches.iter().all(|b| b.len() <= 7));
        let flat: Vec<EntityId> = batches.into_iter().flatten().collect();
        assert_eq!(flat, (1..=250).map(|i| i * 3).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn picks_up_rows_inserted_ahead_of_cursor() {
        let conn = Arc::new(MemoryConnection::new());
        for id in 1..=4 {
            conn.add_source("src", id);
        }
        let mut batches = AllIdsResolver::new(conn.clone()).all_ids(&meta(2));
        assert_eq!(batches.next_batch().await.unwrap(), Some(vec![1, 2]));
        conn.add_source("src", 0);
        conn.add_source("src", 5);
        assert_eq!(batches.next_batch().await.unwrap(), Some(vec![3, 4]));
        assert_eq!(batches.next_batch().await.unwrap(), Some(vec![5]));
        assert_eq!(batches.next_batch().await.unwrap(), None);
    }

    #[tokio::test]
    async fn modification_window_limits_scan() {
        let conn = Arc::new(MemoryConnection::new());
        let now = Utc::now();
        for (id, age) in [(1, 10), (2, 1), (3, 30)] {
            conn.add_source_record(
                "src",
                id,
                SourceRecord {
                    link_id: id,
                    modified_at: now - Duration::days(age),
                },
            );
        }
        let mut m = meta(10);
        m.source_modified_field = Some("updated_at".into());
        m.set_modified_since(Some(now - Duration::days(15)));
        let mut batches = AllIdsResolver::new(conn).all_ids(&m);
        assert_eq!(batches.next_batch().await.unwrap(), Some(vec![1, 2]));
    }
}
