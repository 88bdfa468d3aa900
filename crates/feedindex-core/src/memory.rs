//! In-memory connection.
//!
//! Models source tables, parent-child relation tables and feed tables in RAM.
//! Used by the test suites and by embedders that only need a transient feed.
//! Orphan predicates are evaluated by [`MemoryState::is_orphan`], the single
//! evaluator behind both `mark_removed` and `select_removed`.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::ops::Bound;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::connection::{
    FeedConnection, FeedTable, KeysetQuery, OrphanPredicate, OrphanScope, StoredHash,
};
use crate::error::FeedIndexError;
use crate::metadata::columns;
use crate::types::{EntityId, ExportStatus, FeedRow, RowKey};

/// A registered named query: ids in, ids out.
pub type NamedQueryFn = Arc<dyn Fn(&[EntityId]) -> Vec<EntityId> + Send + Sync>;

/// A row of a source (entity) table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRecord {
    /// Link id used by relation tables (equals the entity id unless staged).
    pub link_id: EntityId,
    pub modified_at: DateTime<Utc>,
}

struct RelationTable {
    parent_field: String,
    child_field: String,
    rows: Vec<(EntityId, EntityId)>,
}

struct FeedStore {
    layout: FeedTable,
    rows: BTreeMap<RowKey, FeedRow>,
}

#[derive(Default)]
struct MemoryState {
    sources: HashMap<String, BTreeMap<EntityId, SourceRecord>>,
    relations: HashMap<String, RelationTable>,
    feeds: HashMap<String, FeedStore>,
    named: HashMap<String, NamedQueryFn>,
}

impl MemoryState {
    fn feed_mut(&mut self, table: &FeedTable) -> &mut FeedStore {
        self.feeds
            .entry(table.name.clone())
            .or_insert_with(|| FeedStore {
                layout: table.clone(),
                rows: BTreeMap::new(),
            })
    }

    fn in_scope(scope: &OrphanScope, id: EntityId) -> bool {
        match scope {
            OrphanScope::All => true,
            OrphanScope::Ids(ids) => ids.contains(&id),
        }
    }

    fn is_orphan(&self, predicate: &OrphanPredicate, row: &FeedRow) -> bool {
        let pending = !row.is_deleted || row.status == ExportStatus::FAILED_CODE;
        if !pending || !Self::in_scope(predicate.scope(), row.source_id) {
            return false;
        }
        match predicate {
            OrphanPredicate::MissingSource { source_table, .. } => !self
                .sources
                .get(source_table)
                .is_some_and(|t| t.contains_key(&row.source_id)),
            OrphanPredicate::DetachedVariant {
                feed_parent_field,
                relation_table,
                entity_table,
                ..
            } => {
                let entities = self.sources.get(entity_table);
                let child_alive = entities.is_some_and(|t| t.contains_key(&row.source_id));
                if !child_alive {
                    return true;
                }
                let parent: Option<EntityId> = row
                    .identity
                    .get(feed_parent_field)
                    .and_then(|p| p.parse().ok());
                let linked = self.relations.get(relation_table).is_some_and(|rel| {
                    rel.rows.iter().any(|(parent_link, child)| {
                        *child == row.source_id
                            && entities
                                .and_then(|t| {
                                    t.iter()
                                        .find(|(_, rec)| rec.link_id == *parent_link)
                                        .map(|(id, _)| *id)
                                })
                                .is_some_and(|current| Some(current) == parent)
                    })
                });
                !linked
            }
        }
    }
}

/// In-memory [`FeedConnection`].
#[derive(Default)]
pub struct MemoryConnection {
    state: Mutex<MemoryState>,
}

impl MemoryConnection {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, FeedIndexError> {
        self.state
            .lock()
            .map_err(|_| FeedIndexError::Storage("memory connection lock poisoned".into()))
    }

    fn guard(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ─── Fixture helpers ────────────────────────────────────────────────────────

    /// Insert or replace a source row whose link id equals its id.
    pub fn add_source(&self, table: &str, id: EntityId) {
        self.add_source_record(
            table,
            id,
            SourceRecord {
                link_id: id,
                modified_at: Utc::now(),
            },
        );
    }

    pub fn add_source_record(&self, table: &str, id: EntityId, record: SourceRecord) {
        self.guard()
            .sources
            .entry(table.to_string())
            .or_default()
            .insert(id, record);
    }

    pub fn remove_source(&self, table: &str, id: EntityId) {
        if let Some(t) = self.guard().sources.get_mut(table) {
            t.remove(&id);
        }
    }

    /// Link `child` to the parent whose link id is `parent_link`.
    pub fn add_relation(
        &self,
        table: &str,
        parent_field: &str,
        child_field: &str,
        parent_link: EntityId,
        child: EntityId,
    ) {
        self.guard()
            .relations
            .entry(table.to_string())
            .or_insert_with(|| RelationTable {
                parent_field: parent_field.to_string(),
                child_field: child_field.to_string(),
                rows: Vec::new(),
            })
            .rows
            .push((parent_link, child));
    }

    pub fn remove_relation(&self, table: &str, parent_link: EntityId, child: EntityId) {
        if let Some(rel) = self.guard().relations.get_mut(table) {
            rel.rows.retain(|r| *r != (parent_link, child));
        }
    }

    pub fn register_named_query(&self, name: &str, query: NamedQueryFn) {
        self.guard().named.insert(name.to_string(), query);
    }

    /// Create an empty feed table.
    pub fn create_feed_table(&self, table: &FeedTable) {
        self.guard().feed_mut(table);
    }

    /// Every row of a feed table, ordered by key.
    pub fn rows(&self, table: &str) -> Vec<FeedRow> {
        self.guard()
            .feeds
            .get(table)
            .map(|f| f.rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn row(&self, table: &str, key: &RowKey) -> Option<FeedRow> {
        self.guard().feeds.get(table)?.rows.get(key).cloned()
    }
}

#[async_trait]
impl FeedConnection for MemoryConnection {
    async fn select_ids_after(&self, query: &KeysetQuery) -> Result<Vec<EntityId>, FeedIndexError> {
        let state = self.lock()?;
        if let Some(rel) = state.relations.get(&query.table) {
            let pick_parent = if query.field == rel.parent_field {
                true
            } else if query.field == rel.child_field {
                false
            } else {
                return Err(FeedIndexError::Storage(format!(
                    "no such column: {}.{}",
                    query.table, query.field
                )));
            };
            let ids: BTreeSet<EntityId> = rel
                .rows
                .iter()
                .map(|(parent, child)| if pick_parent { *parent } else { *child })
                .filter(|id| query.after.map_or(true, |a| *id > a))
                .collect();
            return Ok(ids.into_iter().take(query.limit).collect());
        }

        let table = state
            .sources
            .get(&query.table)
            .ok_or_else(|| FeedIndexError::Storage(format!("no such table: {}", query.table)))?;
        let range = match query.after {
            Some(a) => table.range((Bound::Excluded(a), Bound::Unbounded)),
            None => table.range(..),
        };
        Ok(range
            .filter(|(_, rec)| {
                query
                    .modified_window
                    .as_ref()
                    .map_or(true, |(_, since)| rec.modified_at >= *since)
            })
            .map(|(id, _)| *id)
            .take(query.limit)
            .collect())
    }

    async fn select_named(
        &self,
        query_name: &str,
        ids: &[EntityId],
    ) -> Result<Vec<EntityId>, FeedIndexError> {
        let query = self
            .lock()?
            .named
            .get(query_name)
            .cloned()
            .ok_or_else(|| FeedIndexError::Config(format!("unknown named query '{query_name}'")))?;
        Ok(query(ids))
    }

    async fn insert_on_duplicate(
        &self,
        table: &FeedTable,
        rows: &[FeedRow],
        update_columns: &[String],
    ) -> Result<u64, FeedIndexError> {
        let mut state = self.lock()?;
        let feed = state.feed_mut(table);
        for row in rows {
            match feed.rows.get_mut(&row.key()) {
                Some(existing) => {
                    for col in update_columns {
                        match col.as_str() {
                            columns::FEED_DATA => existing.feed_data = row.feed_data.clone(),
                            columns::IS_DELETED => existing.is_deleted = row.is_deleted,
                            columns::FEED_HASH => existing.feed_hash = row.feed_hash.clone(),
                            columns::STATUS => existing.status = row.status,
                            columns::ERRORS => existing.errors = row.errors.clone(),
                            columns::MODIFIED_AT => existing.modified_at = row.modified_at,
                            other => {
                                return Err(FeedIndexError::Storage(format!(
                                    "no such column: {}.{other}",
                                    table.name
                                )))
                            }
                        }
                    }
                }
                None => {
                    feed.rows.insert(row.key(), row.clone());
                }
            }
        }
        Ok(rows.len() as u64)
    }

    async fn insert_array(&self, table: &FeedTable, rows: &[FeedRow]) -> Result<u64, FeedIndexError> {
        let mut state = self.lock()?;
        let feed = state.feed_mut(table);
        if let Some(dup) = rows.iter().find(|r| feed.rows.contains_key(&r.key())) {
            return Err(FeedIndexError::Storage(format!(
                "UNIQUE constraint failed: {} ({})",
                table.name,
                dup.key()
            )));
        }
        for row in rows {
            feed.rows.insert(row.key(), row.clone());
        }
        Ok(rows.len() as u64)
    }

    async fn truncate_table(&self, table: &FeedTable) -> Result<(), FeedIndexError> {
        self.lock()?.feed_mut(table).rows.clear();
        Ok(())
    }

    async fn describe_table(&self, table: &str) -> Result<Vec<String>, FeedIndexError> {
        let state = self.lock()?;
        Ok(state
            .feeds
            .get(table)
            .map(|f| {
                std::iter::once(f.layout.source_column.clone())
                    .chain(f.layout.identity_columns.iter().cloned())
                    .chain(columns::ALL.iter().map(|c| c.to_string()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn existing_keys(
        &self,
        table: &FeedTable,
        keys: &[RowKey],
    ) -> Result<HashSet<RowKey>, FeedIndexError> {
        let state = self.lock()?;
        let Some(feed) = state.feeds.get(&table.name) else {
            return Ok(HashSet::new());
        };
        Ok(keys
            .iter()
            .filter(|k| feed.rows.contains_key(k))
            .cloned()
            .collect())
    }

    async fn fetch_hashes(
        &self,
        table: &FeedTable,
        source_ids: &[EntityId],
    ) -> Result<HashMap<RowKey, StoredHash>, FeedIndexError> {
        let state = self.lock()?;
        let Some(feed) = state.feeds.get(&table.name) else {
            return Ok(HashMap::new());
        };
        Ok(feed
            .rows
            .values()
            .filter(|r| source_ids.contains(&r.source_id))
            .map(|r| {
                (
                    r.key(),
                    StoredHash {
                        feed_hash: r.feed_hash.clone(),
                        is_deleted: r.is_deleted,
                        status: r.status,
                    },
                )
            })
            .collect())
    }

    async fn mark_removed(
        &self,
        predicate: &OrphanPredicate,
        at: DateTime<Utc>,
    ) -> Result<u64, FeedIndexError> {
        let mut state = self.lock()?;
        let Some(feed) = state.feeds.get(predicate.feed_table()) else {
            return Ok(0);
        };
        let orphaned: Vec<RowKey> = feed
            .rows
            .values()
            .filter(|r| state.is_orphan(predicate, r))
            .map(FeedRow::key)
            .collect();
        let Some(feed) = state.feeds.get_mut(predicate.feed_table()) else {
            return Ok(0);
        };
        for key in &orphaned {
            if let Some(row) = feed.rows.get_mut(key) {
                row.is_deleted = true;
                row.status = ExportStatus::Persisted.code();
                row.errors = None;
                row.modified_at = at;
            }
        }
        Ok(orphaned.len() as u64)
    }

    async fn select_removed(
        &self,
        predicate: &OrphanPredicate,
        after: Option<EntityId>,
        limit: usize,
    ) -> Result<Vec<FeedRow>, FeedIndexError> {
        let state = self.lock()?;
        let Some(feed) = state.feeds.get(predicate.feed_table()) else {
            return Ok(Vec::new());
        };
        let matching: Vec<&FeedRow> = feed
            .rows
            .values()
            .filter(|r| after.map_or(true, |a| r.source_id > a))
            .filter(|r| state.is_orphan(predicate, r))
            .collect();
        let page: BTreeSet<EntityId> = matching
            .iter()
            .map(|r| r.source_id)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .take(limit)
            .collect();
        Ok(matching
            .into_iter()
            .filter(|r| page.contains(&r.source_id))
            .cloned()
            .collect())
    }
}
