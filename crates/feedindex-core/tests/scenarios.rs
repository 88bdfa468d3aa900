//! End-to-end behaviour of the feed pipeline on the in-memory backend.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

use feedindex_core::{
    ActionRegistry, AllIdsResolver, CreateUpdateProcessor, EntityId, EntityIdsProvider,
    ExportProcessor, ExportStatus, FeedConnection, FeedIndexError, FeedIndexMetadata,
    FeedIndexMetadataBuilder, FeedIndexer, FeedRow, FeedSender, FeedTable, KeysetQuery,
    MemoryChangelog, MemoryConnection, MemoryViewStore, NamedQueryResolver, OrphanPredicate,
    ResolverRegistry, RowKey, StoredHash, ViewMaterializer, ViewStateStore, ViewStatus,
};

const SOURCE: &str = "catalog_product_entity";
const FEED: &str = "catalog_data_exporter_products";

// ─── Fixtures ─────────────────────────────────────────────────────────────────

/// Catalog the export processor reads from; missing ids produce no payload.
#[derive(Default)]
struct Catalog {
    products: Mutex<HashMap<EntityId, Value>>,
    fail_on: Mutex<HashSet<EntityId>>,
}

impl Catalog {
    fn put(&self, id: EntityId, name: &str) {
        self.products.lock().unwrap().insert(
            id,
            json!({"productId": id, "name": name, "updatedAt": Utc::now().to_rfc3339()}),
        );
    }

    fn touch(&self, id: EntityId) {
        if let Some(p) = self.products.lock().unwrap().get_mut(&id) {
            p["updatedAt"] = json!("2030-01-01T00:00:00Z");
        }
    }

    fn remove(&self, id: EntityId) {
        self.products.lock().unwrap().remove(&id);
    }
}

#[async_trait]
impl ExportProcessor for Catalog {
    async fn process(&self, feed_name: &str, arguments: &[Value]) -> Result<Vec<Value>, FeedIndexError> {
        let ids: Vec<EntityId> = arguments.iter().filter_map(|a| a["productId"].as_i64()).collect();
        if let Some(bad) = ids.iter().find(|id| self.fail_on.lock().unwrap().contains(id)) {
            return Err(FeedIndexError::Export {
                feed: feed_name.to_string(),
                reason: format!("product {bad} cannot be built"),
            });
        }
        let products = self.products.lock().unwrap();
        Ok(ids.iter().filter_map(|id| products.get(id).cloned()).collect())
    }
}

struct Env {
    conn: Arc<MemoryConnection>,
    catalog: Arc<Catalog>,
}

impl Env {
    fn with_products(ids: &[EntityId]) -> Self {
        let conn = Arc::new(MemoryConnection::new());
        let catalog = Arc::new(Catalog::default());
        for &id in ids {
            conn.add_source(SOURCE, id);
            catalog.put(id, &format!("Product {id}"));
        }
        Self { conn, catalog }
    }

    fn delete_product(&self, id: EntityId) {
        self.conn.remove_source(SOURCE, id);
        self.catalog.remove(id);
    }

    fn row(&self, id: EntityId) -> FeedRow {
        self.conn.row(FEED, &RowKey::new(id)).unwrap()
    }

    fn rows(&self) -> Vec<FeedRow> {
        self.conn.rows(FEED)
    }
}

fn meta(batch_size: usize) -> FeedIndexMetadata {
    FeedIndexMetadataBuilder::new("products")
        .batch_size(batch_size)
        .build()
        .unwrap()
}

fn registry() -> ResolverRegistry {
    ResolverRegistry::new()
}

/// Counts ERROR events emitted while installed.
struct ErrorCounter(Arc<AtomicUsize>);

impl<S: Subscriber> Layer<S> for ErrorCounter {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if *event.metadata().level() == Level::ERROR {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Memory connection whose writes always hit a lock conflict.
struct DeadlockingConnection {
    inner: MemoryConnection,
    writes: AtomicUsize,
}

#[async_trait]
impl FeedConnection for DeadlockingConnection {
    async fn select_ids_after(&self, query: &KeysetQuery) -> Result<Vec<EntityId>, FeedIndexError> {
        self.inner.select_ids_after(query).await
    }

    async fn select_named(&self, name: &str, ids: &[EntityId]) -> Result<Vec<EntityId>, FeedIndexError> {
        self.inner.select_named(name, ids).await
    }

    async fn insert_on_duplicate(
        &self,
        _table: &FeedTable,
        _rows: &[FeedRow],
        _update_columns: &[String],
    ) -> Result<u64, FeedIndexError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        Err(FeedIndexError::Deadlock("deadlock found when trying to get lock".into()))
    }

    async fn insert_array(&self, _table: &FeedTable, _rows: &[FeedRow]) -> Result<u64, FeedIndexError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        Err(FeedIndexError::Deadlock("deadlock found when trying to get lock".into()))
    }

    async fn truncate_table(&self, table: &FeedTable) -> Result<(), FeedIndexError> {
        self.inner.truncate_table(table).await
    }

    async fn describe_table(&self, table: &str) -> Result<Vec<String>, FeedIndexError> {
        self.inner.describe_table(table).await
    }

    async fn existing_keys(&self, table: &FeedTable, keys: &[RowKey]) -> Result<HashSet<RowKey>, FeedIndexError> {
        self.inner.existing_keys(table, keys).await
    }

    async fn fetch_hashes(
        &self,
        table: &FeedTable,
        source_ids: &[EntityId],
    ) -> Result<HashMap<RowKey, StoredHash>, FeedIndexError> {
        self.inner.fetch_hashes(table, source_ids).await
    }

    async fn mark_removed(&self, predicate: &OrphanPredicate, at: DateTime<Utc>) -> Result<u64, FeedIndexError> {
        self.inner.mark_removed(predicate, at).await
    }

    async fn select_removed(
        &self,
        predicate: &OrphanPredicate,
        after: Option<EntityId>,
        limit: usize,
    ) -> Result<Vec<FeedRow>, FeedIndexError> {
        self.inner.select_removed(predicate, after, limit).await
    }
}

/// Feed sender that records batches and reports them exported.
#[derive(Default)]
struct RecordingSender {
    batches: Mutex<Vec<Vec<(EntityId, bool)>>>,
}

#[async_trait]
impl FeedSender for RecordingSender {
    async fn send(&self, _meta: &FeedIndexMetadata, rows: &[FeedRow]) -> ExportStatus {
        self.batches
            .lock()
            .unwrap()
            .push(rows.iter().map(|r| (r.source_id, r.is_deleted)).collect());
        ExportStatus::Exported
    }
}

/// Feed sender that rejects batches while `reject` is set.
#[derive(Default)]
struct FlakySender {
    reject: AtomicBool,
    batches: Mutex<Vec<Vec<(EntityId, bool)>>>,
}

#[async_trait]
impl FeedSender for FlakySender {
    async fn send(&self, _meta: &FeedIndexMetadata, rows: &[FeedRow]) -> ExportStatus {
        self.batches
            .lock()
            .unwrap()
            .push(rows.iter().map(|r| (r.source_id, r.is_deleted)).collect());
        if self.reject.load(Ordering::SeqCst) {
            ExportStatus::Failed {
                reason: "export target unavailable".into(),
            }
        } else {
            ExportStatus::Exported
        }
    }
}

// ─── Scenarios ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn full_reindex_pages_then_writes_every_row() {
    let env = Env::with_products(&[1, 2, 3]);
    let mut m = meta(2);
    m.truncate_on_full_reindex = true;

    let mut pages = AllIdsResolver::new(env.conn.clone()).all_ids(&m);
    let mut seen = Vec::new();
    while let Some(batch) = pages.next_batch().await.unwrap() {
        seen.push(batch);
    }
    assert_eq!(seen, vec![vec![1, 2], vec![3]]);

    let indexer = FeedIndexer::create_update(m, env.conn.clone(), &registry(), env.catalog.clone()).unwrap();
    let stats = indexer.execute_full().await.unwrap();
    assert_eq!(stats.rows_written, 3);
    let rows = env.rows();
    assert_eq!(rows.len(), 3);
    assert!(rows.iter().all(|r| !r.is_deleted));
}

#[tokio::test]
async fn truncate_drops_rows_of_vanished_sources() {
    let env = Env::with_products(&[1, 2, 3]);
    let mut m = meta(2);
    m.truncate_on_full_reindex = true;
    let indexer = FeedIndexer::create_update(m, env.conn.clone(), &registry(), env.catalog.clone()).unwrap();
    indexer.execute_full().await.unwrap();

    env.delete_product(3);
    indexer.execute_full().await.unwrap();
    assert_eq!(env.rows().iter().map(|r| r.source_id).collect::<Vec<_>>(), vec![1, 2]);
}

#[tokio::test]
async fn reindexing_the_same_id_is_idempotent() {
    let env = Env::with_products(&[1]);
    let indexer = FeedIndexer::create_update(meta(10), env.conn.clone(), &registry(), env.catalog.clone()).unwrap();

    indexer.execute_row(1).await.unwrap();
    let first = env.row(1);
    indexer.execute_row(1).await.unwrap();
    let second = env.row(1);

    assert_eq!(env.rows().len(), 1);
    assert_eq!(first.feed_data, second.feed_data);
    assert_eq!(first.feed_hash, second.feed_hash);
}

#[tokio::test]
async fn deleted_source_is_soft_deleted_with_last_payload() {
    let env = Env::with_products(&[1, 2, 3]);
    let indexer =
        FeedIndexer::create_update_delete(meta(2), env.conn.clone(), &registry(), env.catalog.clone()).unwrap();
    indexer.execute_full().await.unwrap();
    let before = env.row(2).feed_data;

    env.delete_product(2);
    let stats = indexer.execute_list(&[2]).await.unwrap();
    assert_eq!(stats.rows_removed, 1);

    let row = env.row(2);
    assert!(row.is_deleted);
    assert_eq!(row.feed_data, before);
    assert!(!env.row(1).is_deleted);
    assert!(!env.row(3).is_deleted);
}

#[tokio::test]
async fn full_reindex_without_truncate_sweeps_orphans() {
    let env = Env::with_products(&[1, 2, 3]);
    let indexer =
        FeedIndexer::create_update_delete(meta(2), env.conn.clone(), &registry(), env.catalog.clone()).unwrap();
    indexer.execute_full().await.unwrap();

    env.delete_product(3);
    indexer.execute_full().await.unwrap();
    assert!(env.row(3).is_deleted);
    assert_eq!(env.rows().len(), 3);
}

#[tokio::test]
async fn hash_ignores_excluded_fields_only() {
    let env = Env::with_products(&[1]);
    let indexer = FeedIndexer::create_update(meta(10), env.conn.clone(), &registry(), env.catalog.clone()).unwrap();
    indexer.execute_row(1).await.unwrap();
    let original = env.row(1).feed_hash;

    env.catalog.touch(1);
    indexer.execute_row(1).await.unwrap();
    assert_eq!(env.row(1).feed_hash, original);

    env.catalog.put(1, "Renamed");
    indexer.execute_row(1).await.unwrap();
    assert_ne!(env.row(1).feed_hash, original);
}

#[tokio::test]
async fn affected_ids_pull_in_dependent_rows() {
    let env = Env::with_products(&[1, 11, 12]);
    env.conn.register_named_query(
        "children_of",
        Arc::new(|ids: &[EntityId]| if ids.contains(&1) { vec![11, 12] } else { vec![] }),
    );
    let mut reg = registry();
    reg.register(Arc::new(NamedQueryResolver::new("configurable_children", "children_of")));
    let mut m = meta(10);
    m.affected_id_resolvers = vec!["configurable_children".into()];

    let indexer = FeedIndexer::create_update(m, env.conn.clone(), &reg, env.catalog.clone()).unwrap();
    let stats = indexer.execute_row(1).await.unwrap();
    assert_eq!(stats.ids, 3);
    assert_eq!(env.rows().len(), 3);
}

#[tokio::test]
async fn persistent_deadlock_is_retried_once_then_logged() {
    let errors = Arc::new(AtomicUsize::new(0));
    let _guard = tracing::subscriber::set_default(
        tracing_subscriber::registry().with(ErrorCounter(errors.clone())),
    );

    let conn = Arc::new(DeadlockingConnection {
        inner: MemoryConnection::new(),
        writes: AtomicUsize::new(0),
    });
    conn.inner.add_source(SOURCE, 1);
    let catalog = Arc::new(Catalog::default());
    catalog.put(1, "Product 1");

    let mut m = meta(10);
    m.export_immediately = true;
    let indexer = FeedIndexer::create_update(m, conn.clone(), &registry(), catalog).unwrap();
    let stats = indexer.execute_row(1).await.unwrap();

    assert_eq!(conn.writes.load(Ordering::SeqCst), 2);
    assert_eq!(errors.load(Ordering::SeqCst), 1);
    assert_eq!(stats.failed_batches, 1);
    assert_eq!(stats.rows_written, 0);
    assert!(conn.inner.rows(FEED).is_empty());
}

#[tokio::test]
async fn streaming_mode_exports_changes_and_deletions() {
    let env = Env::with_products(&[1, 2, 3]);
    let sender = Arc::new(RecordingSender::default());
    let mut m = meta(2);
    m.export_immediately = true;

    let ids = EntityIdsProvider::new(env.conn.clone(), &m, &registry()).unwrap();
    let processor = feedindex_core::CreateUpdateDeleteProcessor::new(
        CreateUpdateProcessor::new(env.conn.clone(), env.catalog.clone()).with_sender(sender.clone()),
        feedindex_core::Reconciliation::MissingSource,
    );
    let indexer = FeedIndexer::new(m, ids, Arc::new(processor)).unwrap();

    indexer.execute_full().await.unwrap();
    assert!(env.rows().iter().all(|r| r.status == 200));
    let shipped: usize = sender.batches.lock().unwrap().iter().map(Vec::len).sum();
    assert_eq!(shipped, 3);

    // Unchanged rows are not shipped again.
    let stats = indexer.execute_list(&[1, 2, 3]).await.unwrap();
    assert_eq!(stats.rows_unchanged, 3);
    assert_eq!(sender.batches.lock().unwrap().len(), 2);

    env.delete_product(2);
    let stats = indexer.execute_list(&[2]).await.unwrap();
    assert_eq!(stats.rows_removed, 1);
    assert_eq!(sender.batches.lock().unwrap().last().unwrap(), &vec![(2, true)]);
    assert!(env.row(2).is_deleted);
}

#[tokio::test]
async fn rejected_exports_are_sent_again_on_the_next_run() {
    let env = Env::with_products(&[1, 2]);
    let sender = Arc::new(FlakySender::default());
    let mut m = meta(10);
    m.export_immediately = true;

    let ids = EntityIdsProvider::new(env.conn.clone(), &m, &registry()).unwrap();
    let processor = feedindex_core::CreateUpdateDeleteProcessor::new(
        CreateUpdateProcessor::new(env.conn.clone(), env.catalog.clone()).with_sender(sender.clone()),
        feedindex_core::Reconciliation::MissingSource,
    );
    let indexer = FeedIndexer::new(m, ids, Arc::new(processor)).unwrap();
    let sent = || sender.batches.lock().unwrap().len();

    sender.reject.store(true, Ordering::SeqCst);
    indexer.execute_row(1).await.unwrap();
    assert_eq!(env.row(1).status, 500);
    assert_eq!(sent(), 1);

    // Same payload, but the stored copy never reached the target.
    sender.reject.store(false, Ordering::SeqCst);
    let stats = indexer.execute_row(1).await.unwrap();
    assert_eq!(stats.rows_unchanged, 0);
    assert_eq!(env.row(1).status, 200);
    assert_eq!(sent(), 2);

    let stats = indexer.execute_row(1).await.unwrap();
    assert_eq!(stats.rows_unchanged, 1);
    assert_eq!(sent(), 2);

    // A rejected deletion is retried too.
    indexer.execute_row(2).await.unwrap();
    env.delete_product(2);
    sender.reject.store(true, Ordering::SeqCst);
    indexer.execute_list(&[2]).await.unwrap();
    assert!(env.row(2).is_deleted);
    assert_eq!(env.row(2).status, 500);
    let before = sent();

    sender.reject.store(false, Ordering::SeqCst);
    indexer.execute_list(&[2]).await.unwrap();
    assert_eq!(sent(), before + 1);
    assert_eq!(sender.batches.lock().unwrap().last().unwrap(), &vec![(2, true)]);
    assert_eq!(env.row(2).status, 200);

    indexer.execute_list(&[2]).await.unwrap();
    assert_eq!(sent(), before + 1);
}

#[tokio::test]
async fn orphan_sweep_resets_a_rejected_status() {
    let env = Env::with_products(&[1]);
    let m = meta(10);
    let indexer = FeedIndexer::create_update_delete(m, env.conn.clone(), &registry(), env.catalog.clone()).unwrap();
    indexer.execute_row(1).await.unwrap();

    let mut rejected = env.row(1);
    rejected.status = 500;
    rejected.errors = Some("export target unavailable".into());
    env.conn
        .insert_on_duplicate(
            &FeedTable::from_metadata(&indexer.metadata()),
            &[rejected],
            &["status".to_string(), "errors".to_string()],
        )
        .await
        .unwrap();

    env.delete_product(1);
    let stats = indexer.execute_list(&[1]).await.unwrap();
    assert_eq!(stats.rows_removed, 1);
    assert_eq!(env.row(1).status, 0);
    assert!(env.row(1).errors.is_none());

    let stats = indexer.execute_list(&[1]).await.unwrap();
    assert_eq!(stats.rows_removed, 0);
}

#[tokio::test]
async fn failing_batch_is_isolated_during_materialization() {
    let env = Env::with_products(&[1, 2, 3, 4, 5]);
    env.catalog.fail_on.lock().unwrap().insert(3);
    let mut m = meta(1);
    m.thread_count = 2;
    let indexer = FeedIndexer::create_update(m, env.conn.clone(), &registry(), env.catalog.clone()).unwrap();

    let log = Arc::new(MemoryChangelog::new());
    let store = Arc::new(MemoryViewStore::new());
    let mut actions = ActionRegistry::new();
    actions.register(FEED, Arc::new(indexer));
    let materializer = ViewMaterializer::new(store.clone(), log.clone(), actions);
    let version = log.record(FEED, &[1, 2, 3, 4, 5]);

    let report = materializer.materialize(FEED).await.unwrap().unwrap();
    assert_eq!(report.batches, 5);
    assert_eq!(report.failed_batches, 1);
    assert_eq!(materializer.pending_retries(FEED), vec![vec![3]]);

    let written: BTreeMap<EntityId, bool> = env.rows().into_iter().map(|r| (r.source_id, r.is_deleted)).collect();
    assert_eq!(written.keys().copied().collect::<Vec<_>>(), vec![1, 2, 4, 5]);

    let state = store.load(FEED).await.unwrap();
    assert_eq!(state.status, ViewStatus::Idle);
    assert_eq!(state.version_id, version);

    // Once the product builds again the parked batch goes through.
    env.catalog.fail_on.lock().unwrap().clear();
    let report = materializer.materialize(FEED).await.unwrap().unwrap();
    assert_eq!(report.replayed, 1);
    assert_eq!(report.failed_batches, 0);
    assert!(materializer.pending_retries(FEED).is_empty());
    assert_eq!(env.rows().len(), 5);
}
