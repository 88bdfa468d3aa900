//! SQLite backend for FeedIndex.
//!
//! Implements [`FeedConnection`] for feed tables, [`Changelog`] over
//! `<view>_cl` tables and [`ViewStateStore`] over `mview_state`, all on one
//! `sqlx` pool.
//!
//! # Usage
//! ```rust,no_run
//! use feedindex_storage::sqlite::SqliteStorage;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let store = SqliteStorage::open("./feeds.db").await?;
//!
//! // In-memory (tests / ephemeral)
//! let store = SqliteStorage::in_memory().await?;
//! # Ok(())
//! # }
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Column, QueryBuilder, Row, Sqlite, SqlitePool};
use tracing::debug;

use feedindex_core::changelog::{Changelog, ViewState, ViewStateStore, ViewStatus};
use feedindex_core::connection::{FeedConnection, FeedTable, KeysetQuery, OrphanPredicate, StoredHash};
use feedindex_core::error::FeedIndexError;
use feedindex_core::metadata::columns;
use feedindex_core::types::{EntityId, ExportStatus, FeedRow, RowKey};

use crate::sql::{push_in_list, push_orphan_condition, qualified, quote};

/// UTC text layout `julianday` parses, matching `CURRENT_TIMESTAMP`.
const SQLITE_TIMESTAMP: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Placeholder a named query uses for its id list.
pub const IDS_PLACEHOLDER: &str = ":ids";

/// Map a driver error; `SQLITE_BUSY` and `SQLITE_LOCKED` (and their extended
/// codes) count as lock conflicts.
pub fn storage_err(e: sqlx::Error) -> FeedIndexError {
    if let sqlx::Error::Database(db) = &e {
        let primary = db
            .code()
            .and_then(|c| c.parse::<i32>().ok())
            .map(|c| c & 0xff);
        if matches!(primary, Some(5) | Some(6)) {
            return FeedIndexError::Deadlock(db.message().to_string());
        }
    }
    FeedIndexError::Storage(e.to_string())
}

/// SQLite-backed feed tables, change-logs and view state.
pub struct SqliteStorage {
    pool: SqlitePool,
    named: RwLock<HashMap<String, String>>,
}

impl SqliteStorage {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./feeds.db"`) or a full
    /// SQLite URL (`"sqlite:./feeds.db?mode=rwc"`).
    pub async fn open(path: &str) -> Result<Self, FeedIndexError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };
        let pool = SqlitePool::connect(&url).await.map_err(storage_err)?;
        let storage = Self::with_pool(pool);
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&storage.pool)
            .await
            .map_err(storage_err)?;
        storage.init_schema().await?;
        Ok(storage)
    }

    /// Open an in-memory SQLite database.
    ///
    /// One connection, kept for the life of the pool; all data is lost when
    /// the storage is dropped.
    pub async fn in_memory() -> Result<Self, FeedIndexError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(storage_err)?;
        let storage = Self::with_pool(pool);
        storage.init_schema().await?;
        Ok(storage)
    }

    fn with_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            named: RwLock::new(HashMap::new()),
        }
    }

    async fn init_schema(&self) -> Result<(), FeedIndexError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS mview_state (
                view_id    TEXT    NOT NULL PRIMARY KEY,
                enabled    INTEGER NOT NULL DEFAULT 1,
                status     TEXT    NOT NULL DEFAULT 'idle',
                version_id INTEGER NOT NULL DEFAULT 0,
                updated_at INTEGER NOT NULL DEFAULT 0
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    /// Underlying pool, for host tables this crate does not manage.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create a feed table with its natural key as primary key.
    pub async fn ensure_feed_table(&self, table: &FeedTable) -> Result<(), FeedIndexError> {
        let mut ddl = format!(
            "CREATE TABLE IF NOT EXISTS {} ({} INTEGER NOT NULL",
            quote(&table.name),
            quote(&table.source_column)
        );
        for col in &table.identity_columns {
            ddl.push_str(&format!(", {} TEXT NOT NULL", quote(col)));
        }
        ddl.push_str(&format!(
            ", {} TEXT NOT NULL, {} INTEGER NOT NULL DEFAULT 0, {} TEXT NOT NULL, \
             {} INTEGER NOT NULL DEFAULT 0, {} TEXT, {} TEXT NOT NULL",
            quote(columns::FEED_DATA),
            quote(columns::IS_DELETED),
            quote(columns::FEED_HASH),
            quote(columns::STATUS),
            quote(columns::ERRORS),
            quote(columns::MODIFIED_AT),
        ));
        let key: Vec<String> = std::iter::once(&table.source_column)
            .chain(&table.identity_columns)
            .map(|c| quote(c))
            .collect();
        ddl.push_str(&format!(", PRIMARY KEY ({}))", key.join(", ")));

        sqlx::query(&ddl).execute(&self.pool).await.map_err(storage_err)?;
        debug!(table = %table.name, "feed table ready");
        Ok(())
    }

    /// Register a query for [`FeedConnection::select_named`]. The SQL must
    /// select one integer column and contain `:ids` where the id list goes,
    /// e.g. `SELECT product_id FROM links WHERE parent_id IN (:ids)`.
    pub fn register_named_query(&self, name: &str, sql: &str) -> Result<(), FeedIndexError> {
        if !sql.contains(IDS_PLACEHOLDER) {
            return Err(FeedIndexError::Config(format!(
                "named query '{name}' has no {IDS_PLACEHOLDER} placeholder"
            )));
        }
        self.named
            .write()
            .map_err(|_| FeedIndexError::Storage("named query lock poisoned".into()))?
            .insert(name.to_string(), sql.to_string());
        Ok(())
    }

    /// Create the change-log table of a view.
    pub async fn create_changelog(&self, view_id: &str) -> Result<(), FeedIndexError> {
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {} (
                version_id INTEGER PRIMARY KEY AUTOINCREMENT,
                entity_id  INTEGER NOT NULL
            )",
            quote(&changelog_table(view_id))
        ))
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    /// Append changed ids to a view's change-log, one version per id.
    pub async fn record_changes(&self, view_id: &str, ids: &[EntityId]) -> Result<u64, FeedIndexError> {
        let table = self.existing_changelog(view_id).await?;
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        for id in ids {
            sqlx::query(&format!("INSERT INTO {} (entity_id) VALUES (?)", quote(&table)))
                .bind(*id)
                .execute(&mut *tx)
                .await
                .map_err(storage_err)?;
        }
        tx.commit().await.map_err(storage_err)?;
        self.version(view_id).await
    }

    async fn existing_changelog(&self, view_id: &str) -> Result<String, FeedIndexError> {
        let table = changelog_table(view_id);
        let found = sqlx::query("SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?")
            .bind(&table)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        match found {
            Some(_) => Ok(table),
            None => Err(FeedIndexError::ChangelogMissing { table }),
        }
    }

    fn named_query(&self, name: &str) -> Result<String, FeedIndexError> {
        self.named
            .read()
            .map_err(|_| FeedIndexError::Storage("named query lock poisoned".into()))?
            .get(name)
            .cloned()
            .ok_or_else(|| FeedIndexError::Config(format!("unknown named query '{name}'")))
    }

    async fn write_rows(
        &self,
        table: &FeedTable,
        rows: &[FeedRow],
        conflict: Option<&[String]>,
    ) -> Result<u64, FeedIndexError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let key_cols: Vec<String> = std::iter::once(&table.source_column)
            .chain(&table.identity_columns)
            .map(|c| quote(c))
            .collect();
        let all_cols: Vec<String> = key_cols
            .iter()
            .cloned()
            .chain(columns::ALL.iter().map(|c| quote(c)))
            .collect();
        let placeholders = vec!["?"; all_cols.len()].join(", ");
        let mut sql = format!(
            "INSERT INTO {} ({}) VALUES ({placeholders})",
            quote(&table.name),
            all_cols.join(", ")
        );
        if let Some(update) = conflict {
            if let Some(bad) = update.iter().find(|c| !columns::ALL.contains(&c.as_str())) {
                return Err(FeedIndexError::Storage(format!(
                    "no such column: {}.{bad}",
                    table.name
                )));
            }
            if update.is_empty() {
                sql.push_str(&format!(" ON CONFLICT ({}) DO NOTHING", key_cols.join(", ")));
            } else {
                let set: Vec<String> = update
                    .iter()
                    .map(|c| format!("{0} = excluded.{0}", quote(c)))
                    .collect();
                sql.push_str(&format!(
                    " ON CONFLICT ({}) DO UPDATE SET {}",
                    key_cols.join(", "),
                    set.join(", ")
                ));
            }
        }

        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        let mut affected = 0;
        for row in rows {
            let mut query = sqlx::query(&sql).bind(row.source_id);
            for col in &table.identity_columns {
                let value = row.identity.get(col).ok_or_else(|| {
                    FeedIndexError::Storage(format!(
                        "row {} has no value for identity column {col}",
                        row.source_id
                    ))
                })?;
                query = query.bind(value.clone());
            }
            let result = query
                .bind(&row.feed_data)
                .bind(row.is_deleted)
                .bind(&row.feed_hash)
                .bind(row.status)
                .bind(&row.errors)
                .bind(row.modified_at)
                .execute(&mut *tx)
                .await
                .map_err(storage_err)?;
            affected += result.rows_affected();
        }
        tx.commit().await.map_err(storage_err)?;
        Ok(affected)
    }

    /// Rows of `table` for `source_ids`, decoded with the table's layout.
    async fn rows_for(
        &self,
        table: &FeedTable,
        source_ids: &[EntityId],
    ) -> Result<Vec<FeedRow>, FeedIndexError> {
        if source_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut qb = QueryBuilder::<Sqlite>::new(format!("SELECT * FROM {} WHERE ", quote(&table.name)));
        push_in_list(&mut qb, &quote(&table.source_column), source_ids);
        let rows = qb.build().fetch_all(&self.pool).await.map_err(storage_err)?;
        rows.iter().map(|r| decode_row(r, &table.source_column)).collect()
    }
}

fn changelog_table(view_id: &str) -> String {
    format!("{view_id}_cl")
}

/// Decode a `SELECT *` feed row. Every column that is neither the source
/// column nor a fixed feed column is an identity column.
fn decode_row(row: &SqliteRow, source_column: &str) -> Result<FeedRow, FeedIndexError> {
    let mut identity = std::collections::BTreeMap::new();
    for column in row.columns() {
        let name = column.name();
        if name != source_column && !columns::ALL.contains(&name) {
            let value: String = row.try_get(column.ordinal()).map_err(storage_err)?;
            identity.insert(name.to_string(), value);
        }
    }
    Ok(FeedRow {
        source_id: row.try_get(source_column).map_err(storage_err)?,
        identity,
        feed_data: row.try_get(columns::FEED_DATA).map_err(storage_err)?,
        feed_hash: row.try_get(columns::FEED_HASH).map_err(storage_err)?,
        is_deleted: row.try_get(columns::IS_DELETED).map_err(storage_err)?,
        status: row.try_get(columns::STATUS).map_err(storage_err)?,
        errors: row.try_get(columns::ERRORS).map_err(storage_err)?,
        modified_at: row.try_get(columns::MODIFIED_AT).map_err(storage_err)?,
    })
}

// ─── FeedConnection impl ─────────────────────────────────────────────────────

#[async_trait]
impl FeedConnection for SqliteStorage {
    async fn select_ids_after(&self, query: &KeysetQuery) -> Result<Vec<EntityId>, FeedIndexError> {
        let field = quote(&query.field);
        let distinct = if query.distinct { "DISTINCT " } else { "" };
        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {distinct}{field} FROM {} WHERE 1 = 1",
            quote(&query.table)
        ));
        if let Some(after) = query.after {
            qb.push(format!(" AND {field} > ")).push_bind(after);
        }
        if let Some((column, since)) = &query.modified_window {
            // Compare as instants: `CURRENT_TIMESTAMP` text and RFC 3339 text
            // do not sort together.
            qb.push(format!(" AND julianday({}) >= julianday(", quote(column)))
                .push_bind(since.format(SQLITE_TIMESTAMP).to_string())
                .push(")");
        }
        qb.push(format!(" ORDER BY {field} LIMIT "))
            .push_bind(query.limit as i64);

        let rows = qb.build().fetch_all(&self.pool).await.map_err(storage_err)?;
        rows.iter()
            .map(|r| r.try_get::<i64, _>(0).map_err(storage_err))
            .collect()
    }

    async fn select_named(
        &self,
        query_name: &str,
        ids: &[EntityId],
    ) -> Result<Vec<EntityId>, FeedIndexError> {
        let sql = self.named_query(query_name)?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let occurrences = sql.matches(IDS_PLACEHOLDER).count();
        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = sql.replace(IDS_PLACEHOLDER, &placeholders);

        let mut query = sqlx::query(&sql);
        for _ in 0..occurrences {
            for id in ids {
                query = query.bind(*id);
            }
        }
        let rows = query.fetch_all(&self.pool).await.map_err(storage_err)?;
        rows.iter()
            .map(|r| r.try_get::<i64, _>(0).map_err(storage_err))
            .collect()
    }

    async fn insert_on_duplicate(
        &self,
        table: &FeedTable,
        rows: &[FeedRow],
        update_columns: &[String],
    ) -> Result<u64, FeedIndexError> {
        self.write_rows(table, rows, Some(update_columns)).await
    }

    async fn insert_array(&self, table: &FeedTable, rows: &[FeedRow]) -> Result<u64, FeedIndexError> {
        self.write_rows(table, rows, None).await
    }

    async fn truncate_table(&self, table: &FeedTable) -> Result<(), FeedIndexError> {
        sqlx::query(&format!("DELETE FROM {}", quote(&table.name)))
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn describe_table(&self, table: &str) -> Result<Vec<String>, FeedIndexError> {
        let rows = sqlx::query(&format!("PRAGMA table_info({})", quote(table)))
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;
        rows.iter()
            .map(|r| r.try_get::<String, _>("name").map_err(storage_err))
            .collect()
    }

    async fn existing_keys(
        &self,
        table: &FeedTable,
        keys: &[RowKey],
    ) -> Result<HashSet<RowKey>, FeedIndexError> {
        let mut ids: Vec<EntityId> = keys.iter().map(|k| k.source_id).collect();
        ids.sort_unstable();
        ids.dedup();
        let wanted: HashSet<&RowKey> = keys.iter().collect();
        Ok(self
            .rows_for(table, &ids)
            .await?
            .into_iter()
            .map(|r| r.key())
            .filter(|k| wanted.contains(k))
            .collect())
    }

    async fn fetch_hashes(
        &self,
        table: &FeedTable,
        source_ids: &[EntityId],
    ) -> Result<HashMap<RowKey, StoredHash>, FeedIndexError> {
        Ok(self
            .rows_for(table, source_ids)
            .await?
            .into_iter()
            .map(|r| {
                (
                    r.key(),
                    StoredHash {
                        feed_hash: r.feed_hash,
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
        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "UPDATE {} SET {} = 1, {} = {}, {} = NULL, {} = ",
            quote(predicate.feed_table()),
            quote(columns::IS_DELETED),
            quote(columns::STATUS),
            ExportStatus::Persisted.code(),
            quote(columns::ERRORS),
            quote(columns::MODIFIED_AT),
        ));
        qb.push_bind(at).push(" WHERE ");
        push_orphan_condition(&mut qb, predicate);

        let result = qb.build().execute(&self.pool).await.map_err(storage_err)?;
        debug!(table = predicate.feed_table(), flagged = result.rows_affected(), "orphans flagged");
        Ok(result.rows_affected())
    }

    async fn select_removed(
        &self,
        predicate: &OrphanPredicate,
        after: Option<EntityId>,
        limit: usize,
    ) -> Result<Vec<FeedRow>, FeedIndexError> {
        let feed = predicate.feed_table();
        let id = qualified(feed, predicate.feed_id_field());

        let mut qb = QueryBuilder::<Sqlite>::new(format!("SELECT * FROM {} WHERE ", quote(feed)));
        push_orphan_condition(&mut qb, predicate);
        qb.push(format!(" AND {id} IN (SELECT DISTINCT {id} FROM {} WHERE ", quote(feed)));
        push_orphan_condition(&mut qb, predicate);
        if let Some(after) = after {
            qb.push(format!(" AND {id} > ")).push_bind(after);
        }
        qb.push(format!(" ORDER BY {id} LIMIT "))
            .push_bind(limit as i64)
            .push(format!(") ORDER BY {id}"));

        let rows = qb.build().fetch_all(&self.pool).await.map_err(storage_err)?;
        rows.iter()
            .map(|r| decode_row(r, predicate.feed_id_field()))
            .collect()
    }
}

// ─── Changelog impl ──────────────────────────────────────────────────────────

#[async_trait]
impl Changelog for SqliteStorage {
    async fn version(&self, view_id: &str) -> Result<u64, FeedIndexError> {
        let table = self.existing_changelog(view_id).await?;
        let row = sqlx::query(&format!(
            "SELECT COALESCE(MAX(version_id), 0) AS version FROM {}",
            quote(&table)
        ))
        .fetch_one(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(row.try_get::<i64, _>("version").map_err(storage_err)? as u64)
    }

    async fn count_changed(&self, view_id: &str, from: u64, to: u64) -> Result<u64, FeedIndexError> {
        let table = self.existing_changelog(view_id).await?;
        let row = sqlx::query(&format!(
            "SELECT COUNT(DISTINCT entity_id) AS cnt FROM {} WHERE version_id > ? AND version_id <= ?",
            quote(&table)
        ))
        .bind(from as i64)
        .bind(to as i64)
        .fetch_one(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(row.try_get::<i64, _>("cnt").map_err(storage_err)? as u64)
    }

    async fn changed_ids_after(
        &self,
        view_id: &str,
        from: u64,
        to: u64,
        after: Option<EntityId>,
        limit: usize,
    ) -> Result<Vec<EntityId>, FeedIndexError> {
        let table = self.existing_changelog(view_id).await?;
        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "SELECT DISTINCT entity_id FROM {} WHERE version_id > ",
            quote(&table)
        ));
        qb.push_bind(from as i64)
            .push(" AND version_id <= ")
            .push_bind(to as i64);
        if let Some(after) = after {
            qb.push(" AND entity_id > ").push_bind(after);
        }
        qb.push(" ORDER BY entity_id LIMIT ").push_bind(limit as i64);

        let rows = qb.build().fetch_all(&self.pool).await.map_err(storage_err)?;
        rows.iter()
            .map(|r| r.try_get::<i64, _>("entity_id").map_err(storage_err))
            .collect()
    }
}

// ─── ViewStateStore impl ─────────────────────────────────────────────────────

#[async_trait]
impl ViewStateStore for SqliteStorage {
    async fn load(&self, view_id: &str) -> Result<ViewState, FeedIndexError> {
        let row = sqlx::query(
            "SELECT view_id, enabled, status, version_id, updated_at
             FROM mview_state WHERE view_id = ?",
        )
        .bind(view_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;

        let Some(r) = row else {
            return Ok(ViewState::new(view_id));
        };
        let status: String = r.try_get("status").map_err(storage_err)?;
        Ok(ViewState {
            view_id: r.try_get("view_id").map_err(storage_err)?,
            enabled: r.try_get("enabled").map_err(storage_err)?,
            status: status.parse::<ViewStatus>()?,
            version_id: r.try_get::<i64, _>("version_id").map_err(storage_err)? as u64,
            updated_at: r.try_get("updated_at").map_err(storage_err)?,
        })
    }

    async fn save(&self, state: &ViewState) -> Result<(), FeedIndexError> {
        sqlx::query(
            "INSERT OR REPLACE INTO mview_state
             (view_id, enabled, status, version_id, updated_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&state.view_id)
        .bind(state.enabled)
        .bind(state.status.to_string())
        .bind(state.version_id as i64)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        debug!(view = %state.view_id, status = %state.status, version = state.version_id, "view state saved");
        Ok(())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
