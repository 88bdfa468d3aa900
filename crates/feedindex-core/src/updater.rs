//! Retrying writer for export-immediately mode.
//!
//! One batch never aborts a run: after the retry budget is spent, or on any
//! error that is not a lock conflict, the failure is logged with the feed
//! name and the ids involved and the batch counts as handled. The rows will
//! be rewritten by the next reindex that touches their ids.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::connection::{FeedConnection, FeedTable};
use crate::error::FeedIndexError;
use crate::metadata::FeedIndexMetadata;
use crate::types::{ExportStatus, FeedRow, RowKey};

/// Bounded retry for feed writes.
#[derive(Debug, Clone)]
pub struct UpdateRetryPolicy {
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    /// Pause before each retry.
    pub backoff: Duration,
}

impl Default for UpdateRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            backoff: Duration::ZERO,
        }
    }
}

impl UpdateRetryPolicy {
    /// `true` if a lock conflict on `attempt` (1-based) deserves another try.
    pub fn should_retry(&self, attempt: u32, err: &FeedIndexError) -> bool {
        err.is_deadlock() && attempt < self.max_attempts
    }
}

/// What happened to a batch handed to [`FeedUpdater::execute`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Export was skipped upstream; nothing written.
    Skipped,
    Written {
        inserted: usize,
        updated: usize,
        attempts: u32,
    },
    /// Logged and dropped.
    Failed { attempts: u32 },
}

/// Splits rows into inserts and updates and writes them with bounded retry.
#[derive(Clone)]
pub struct FeedUpdater {
    conn: Arc<dyn FeedConnection>,
    retry: UpdateRetryPolicy,
}

impl FeedUpdater {
    pub fn new(conn: Arc<dyn FeedConnection>) -> Self {
        Self {
            conn,
            retry: UpdateRetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: UpdateRetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub async fn execute(
        &self,
        rows: Vec<FeedRow>,
        status: &ExportStatus,
        meta: &FeedIndexMetadata,
    ) -> UpdateOutcome {
        if status.is_skipped() {
            debug!(feed = %meta.feed_name, rows = rows.len(), "export skipped, nothing to persist");
            return UpdateOutcome::Skipped;
        }

        // Last row wins when the same key shows up twice in one batch.
        let mut by_key: BTreeMap<RowKey, FeedRow> = BTreeMap::new();
        for mut row in rows {
            row.status = status.code();
            row.errors = status.errors();
            by_key.insert(row.key(), row);
        }
        let rows: Vec<FeedRow> = by_key.into_values().collect();
        let table = FeedTable::from_metadata(meta);

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.write(&table, &rows, meta).await {
                Ok((inserted, updated)) => {
                    debug!(feed = %meta.feed_name, inserted, updated, attempt, "feed batch written");
                    return UpdateOutcome::Written {
                        inserted,
                        updated,
                        attempts: attempt,
                    };
                }
                Err(e) if self.retry.should_retry(attempt, &e) => {
                    warn!(feed = %meta.feed_name, attempt, error = %e, "lock conflict, retrying feed batch");
                    if !self.retry.backoff.is_zero() {
                        tokio::time::sleep(self.retry.backoff).await;
                    }
                }
                Err(e) => {
                    let source_ids: Vec<i64> = rows.iter().map(|r| r.source_id).collect();
                    let feed_ids: Vec<String> = rows.iter().map(|r| r.key().to_string()).collect();
                    error!(
                        feed = %meta.feed_name,
                        ?source_ids,
                        ?feed_ids,
                        error_kind = e.kind(),
                        error = %e,
                        attempts = attempt,
                        "feed batch could not be persisted"
                    );
                    return UpdateOutcome::Failed { attempts: attempt };
                }
            }
        }
    }

    async fn write(
        &self,
        table: &FeedTable,
        rows: &[FeedRow],
        meta: &FeedIndexMetadata,
    ) -> Result<(usize, usize), FeedIndexError> {
        let keys: Vec<RowKey> = rows.iter().map(FeedRow::key).collect();
        let existing = self.conn.existing_keys(table, &keys).await?;
        let (update, insert): (Vec<FeedRow>, Vec<FeedRow>) = rows
            .iter()
            .cloned()
            .partition(|r| existing.contains(&r.key()));

        if !update.is_empty() {
            self.conn
                .insert_on_duplicate(table, &update, &meta.feed_table_mutable_columns)
                .await?;
        }
        if !insert.is_empty() {
            self.conn.insert_array(table, &insert).await?;
        }
        Ok((insert.len(), update.len()))
    }
}
