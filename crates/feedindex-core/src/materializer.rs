//! Concurrent materialization of a view from the host change-log.
//!
//! # Run lifecycle
//!
//! ```text
//! load state ─► idle & enabled? ─► changelog ahead? ─► claim (working)
//!     ─► producer: retry queue, then ChangelogBatchWalker ─► bounded channel
//!     ─► N workers ─► ViewAction::execute(batch)
//!     ─► advance version, release (idle | suspended)
//! ```
//!
//! Every batch is received by exactly one worker. A batch that fails is logged
//! and parked in the view's retry queue; it never stops its worker. Anything
//! that escapes the per-batch boundary releases the view without advancing its
//! version and is returned to the caller.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::changelog::{Changelog, ChangelogBatchWalker, ViewStateStore, ViewStatus};
use crate::error::FeedIndexError;
use crate::metadata::FeedIndexMetadata;
use crate::types::{EntityId, IdBatch};

/// Work run for one batch of changed ids.
#[async_trait]
pub trait ViewAction: Send + Sync {
    /// Feed configuration; supplies batch size and worker count.
    fn metadata(&self) -> FeedIndexMetadata;

    async fn execute(&self, ids: &[EntityId]) -> Result<(), FeedIndexError>;
}

/// View id → action.
#[derive(Default, Clone)]
pub struct ActionRegistry {
    actions: HashMap<String, Arc<dyn ViewAction>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, view_id: impl Into<String>, action: Arc<dyn ViewAction>) -> &mut Self {
        self.actions.insert(view_id.into(), action);
        self
    }

    pub fn contains(&self, view_id: &str) -> bool {
        self.actions.contains_key(view_id)
    }

    pub fn get(&self, view_id: &str) -> Result<Arc<dyn ViewAction>, FeedIndexError> {
        self.actions
            .get(view_id)
            .cloned()
            .ok_or_else(|| FeedIndexError::UnmappedAction {
                view: view_id.to_string(),
            })
    }
}

/// Summary of one materialization run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaterializeReport {
    pub view_id: String,
    pub from_version: u64,
    pub to_version: u64,
    /// Batches handed to workers, replayed ones included.
    pub batches: usize,
    /// Batches taken from the retry queue of an earlier run.
    pub replayed: usize,
    pub failed_batches: usize,
    pub workers: usize,
    /// Status the view was left in.
    pub status: ViewStatus,
}

#[derive(Default)]
struct WorkerOutcome {
    processed: usize,
    failed: Vec<IdBatch>,
}

/// Drives views from their change-logs.
pub struct ViewMaterializer {
    states: Arc<dyn ViewStateStore>,
    changelog: Arc<dyn Changelog>,
    actions: ActionRegistry,
    retry_queue: Mutex<HashMap<String, Vec<IdBatch>>>,
    channel_capacity: usize,
}

impl ViewMaterializer {
    pub fn new(
        states: Arc<dyn ViewStateStore>,
        changelog: Arc<dyn Changelog>,
        actions: ActionRegistry,
    ) -> Self {
        Self {
            states,
            changelog,
            actions,
            retry_queue: Mutex::new(HashMap::new()),
            channel_capacity: 16,
        }
    }

    /// Bound on batches waiting between the producer and the workers.
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    /// Batches parked for the next run of `view_id`.
    pub fn pending_retries(&self, view_id: &str) -> Vec<IdBatch> {
        self.retry_queue
            .lock()
            .map(|q| q.get(view_id).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    fn take_retries(&self, view_id: &str) -> Vec<IdBatch> {
        self.retry_queue
            .lock()
            .map(|mut q| q.remove(view_id).unwrap_or_default())
            .unwrap_or_default()
    }

    fn park(&self, view_id: &str, batches: Vec<IdBatch>) {
        if batches.is_empty() {
            return;
        }
        let mut queue = self.retry_queue.lock().unwrap_or_else(|e| e.into_inner());
        queue.entry(view_id.to_string()).or_default().extend(batches);
    }

    /// Ask a view to stop after its current run. The status sticks until
    /// [`resume`](Self::resume).
    pub async fn request_suspend(&self, view_id: &str) -> Result<(), FeedIndexError> {
        let mut state = self.states.load(view_id).await?;
        state.status = ViewStatus::Suspended;
        self.states.save(&state).await?;
        info!(view = view_id, "view suspended");
        Ok(())
    }

    pub async fn resume(&self, view_id: &str) -> Result<(), FeedIndexError> {
        let mut state = self.states.load(view_id).await?;
        if state.status == ViewStatus::Suspended {
            state.status = ViewStatus::Idle;
            self.states.save(&state).await?;
            info!(view = view_id, "view resumed");
        }
        Ok(())
    }

    /// Run one materialization of `view_id`.
    ///
    /// Returns `Ok(None)` when there is nothing to do: the view is busy,
    /// suspended or disabled, its change-log is not ahead, or the change-log
    /// table does not exist.
    pub async fn materialize(&self, view_id: &str) -> Result<Option<MaterializeReport>, FeedIndexError> {
        let mut state = self.states.load(view_id).await?;
        if !state.enabled || state.status != ViewStatus::Idle {
            debug!(view = view_id, status = %state.status, enabled = state.enabled, "view not idle, skipping");
            return Ok(None);
        }

        let to_version = match self.changelog.version(view_id).await {
            Ok(v) => v,
            Err(FeedIndexError::ChangelogMissing { table }) => {
                debug!(view = view_id, table = %table, "changelog table missing, skipping");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        let from_version = state.version_id;
        let has_retries = !self.pending_retries(view_id).is_empty();
        if to_version <= from_version && !has_retries {
            debug!(view = view_id, version = from_version, "view up to date");
            return Ok(None);
        }

        state.status = ViewStatus::Working;
        self.states.save(&state).await?;
        let started = Instant::now();
        info!(view = view_id, from_version, to_version, "materialization started");

        let replay = self.take_retries(view_id);
        match self.run(view_id, from_version, to_version, &replay).await {
            Ok(mut report) => {
                let to = to_version.max(from_version);
                report.status = self.release(view_id, Some(to)).await?;
                info!(
                    view = view_id,
                    batches = report.batches,
                    failed = report.failed_batches,
                    workers = report.workers,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "materialization finished"
                );
                Ok(Some(report))
            }
            Err(e) => {
                error!(view = view_id, error = %e, error_kind = e.kind(), "materialization aborted");
                self.park(view_id, replay);
                if let Err(release_err) = self.release(view_id, None).await {
                    warn!(view = view_id, error = %release_err, "could not release view");
                }
                Err(escalate(view_id, e))
            }
        }
    }

    /// Leave `working`; a suspend requested meanwhile wins over `idle`.
    async fn release(&self, view_id: &str, version: Option<u64>) -> Result<ViewStatus, FeedIndexError> {
        let mut state = self.states.load(view_id).await?;
        if state.status != ViewStatus::Suspended {
            state.status = ViewStatus::Idle;
        }
        if let Some(v) = version {
            state.version_id = v;
        }
        self.states.save(&state).await?;
        Ok(state.status)
    }

    async fn run(
        &self,
        view_id: &str,
        from: u64,
        to: u64,
        replay: &[IdBatch],
    ) -> Result<MaterializeReport, FeedIndexError> {
        let action = self.actions.get(view_id)?;
        let meta = action.metadata();
        let batch_size = meta.batch_size.max(1);

        let changed = if to > from {
            self.changelog.count_changed(view_id, from, to).await? as usize
        } else {
            0
        };
        let batch_count = changed.div_ceil(batch_size) + replay.len();
        let workers = meta.thread_count.max(1).min(batch_count);
        let mut report = MaterializeReport {
            view_id: view_id.to_string(),
            from_version: from,
            to_version: to,
            batches: 0,
            replayed: replay.len(),
            failed_batches: 0,
            workers,
            status: ViewStatus::Working,
        };
        if workers == 0 {
            return Ok(report);
        }

        let (tx, rx) = mpsc::channel::<IdBatch>(self.channel_capacity);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let handles: Vec<_> = (0..workers)
            .map(|worker| {
                let rx = rx.clone();
                let action = action.clone();
                let view = view_id.to_string();
                tokio::spawn(async move { run_worker(worker, view, action, rx).await })
            })
            .collect();

        let produced = self.produce(view_id, from, to, batch_size, replay, &tx).await;
        drop(tx);

        let mut panicked = None;
        let mut failed = Vec::new();
        for joined in join_all(handles).await {
            match joined {
                Ok(outcome) => {
                    report.batches += outcome.processed + outcome.failed.len();
                    failed.extend(outcome.failed);
                }
                Err(e) => panicked = Some(e),
            }
        }
        report.failed_batches = failed.len();
        self.park(view_id, failed);

        produced?;
        if let Some(e) = panicked {
            return Err(FeedIndexError::Materialization {
                view: view_id.to_string(),
                reason: format!("worker task failed: {e}"),
            });
        }
        Ok(report)
    }

    /// Feed the channel: parked batches first, then the change-log delta.
    async fn produce(
        &self,
        view_id: &str,
        from: u64,
        to: u64,
        batch_size: usize,
        replay: &[IdBatch],
        tx: &mpsc::Sender<IdBatch>,
    ) -> Result<(), FeedIndexError> {
        let closed = || FeedIndexError::Materialization {
            view: view_id.to_string(),
            reason: "all workers stopped".into(),
        };
        for batch in replay {
            tx.send(batch.clone()).await.map_err(|_| closed())?;
        }
        let mut walker = ChangelogBatchWalker::new(self.changelog.clone(), view_id, from, to, batch_size);
        while let Some(batch) = walker.next_batch().await? {
            tx.send(batch).await.map_err(|_| closed())?;
        }
        Ok(())
    }
}

async fn run_worker(
    worker: usize,
    view: String,
    action: Arc<dyn ViewAction>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<IdBatch>>>,
) -> WorkerOutcome {
    let mut outcome = WorkerOutcome::default();
    loop {
        let next = rx.lock().await.recv().await;
        let Some(batch) = next else { break };
        match action.execute(&batch).await {
            Ok(()) => {
                outcome.processed += 1;
                debug!(view = %view, worker, ids = batch.len(), "batch materialized");
            }
            Err(e) => {
                error!(
                    view = %view,
                    worker,
                    ids = ?batch,
                    error_kind = e.kind(),
                    error = %e,
                    "batch failed, queued for retry"
                );
                outcome.failed.push(batch);
            }
        }
    }
    outcome
}

fn escalate(view_id: &str, err: FeedIndexError) -> FeedIndexError {
    if err.is_recoverable() {
        err
    } else {
        FeedIndexError::Materialization {
            view: view_id.to_string(),
            reason: err.to_string(),
        }
    }
}
