//! Host change-log and view-state contracts.
//!
//! The host records every changed id in a per-view change-log under a
//! monotonically increasing version. Each view remembers the last version it
//! materialized and a status; [`ViewMaterializer`](crate::materializer::ViewMaterializer)
//! moves it `idle → working → idle | suspended`.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::FeedIndexError;
use crate::types::{EntityId, IdBatch};

// ─── ViewState ────────────────────────────────────────────────────────────────

/// Runtime status of a materialized view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViewStatus {
    Idle,
    Working,
    Suspended,
}

impl std::fmt::Display for ViewStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Working => write!(f, "working"),
            Self::Suspended => write!(f, "suspended"),
        }
    }
}

impl std::str::FromStr for ViewStatus {
    type Err = FeedIndexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "working" => Ok(Self::Working),
            "suspended" => Ok(Self::Suspended),
            other => Err(FeedIndexError::Storage(format!("unknown view status '{other}'"))),
        }
    }
}

/// Persisted state of one view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewState {
    pub view_id: String,
    pub enabled: bool,
    pub status: ViewStatus,
    /// Last change-log version fully materialized.
    pub version_id: u64,
    /// Unix timestamp of the last save.
    pub updated_at: i64,
}

impl ViewState {
    /// State of a view that has never run.
    pub fn new(view_id: impl Into<String>) -> Self {
        Self {
            view_id: view_id.into(),
            enabled: true,
            status: ViewStatus::Idle,
            version_id: 0,
            updated_at: 0,
        }
    }
}

/// Storage for [`ViewState`] records.
///
/// Reads and writes are not atomic with respect to each other: at most one
/// materialization per view may run at a time.
#[async_trait]
pub trait ViewStateStore: Send + Sync {
    /// Load a view's state; a view never saved loads as [`ViewState::new`].
    async fn load(&self, view_id: &str) -> Result<ViewState, FeedIndexError>;

    async fn save(&self, state: &ViewState) -> Result<(), FeedIndexError>;
}

// ─── Changelog ────────────────────────────────────────────────────────────────

/// Read side of the host change-log.
///
/// Every method fails with [`FeedIndexError::ChangelogMissing`] when the
/// view's change-log table does not exist.
#[async_trait]
pub trait Changelog: Send + Sync {
    /// Highest recorded version.
    async fn version(&self, view_id: &str) -> Result<u64, FeedIndexError>;

    /// Distinct ids changed in versions `(from, to]`.
    async fn count_changed(&self, view_id: &str, from: u64, to: u64) -> Result<u64, FeedIndexError>;

    /// Distinct ids changed in `(from, to]`, greater than `after`, ascending,
    /// at most `limit`.
    async fn changed_ids_after(
        &self,
        view_id: &str,
        from: u64,
        to: u64,
        after: Option<EntityId>,
        limit: usize,
    ) -> Result<Vec<EntityId>, FeedIndexError>;
}

/// Keyset walk over the ids changed between two versions.
pub struct ChangelogBatchWalker {
    changelog: Arc<dyn Changelog>,
    view_id: String,
    from: u64,
    to: u64,
    batch_size: usize,
    after: Option<EntityId>,
    exhausted: bool,
}

impl ChangelogBatchWalker {
    pub fn new(
        changelog: Arc<dyn Changelog>,
        view_id: impl Into<String>,
        from: u64,
        to: u64,
        batch_size: usize,
    ) -> Self {
        Self {
            changelog,
            view_id: view_id.into(),
            from,
            to,
            batch_size: batch_size.max(1),
            after: None,
            exhausted: from >= to,
        }
    }

    pub async fn next_batch(&mut self) -> Result<Option<IdBatch>, FeedIndexError> {
        if self.exhausted {
            return Ok(None);
        }
        let ids = self
            .changelog
            .changed_ids_after(&self.view_id, self.from, self.to, self.after, self.batch_size)
            .await?;
        match ids.last() {
            Some(&last) => {
                self.after = Some(last);
                Ok(Some(ids))
            }
            None => {
                self.exhausted = true;
                Ok(None)
            }
        }
    }
}

// ─── In-memory implementations ────────────────────────────────────────────────

/// In-memory change-log for tests and embedded hosts.
#[derive(Default)]
pub struct MemoryChangelog {
    tables: Mutex<HashMap<String, Vec<(u64, EntityId)>>>,
}

impl MemoryChangelog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<(u64, EntityId)>>> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create the change-log table of a view.
    pub fn create(&self, view_id: &str) {
        self.lock().entry(view_id.to_string()).or_default();
    }

    /// Record changed ids under the next version; returns that version.
    pub fn record(&self, view_id: &str, ids: &[EntityId]) -> u64 {
        let mut tables = self.lock();
        let log = tables.entry(view_id.to_string()).or_default();
        let version = log.last().map_or(0, |(v, _)| *v) + 1;
        log.extend(ids.iter().map(|id| (version, *id)));
        version
    }

    fn changed(&self, view_id: &str, from: u64, to: u64) -> Result<BTreeSet<EntityId>, FeedIndexError> {
        let tables = self.lock();
        let log = tables.get(view_id).ok_or_else(|| missing(view_id))?;
        Ok(log
            .iter()
            .filter(|(v, _)| *v > from && *v <= to)
            .map(|(_, id)| *id)
            .collect())
    }
}

fn missing(view_id: &str) -> FeedIndexError {
    FeedIndexError::ChangelogMissing {
        table: format!("{view_id}_cl"),
    }
}

#[async_trait]
impl Changelog for MemoryChangelog {
    async fn version(&self, view_id: &str) -> Result<u64, FeedIndexError> {
        let tables = self.lock();
        let log = tables.get(view_id).ok_or_else(|| missing(view_id))?;
        Ok(log.last().map_or(0, |(v, _)| *v))
    }

    async fn count_changed(&self, view_id: &str, from: u64, to: u64) -> Result<u64, FeedIndexError> {
        Ok(self.changed(view_id, from, to)?.len() as u64)
    }

    async fn changed_ids_after(
        &self,
        view_id: &str,
        from: u64,
        to: u64,
        after: Option<EntityId>,
        limit: usize,
    ) -> Result<Vec<EntityId>, FeedIndexError> {
        Ok(self
            .changed(view_id, from, to)?
            .into_iter()
            .filter(|id| after.map_or(true, |a| *id > a))
            .take(limit)
            .collect())
    }
}

/// In-memory view-state store.
#[derive(Default)]
pub struct MemoryViewStore {
    states: Mutex<HashMap<String, ViewState>>,
}

impl MemoryViewStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ViewStateStore for MemoryViewStore {
    async fn load(&self, view_id: &str) -> Result<ViewState, FeedIndexError> {
        let states = self
            .states
            .lock()
            .map_err(|_| FeedIndexError::Storage("view store lock poisoned".into()))?;
        Ok(states
            .get(view_id)
            .cloned()
            .unwrap_or_else(|| ViewState::new(view_id)))
    }

    async fn save(&self, state: &ViewState) -> Result<(), FeedIndexError> {
        let mut saved = state.clone();
        saved.updated_at = chrono::Utc::now().timestamp();
        self.states
            .lock()
            .map_err(|_| FeedIndexError::Storage("view store lock poisoned".into()))?
            .insert(state.view_id.clone(), saved);
        Ok(())
    }
}
