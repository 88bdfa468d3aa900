//! feedindex-storage — persistent backends for FeedIndex.
//!
//! Backends:
//! - in-memory lives in `feedindex_core::memory` (tests, no persistence)
//! - [`sqlite`] — SQLite via `sqlx`: feed tables, change-logs, view state
//!
//! SQLite lock conflicts (`SQLITE_BUSY`, `SQLITE_LOCKED`) surface as
//! `FeedIndexError::Deadlock`, which the feed updater retries.

#[cfg(feature = "sqlite")]
pub mod sql;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStorage;
