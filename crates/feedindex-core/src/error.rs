//! Error types for the feed indexing pipeline.

use thiserror::Error;

/// Errors that can occur while indexing, reconciling or materializing feeds.
#[derive(Debug, Error)]
pub enum FeedIndexError {
    #[error("Storage error: {0}")]
    Storage(String),

    /// Transient lock conflict reported by the backend (deadlock, busy, locked).
    #[error("Deadlock: {0}")]
    Deadlock(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Affected ids resolver '{name}' is not registered (feed '{feed}')")]
    UnknownResolver { feed: String, name: String },

    #[error("No indexer action mapped to view '{view}'")]
    UnmappedAction { view: String },

    /// The host change-log table does not exist (yet). Treated as a no-op.
    #[error("Changelog table '{table}' does not exist")]
    ChangelogMissing { table: String },

    #[error("Export processor failed for feed '{feed}': {reason}")]
    Export { feed: String, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Materialization of view '{view}' failed: {reason}")]
    Materialization { view: String, reason: String },

    #[error("{0}")]
    Other(String),
}

impl FeedIndexError {
    /// Returns `true` for transient lock conflicts that are worth one more attempt.
    pub fn is_deadlock(&self) -> bool {
        matches!(self, Self::Deadlock(_))
    }

    /// Returns `true` for configuration problems. These are never retried.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Self::Config(_) | Self::UnknownResolver { .. } | Self::UnmappedAction { .. }
        )
    }

    /// Returns `true` if the caller can re-run the operation later and expect
    /// it to converge (storage and lock failures, missing changelog).
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Storage(_)
                | Self::Deadlock(_)
                | Self::ChangelogMissing { .. }
                | Self::Materialization { .. }
        )
    }

    /// Short, stable name of the variant, used as `error_kind` in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Storage(_) => "storage",
            Self::Deadlock(_) => "deadlock",
            Self::Config(_) => "config",
            Self::UnknownResolver { .. } => "unknown_resolver",
            Self::UnmappedAction { .. } => "unmapped_action",
            Self::ChangelogMissing { .. } => "changelog_missing",
            Self::Export { .. } => "export",
            Self::Serialization(_) => "serialization",
            Self::Materialization { .. } => "materialization",
            Self::Other(_) => "other",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadlock_is_recoverable_not_config() {
        let err = FeedIndexError::Deadlock("lock wait".into());
        assert!(err.is_deadlock());
        assert!(err.is_recoverable());
        assert!(!err.is_config());
    }

    #[test]
    fn resolver_errors_are_config() {
        let err = FeedIndexError::UnknownResolver {
            feed: "products".into(),
            name: "missing".into(),
        };
        assert!(err.is_config());
        assert!(!err.is_recoverable());
        assert_eq!(err.kind(), "unknown_resolver");
    }
}
