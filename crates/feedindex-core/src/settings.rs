//! Startup configuration: feeds, view bindings and logging.
//!
//! ```yaml
//! log:
//!   level: info
//! feeds:
//!   - feed_name: products
//!     feed_identity: productId
//!     source_table_name: catalog_product_entity
//!     source_table_field: entity_id
//!     feed_table_name: catalog_data_exporter_products
//!     feed_table_field: source_entity_id
//!     batch_size: 500
//!     thread_count: 4
//! views:
//!   - view_id: catalog_data_exporter_products
//!     feed: products
//! ```

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::FeedIndexError;
use crate::logging::LogConfig;
use crate::materializer::{ActionRegistry, ViewAction};
use crate::metadata::FeedIndexMetadata;
use crate::resolver::ResolverRegistry;

/// Binds a change-log view to the feed that materializes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewBinding {
    pub view_id: String,
    pub feed: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeedIndexSettings {
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub feeds: Vec<FeedIndexMetadata>,
    #[serde(default)]
    pub views: Vec<ViewBinding>,
}

impl FeedIndexSettings {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, FeedIndexError> {
        serde_yaml::from_str(yaml).map_err(|e| FeedIndexError::Config(format!("invalid YAML settings: {e}")))
    }

    pub fn from_json_str(json: &str) -> Result<Self, FeedIndexError> {
        serde_json::from_str(json).map_err(|e| FeedIndexError::Config(format!("invalid JSON settings: {e}")))
    }

    /// Load a `.json` file as JSON and anything else as YAML.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, FeedIndexError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| FeedIndexError::Config(format!("cannot read {}: {e}", path.display())))?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&text),
            _ => Self::from_yaml_str(&text),
        }
    }

    pub fn feed(&self, name: &str) -> Option<&FeedIndexMetadata> {
        self.feeds.iter().find(|f| f.feed_name == name)
    }

    /// Startup checks: every feed is valid and uniquely named, every
    /// resolver is registered, every view binds a known feed exactly once.
    pub fn validate(&self, registry: &ResolverRegistry) -> Result<(), FeedIndexError> {
        let mut names = HashSet::new();
        for feed in &self.feeds {
            feed.validate()?;
            registry.validate(feed)?;
            if !names.insert(feed.feed_name.as_str()) {
                return Err(FeedIndexError::Config(format!(
                    "feed '{}' is defined twice",
                    feed.feed_name
                )));
            }
        }
        let mut views = HashSet::new();
        for view in &self.views {
            if !names.contains(view.feed.as_str()) {
                return Err(FeedIndexError::Config(format!(
                    "view '{}' is bound to unknown feed '{}'",
                    view.view_id, view.feed
                )));
            }
            if !views.insert(view.view_id.as_str()) {
                return Err(FeedIndexError::Config(format!(
                    "view '{}' is bound twice",
                    view.view_id
                )));
            }
        }
        Ok(())
    }

    /// Bind every configured view to the action of its feed. `actions` is
    /// keyed by feed name; a bound feed without an action is an error.
    pub fn action_registry(
        &self,
        actions: &HashMap<String, Arc<dyn ViewAction>>,
    ) -> Result<ActionRegistry, FeedIndexError> {
        let mut registry = ActionRegistry::new();
        for view in &self.views {
            let action = actions.get(&view.feed).ok_or_else(|| {
                FeedIndexError::Config(format!(
                    "view '{}' is bound to feed '{}', which has no indexer",
                    view.view_id, view.feed
                ))
            })?;
            registry.register(view.view_id.clone(), action.clone());
        }
        Ok(registry)
    }
}
