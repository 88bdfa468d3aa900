//! Affected-ids resolvers and their registry.
//!
//! A resolver expands a change-set into the ids of other entities whose feed
//! rows depend on it (e.g. a parent product into its variants). Resolvers are
//! registered by name in an explicitly constructed [`ResolverRegistry`]; each
//! feed names the resolvers it uses, and [`AffectedIdsResolverPool::for_feed`]
//! rejects unknown names before any indexing starts.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::connection::FeedConnection;
use crate::error::FeedIndexError;
use crate::metadata::FeedIndexMetadata;
use crate::types::EntityId;

/// Expands a set of changed ids into additional affected ids.
#[async_trait]
pub trait AffectedIdsResolver: Send + Sync {
    /// Registry name (as referenced by `FeedIndexMetadata::affected_id_resolvers`).
    fn name(&self) -> &str;

    async fn affected_ids(
        &self,
        conn: &dyn FeedConnection,
        ids: &[EntityId],
    ) -> Result<Vec<EntityId>, FeedIndexError>;
}

/// Resolver backed by a named, parameterized query on the connection.
pub struct NamedQueryResolver {
    name: String,
    query_name: String,
}

impl NamedQueryResolver {
    pub fn new(name: impl Into<String>, query_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            query_name: query_name.into(),
        }
    }
}

#[async_trait]
impl AffectedIdsResolver for NamedQueryResolver {
    fn name(&self) -> &str {
        &self.name
    }

    async fn affected_ids(
        &self,
        conn: &dyn FeedConnection,
        ids: &[EntityId],
    ) -> Result<Vec<EntityId>, FeedIndexError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        conn.select_named(&self.query_name, ids).await
    }
}

/// Named set of resolver implementations.
#[derive(Default, Clone)]
pub struct ResolverRegistry {
    resolvers: HashMap<String, Arc<dyn AffectedIdsResolver>>,
}

impl ResolverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a resolver under its own name. A later registration with the
    /// same name replaces the earlier one.
    pub fn register(&mut self, resolver: Arc<dyn AffectedIdsResolver>) -> &mut Self {
        self.resolvers.insert(resolver.name().to_string(), resolver);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn AffectedIdsResolver>> {
        self.resolvers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.resolvers.contains_key(name)
    }

    /// Check that every resolver named by `meta` is registered.
    pub fn validate(&self, meta: &FeedIndexMetadata) -> Result<(), FeedIndexError> {
        match meta
            .affected_id_resolvers
            .iter()
            .find(|name| !self.contains(name))
        {
            Some(name) => Err(FeedIndexError::UnknownResolver {
                feed: meta.feed_name.clone(),
                name: name.clone(),
            }),
            None => Ok(()),
        }
    }
}

/// The ordered resolvers of one feed.
pub struct AffectedIdsResolverPool {
    feed: String,
    resolvers: Vec<Arc<dyn AffectedIdsResolver>>,
}

impl AffectedIdsResolverPool {
    /// Resolve the feed's resolver names against `registry`.
    pub fn for_feed(
        meta: &FeedIndexMetadata,
        registry: &ResolverRegistry,
    ) -> Result<Self, FeedIndexError> {
        let resolvers = meta
            .affected_id_resolvers
            .iter()
            .map(|name| {
                registry
                    .get(name)
                    .ok_or_else(|| FeedIndexError::UnknownResolver {
                        feed: meta.feed_name.clone(),
                        name: name.clone(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            feed: meta.feed_name.clone(),
            resolvers,
        })
    }

    pub fn len(&self) -> usize {
        self.resolvers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resolvers.is_empty()
    }

    /// `ids` followed by each resolver's output, in resolver order.
    ///
    /// Duplicates are kept: writes downstream are idempotent upserts.
    pub async fn affected_ids(
        &self,
        conn: &dyn FeedConnection,
        ids: &[EntityId],
    ) -> Result<Vec<EntityId>, FeedIndexError> {
        let mut all = ids.to_vec();
        for resolver in &self.resolvers {
            let extra = resolver.affected_ids(conn, ids).await?;
            debug!(
                feed = %self.feed,
                resolver = resolver.name(),
                input = ids.len(),
                resolved = extra.len(),
                "affected ids resolved"
            );
            all.extend(extra);
        }
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryConnection;

    fn meta_with(resolvers: &[&str]) -> FeedIndexMetadata {
        FeedIndexMetadata {
            affected_id_resolvers: resolvers.iter().map(|r| r.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn unknown_resolver_fails_at_construction() {
        let registry = ResolverRegistry::new();
        let err = AffectedIdsResolverPool::for_feed(&meta_with(&["children"]), &registry)
            .err()
            .unwrap();
        assert!(matches!(err, FeedIndexError::UnknownResolver { ref name, .. } if name == "children"));
        assert!(registry.validate(&meta_with(&["children"])).is_err());
    }

    #[tokio::test]
    async fn resolvers_concatenate_in_order_without_dedup() {
        let conn = MemoryConnection::new();
        conn.register_named_query("children", Arc::new(|ids: &[EntityId]| ids.iter().map(|i| i * 10).collect()));
        conn.register_named_query("self", Arc::new(|ids: &[EntityId]| ids.to_vec()));

        let mut registry = ResolverRegistry::new();
        registry
            .register(Arc::new(NamedQueryResolver::new("children", "children")))
            .register(Arc::new(NamedQueryResolver::new("echo", "self")));

        let pool =
            AffectedIdsResolverPool::for_feed(&meta_with(&["children", "echo"]), &registry).unwrap();
        assert_eq!(pool.len(), 2);
        let ids = pool.affected_ids(&conn, &[1, 2]).await.unwrap();
        assert_eq!(ids, vec![1, 2, 10, 20, 1, 2]);
    }

    #[tokio::test]
    async fn empty_pool_passes_ids_through() {
        let conn = MemoryConnection::new();
        let pool =
            AffectedIdsResolverPool::for_feed(&meta_with(&[]), &ResolverRegistry::new()).unwrap();
        assert!(pool.is_empty());
        assert_eq!(pool.affected_ids(&conn, &[3]).await.unwrap(), vec![3]);
    }
}
