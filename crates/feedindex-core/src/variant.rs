//! Product variant feed.
//!
//! A variant row is keyed by `(child id, parent id)`. Ids come from the
//! parent-child relation table rather than the entity table, and a row is
//! orphaned either when the child entity is gone or when no relation row
//! links the child to the row's parent any more. The parent is compared by
//! its current entity id, resolved from the link id stored in the relation.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::connection::{FeedConnection, OrphanPredicate, OrphanScope};
use crate::error::FeedIndexError;
use crate::export::ExportProcessor;
use crate::ids::{AllIdsResolver, EntityIdsProvider};
use crate::indexer::FeedIndexer;
use crate::materializer::ViewAction;
use crate::metadata::FeedIndexMetadata;
use crate::processor::{CreateUpdateDeleteProcessor, CreateUpdateProcessor, ReindexStats};
use crate::removed::Reconciliation;
use crate::resolver::ResolverRegistry;
use crate::types::EntityId;

/// Where the parent-child links of variants live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantRelation {
    pub relation_table: String,
    /// Relation column holding the parent's link id.
    pub relation_parent_field: String,
    pub relation_child_field: String,
    /// Entity table of both parents and children.
    pub entity_table: String,
    pub entity_id_field: String,
    /// Entity column the relation's parent field points at.
    pub entity_link_field: String,
    /// Feed identity column holding the parent entity id.
    pub feed_parent_column: String,
}

impl Default for VariantRelation {
    fn default() -> Self {
        Self {
            relation_table: "catalog_product_super_link".into(),
            relation_parent_field: "parent_id".into(),
            relation_child_field: "product_id".into(),
            entity_table: "catalog_product_entity".into(),
            entity_id_field: "entity_id".into(),
            entity_link_field: "entity_id".into(),
            feed_parent_column: "parent_id".into(),
        }
    }
}

impl VariantRelation {
    pub fn predicate(&self, meta: &FeedIndexMetadata, scope: OrphanScope) -> OrphanPredicate {
        OrphanPredicate::DetachedVariant {
            feed_table: meta.feed_table_name.clone(),
            feed_child_field: meta.feed_table_field.clone(),
            feed_parent_field: self.feed_parent_column.clone(),
            relation_table: self.relation_table.clone(),
            relation_child_field: self.relation_child_field.clone(),
            relation_parent_field: self.relation_parent_field.clone(),
            entity_table: self.entity_table.clone(),
            entity_id_field: self.entity_id_field.clone(),
            entity_link_field: self.entity_link_field.clone(),
            scope,
        }
    }

    fn validate(&self, meta: &FeedIndexMetadata) -> Result<(), FeedIndexError> {
        let fields = [
            &self.relation_table,
            &self.relation_parent_field,
            &self.relation_child_field,
            &self.entity_table,
            &self.entity_id_field,
            &self.entity_link_field,
            &self.feed_parent_column,
        ];
        if fields.iter().any(|f| f.trim().is_empty()) {
            return Err(FeedIndexError::Config(format!(
                "feed '{}': variant relation has empty fields",
                meta.feed_name
            )));
        }
        if !meta
            .identity_columns
            .iter()
            .any(|c| c.column == self.feed_parent_column)
        {
            return Err(FeedIndexError::Config(format!(
                "feed '{}': parent column '{}' must be an identity column",
                meta.feed_name, self.feed_parent_column
            )));
        }
        Ok(())
    }
}

/// Variant feed: relation-driven ids and detached-variant reconciliation.
pub struct ProductVariantFeedIndexer {
    relation: VariantRelation,
    indexer: FeedIndexer,
}

impl ProductVariantFeedIndexer {
    /// The feed's source table is replaced by the relation table, scanned on
    /// its child column.
    pub fn new(
        mut meta: FeedIndexMetadata,
        relation: VariantRelation,
        conn: Arc<dyn FeedConnection>,
        registry: &ResolverRegistry,
        exporter: Arc<dyn ExportProcessor>,
    ) -> Result<Self, FeedIndexError> {
        relation.validate(&meta)?;
        meta.source_table_name = relation.relation_table.clone();
        meta.source_table_field = relation.relation_child_field.clone();
        meta.source_modified_field = None;

        let ids = EntityIdsProvider::new(conn.clone(), &meta, registry)?
            .with_all_ids(AllIdsResolver::distinct(conn.clone()));
        let processor = CreateUpdateDeleteProcessor::new(
            CreateUpdateProcessor::new(conn, exporter),
            Reconciliation::DetachedVariant(relation.clone()),
        );
        Ok(Self {
            indexer: FeedIndexer::new(meta, ids, Arc::new(processor))?,
            relation,
        })
    }

    pub fn relation(&self) -> &VariantRelation {
        &self.relation
    }

    pub fn metadata(&self) -> FeedIndexMetadata {
        self.indexer.metadata()
    }

    pub async fn execute_full(&self) -> Result<ReindexStats, FeedIndexError> {
        self.indexer.execute_full().await
    }

    pub async fn execute_list(&self, ids: &[EntityId]) -> Result<ReindexStats, FeedIndexError> {
        self.indexer.execute_list(ids).await
    }

    pub async fn execute_row(&self, id: EntityId) -> Result<ReindexStats, FeedIndexError> {
        self.indexer.execute_row(id).await
    }
}

#[async_trait]
impl ViewAction for ProductVariantFeedIndexer {
    fn metadata(&self) -> FeedIndexMetadata {
        self.indexer.metadata()
    }

    async fn execute(&self, ids: &[EntityId]) -> Result<(), FeedIndexError> {
        self.indexer.execute(ids).await.map(|_| ())
    }
}
