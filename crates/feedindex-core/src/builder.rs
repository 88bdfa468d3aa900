//! Fluent builder API for feed metadata.
//!
//! # Example
//!
//! ```rust
//! use feedindex_core::builder::FeedIndexMetadataBuilder;
//!
//! let meta = FeedIndexMetadataBuilder::new("prices")
//!     .source_table("catalog_product_entity", "entity_id")
//!     .feed_table("catalog_data_exporter_product_prices", "source_entity_id")
//!     .identity_column("website_code", "websiteCode")
//!     .batch_size(500)
//!     .thread_count(4)
//!     .exclude_from_hash("lowestPrice")
//!     .build()
//!     .unwrap();
//! assert_eq!(meta.key_columns(), vec!["source_entity_id", "website_code"]);
//! ```

use crate::error::FeedIndexError;
use crate::metadata::{FeedIndexMetadata, IdentityColumn};

/// Fluent builder for [`FeedIndexMetadata`].
#[derive(Default)]
pub struct FeedIndexMetadataBuilder {
    meta: FeedIndexMetadata,
}

impl FeedIndexMetadataBuilder {
    pub fn new(feed_name: impl Into<String>) -> Self {
        Self {
            meta: FeedIndexMetadata {
                feed_name: feed_name.into(),
                ..Default::default()
            },
        }
    }

    /// Payload field holding the source entity id.
    pub fn feed_identity(mut self, field: impl Into<String>) -> Self {
        self.meta.feed_identity = field.into();
        self
    }

    /// Set the live source table and its id column.
    pub fn source_table(mut self, table: impl Into<String>, field: impl Into<String>) -> Self {
        self.meta.source_table_name = table.into();
        self.meta.source_table_field = field.into();
        self
    }

    /// Modification-time column used by the reindex window.
    pub fn source_modified_field(mut self, field: impl Into<String>) -> Self {
        self.meta.source_modified_field = Some(field.into());
        self
    }

    /// Set the feed table and the column holding the source id.
    pub fn feed_table(mut self, table: impl Into<String>, field: impl Into<String>) -> Self {
        self.meta.feed_table_name = table.into();
        self.meta.feed_table_field = field.into();
        self
    }

    /// Add an extra natural-key column.
    pub fn identity_column(
        mut self,
        column: impl Into<String>,
        payload_field: impl Into<String>,
    ) -> Self {
        self.meta
            .identity_columns
            .push(IdentityColumn::new(column, payload_field));
        self
    }

    /// Replace the list of columns rewritten on upsert.
    pub fn mutable_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.meta.feed_table_mutable_columns = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.meta.batch_size = size;
        self
    }

    pub fn thread_count(mut self, n: usize) -> Self {
        self.meta.thread_count = n;
        self
    }

    /// Exclude a payload field from `feed_hash`.
    pub fn exclude_from_hash(mut self, field: impl Into<String>) -> Self {
        self.meta.exclude_from_hash_fields.push(field.into());
        self
    }

    /// Append a named affected-ids resolver.
    pub fn affected_ids_resolver(mut self, name: impl Into<String>) -> Self {
        self.meta.affected_id_resolvers.push(name.into());
        self
    }

    pub fn truncate_on_full_reindex(mut self, enabled: bool) -> Self {
        self.meta.truncate_on_full_reindex = enabled;
        self
    }

    pub fn export_immediately(mut self, enabled: bool) -> Self {
        self.meta.export_immediately = enabled;
        self
    }

    /// Validate and return the metadata.
    pub fn build(self) -> Result<FeedIndexMetadata, FeedIndexError> {
        self.meta.validate()?;
        Ok(self.meta)
    }
}
