//! feedindex-core — incremental feed indexing over a relational store.
//!
//! # Architecture
//!
//! ```text
//! ViewMaterializer ── Changelog / ViewStateStore (host change-log)
//!        │ bounded channel, N workers
//!        ▼
//! FeedIndexer / ProductVariantFeedIndexer   (ViewAction)
//!        ├── EntityIdsProvider   (keyset id pages, affected-id resolvers)
//!        ├── FeedIndexProcessor  (create/update, create/update/delete)
//!        │      ├── ExportProcessor → DataSerializer (canonical JSON, hash)
//!        │      ├── IndexStateProvider → FeedSender → FeedUpdater (streaming)
//!        │      └── MarkRemovedEntities / DeletedEntitiesProvider
//!        └── FeedConnection      (memory / SQLite)
//! ```

pub mod builder;
pub mod changelog;
pub mod connection;
pub mod error;
pub mod export;
pub mod ids;
pub mod indexer;
pub mod logging;
pub mod materializer;
pub mod memory;
pub mod metadata;
pub mod processor;
pub mod removed;
pub mod resolver;
pub mod serializer;
pub mod settings;
pub mod state;
pub mod types;
pub mod updater;
pub mod variant;

pub use builder::FeedIndexMetadataBuilder;
pub use changelog::{
    Changelog, ChangelogBatchWalker, MemoryChangelog, MemoryViewStore, ViewState, ViewStateStore,
    ViewStatus,
};
pub use connection::{FeedConnection, FeedTable, KeysetQuery, OrphanPredicate, OrphanScope, StoredHash};
pub use error::FeedIndexError;
pub use export::{ExportProcessor, FeedSender};
pub use ids::{AllIdsResolver, EntityIdsProvider, IdBatches};
pub use indexer::FeedIndexer;
pub use logging::{init_tracing, LogConfig};
pub use materializer::{ActionRegistry, MaterializeReport, ViewAction, ViewMaterializer};
pub use memory::MemoryConnection;
pub use metadata::{FeedIndexMetadata, IdentityColumn};
pub use processor::{CreateUpdateDeleteProcessor, CreateUpdateProcessor, FeedIndexProcessor, ReindexStats};
pub use removed::{DeletedEntitiesProvider, MarkRemovedEntities, Reconciliation};
pub use resolver::{AffectedIdsResolver, AffectedIdsResolverPool, NamedQueryResolver, ResolverRegistry};
pub use serializer::DataSerializer;
pub use settings::{FeedIndexSettings, ViewBinding};
pub use state::IndexStateProvider;
pub use types::{EntityId, ExportStatus, FeedRow, IdBatch, RowKey};
pub use updater::{FeedUpdater, UpdateOutcome, UpdateRetryPolicy};
pub use variant::{ProductVariantFeedIndexer, VariantRelation};
