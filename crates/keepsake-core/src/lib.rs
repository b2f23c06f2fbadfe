//! # Keepsake Core
//!
//! Persistent semantic-memory engine. Ingests short text memories with tags
//! and typed metadata, embeds them into dense vectors, and serves semantic,
//! lexical, tag, and time-range queries. The hard core is the hybrid
//! storage engine:
//!
//! - **Embedded primary**: SQLite rows + FTS5 + HNSW vector index, the
//!   authoritative fast path for every read and write
//! - **Cloud secondary**: HTTP mirror over vector/relational/object services,
//!   durable and eventually consistent
//! - **Background sync**: operation queue with retry/backoff, capacity
//!   guarding, initial catch-up, drift detection, and anti-resurrection
//! - **Consolidation**: dream-inspired maintenance that recomputes relevance,
//!   discovers typed associations, clusters and compresses, and forgets
//!   under explicit time horizons
//! - **Self-care**: periodic integrity checks with WAL auto-repair and
//!   emergency export, plus online-backup snapshots
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use keepsake_core::{
//!     config::SqliteConfig, embeddings::FallbackEmbedder,
//!     Memory, MemoryStorage, SqliteStorage,
//! };
//!
//! let storage = Arc::new(SqliteStorage::new(
//!     SqliteConfig::default(),
//!     Arc::new(FallbackEmbedder::default()),
//! )?);
//! storage.initialize().await?;
//!
//! let memory = Memory::new("meeting notes", vec!["work".into()], None);
//! let (ok, message) = storage.store(&memory).await?;
//!
//! let results = storage.retrieve("meeting", 5).await?;
//! ```
//!
//! ## Feature Flags
//!
//! - `embeddings` (default): local embedding generation with fastembed
//! - `vector-search` (default): HNSW vector search with USearch
//! - `bundled-sqlite` (default): compile SQLite into the binary
//! - `full`: everything

#![cfg_attr(docsrs, feature(doc_cfg))]
// Only warn about missing docs for public items exported from the crate root
// Internal struct fields and enum variants don't need documentation
#![warn(rustdoc::missing_crate_level_docs)]

// ============================================================================
// MODULES
// ============================================================================

pub mod backup;
pub mod config;
pub mod consolidation;
pub mod embeddings;
pub mod integrity;
pub mod memory;
pub mod ontology;
pub mod search;
pub mod split;
pub mod storage;
pub mod tags;
pub mod timeparse;

// ============================================================================
// PUBLIC API RE-EXPORTS
// ============================================================================

// Memory model
pub use memory::{
    generate_content_hash, Memory, MemoryQueryResult, Metadata, MetadataValue,
};

// Ontology
pub use ontology::RelationshipType;

// Storage layer
pub use storage::{
    DeleteOutcome, DeleteRequest, HybridStorage, MemoryStorage, MemoryUpdates, Result,
    SearchMode, SearchRequest, SearchResponse, SqliteStorage, StorageError, StorageStats,
    SyncStatus, TagCount, TagMatch,
};

// Hybrid sync machinery
pub use storage::hybrid::{
    BackgroundSyncService, CapacityLimits, DriftReport, ForceSyncReport, InitialSyncStatus,
    SyncOp, SyncOperation,
};

// Cloud secondary
pub use storage::cloud::{classify_error, CloudStorage, ErrorClass};

// Consolidation pipeline
pub use consolidation::{
    ConsolidationConfig, ConsolidationReport, Consolidator, RelevanceScore, TimeHorizon,
};

// Maintenance services
pub use backup::{BackupInfo, BackupService};
pub use integrity::{IntegrityCheckResult, IntegrityMonitor, IntegrityStatus};

// Embeddings
pub use embeddings::{cosine_similarity, Embedding, EmbeddingError, EmbeddingProvider};

#[cfg(feature = "embeddings")]
pub use embeddings::LocalEmbedder;
pub use embeddings::{FallbackEmbedder, RemoteEmbedder};

// Content splitting
pub use split::{estimate_chunks_needed, split_content, validate_chunk_lengths};

// ============================================================================
// VERSION INFO
// ============================================================================

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default local embedding model
pub const DEFAULT_EMBEDDING_MODEL: &str = "all-MiniLM-L6-v2";

// ============================================================================
// PRELUDE
// ============================================================================

/// Convenient imports for common usage
pub mod prelude {
    pub use crate::{
        DeleteRequest, HybridStorage, Memory, MemoryQueryResult, MemoryStorage, MemoryUpdates,
        MetadataValue, Result, SearchMode, SearchRequest, SqliteStorage, StorageError, TagMatch,
    };

    pub use crate::{ConsolidationConfig, Consolidator, TimeHorizon};

    pub use crate::{BackupService, IntegrityMonitor};

    pub use crate::{Embedding, EmbeddingProvider, FallbackEmbedder};

    #[cfg(feature = "embeddings")]
    pub use crate::LocalEmbedder;
}
