//! Test harness for end-to-end scenarios
//!
//! Provides isolated storage instances over temporary directories, plus
//! fixture helpers for building memories with controlled ages and tags.

use std::sync::Arc;

use keepsake_core::config::SqliteConfig;
use keepsake_core::storage::inmem::InMemoryStorage;
use keepsake_core::{
    CapacityLimits, FallbackEmbedder, HybridStorage, Memory, MemoryStorage, SqliteStorage,
};
use tempfile::TempDir;

/// An isolated on-disk store that cleans up after itself
pub struct TestStore {
    /// The storage instance
    pub storage: Arc<SqliteStorage>,
    /// Database file path
    pub db_path: std::path::PathBuf,
    /// Kept alive so the directory survives the test
    pub temp_dir: TempDir,
}

impl TestStore {
    /// Create a fresh store in a temporary directory
    pub fn new() -> Self {
        Self::with_config(|config| config)
    }

    /// Create a fresh store with a customized config
    pub fn with_config(customize: impl FnOnce(SqliteConfig) -> SqliteConfig) -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp directory");
        let db_path = temp_dir.path().join("keepsake_test.sqlite");
        let config = customize(SqliteConfig {
            db_path: db_path.clone(),
            ..Default::default()
        });
        let storage = Arc::new(
            SqliteStorage::new(config, Arc::new(FallbackEmbedder::new(64)))
                .expect("failed to create test storage"),
        );
        Self {
            storage,
            db_path,
            temp_dir,
        }
    }
}

impl Default for TestStore {
    fn default() -> Self {
        Self::new()
    }
}

/// A hybrid engine over in-memory backends, for sync scenarios
pub struct TestHybrid {
    /// The hybrid engine
    pub hybrid: Arc<HybridStorage>,
    /// Direct handle to the secondary for assertions and fault injection
    pub secondary: Arc<InMemoryStorage>,
    /// Direct handle to the primary
    pub primary: Arc<InMemoryStorage>,
}

impl TestHybrid {
    /// Build and initialize a hybrid pair with fast test tuning
    pub async fn new() -> Self {
        let primary = Arc::new(InMemoryStorage::new());
        let secondary = Arc::new(InMemoryStorage::new());
        let config = keepsake_core::config::HybridConfig {
            sync_on_startup: false,
            ..Default::default()
        };
        let hybrid = Arc::new(HybridStorage::new(
            primary.clone() as Arc<dyn MemoryStorage>,
            Some(secondary.clone() as Arc<dyn MemoryStorage>),
            config,
            CapacityLimits::default(),
        ));
        hybrid.initialize().await.expect("hybrid init failed");
        Self {
            hybrid,
            secondary,
            primary,
        }
    }
}

/// Build a memory with tags
pub fn memory(content: &str, tags: &[&str]) -> Memory {
    Memory::new(content, tags.iter().map(|t| t.to_string()).collect(), None)
}

/// Build a memory created `age_days` ago, with access frozen at creation
pub fn aged_memory(content: &str, tags: &[&str], age_days: f64) -> Memory {
    let now = keepsake_core::memory::now_timestamp();
    let created = now - age_days * 86_400.0;
    let mut m = memory(content, tags).with_created_at(created);
    m.updated_at = created;
    m.updated_at_iso = keepsake_core::memory::iso_from_timestamp(created);
    m
}
