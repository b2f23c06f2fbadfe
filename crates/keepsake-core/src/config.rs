//! Engine configuration
//!
//! All tunables live in explicit config structs constructed at startup with
//! `from_env()`. Environment variables use the `KEEPSAKE_` prefix; every
//! field has a validated default so a bare environment still produces a
//! working local-only engine. Nothing here runs at import time.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Configuration error, fatal at initialization
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A variable was present but unparseable
    #[error("Invalid value for {var}: {value} ({reason})")]
    Invalid {
        /// Environment variable name
        var: String,
        /// Offending value
        value: String,
        /// Parse failure detail
        reason: String,
    },
    /// Cloud configuration was partially supplied
    #[error("Incomplete cloud configuration: missing {0}")]
    IncompleteCloud(String),
}

fn env_string(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(var: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match env_string(var) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            var: var.to_string(),
            value: raw,
            reason: e.to_string(),
        }),
    }
}

fn env_bool(var: &str, default: bool) -> Result<bool, ConfigError> {
    match env_string(var) {
        None => Ok(default),
        Some(raw) => match raw.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid {
                var: var.to_string(),
                value: raw,
                reason: "expected a boolean".to_string(),
            }),
        },
    }
}

// ============================================================================
// PRIMARY BACKEND
// ============================================================================

/// Primary embedded backend configuration
#[derive(Debug, Clone)]
pub struct SqliteConfig {
    /// Database file path
    pub db_path: PathBuf,
    /// Maximum content length accepted without splitting (None = unlimited)
    pub max_content_length: Option<usize>,
    /// Split oversized content into sibling chunks instead of rejecting
    pub auto_split: bool,
    /// Overlap carried between sibling chunks
    pub split_overlap: usize,
    /// Keyword weight for hybrid lexical + vector search
    pub hybrid_keyword_weight: f64,
    /// Semantic weight for hybrid lexical + vector search
    pub hybrid_semantic_weight: f64,
    /// Default quality weight for quality-boosted retrieval
    pub quality_boost_weight: f64,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            db_path: default_base_dir().join("keepsake.sqlite"),
            max_content_length: None,
            auto_split: true,
            split_overlap: 50,
            hybrid_keyword_weight: 0.3,
            hybrid_semantic_weight: 0.7,
            quality_boost_weight: 0.3,
        }
    }
}

/// Default on-disk base directory (platform data dir, `./keepsake` fallback)
pub fn default_base_dir() -> PathBuf {
    if let Some(dirs) = directories::ProjectDirs::from("io", "keepsake", "keepsake") {
        return dirs.data_dir().to_path_buf();
    }
    PathBuf::from(".keepsake")
}

// ============================================================================
// CLOUD SECONDARY
// ============================================================================

/// Cloud secondary backend configuration.
///
/// Provider capacity constants mirror the documented service limits; the
/// sync service's capacity guard consults them before every store.
#[derive(Debug, Clone)]
pub struct CloudConfig {
    /// API bearer token
    pub api_token: String,
    /// Account identifier
    pub account_id: String,
    /// Vector index name
    pub vector_index: String,
    /// Relational database identifier
    pub database_id: String,
    /// Object-store bucket for oversized content
    pub object_bucket: Option<String>,
    /// Embedding model the remote vector service expects
    pub embedding_model: String,
    /// Content at or above this many bytes moves to the object store
    pub large_content_threshold: usize,
    /// Per-operation retry budget for transient failures
    pub max_retries: u32,
    /// Base delay for exponential backoff
    pub base_delay: Duration,
    /// API origin, overridable for tests
    pub base_url: String,
    /// Hard vector-count limit of the provider
    pub max_vectors: u64,
    /// Metadata size limit per row, in kilobytes
    pub max_metadata_kb: usize,
    /// Percent of `max_vectors` at which warnings start
    pub warning_threshold_percent: f64,
    /// Percent of `max_vectors` at which new stores are refused
    pub critical_threshold_percent: f64,
}

impl CloudConfig {
    /// Read cloud configuration from `KEEPSAKE_CLOUD_*` variables.
    ///
    /// Returns `Ok(None)` when no cloud variables are set (local-only mode)
    /// and an error when the set is incomplete.
    pub fn from_env() -> Result<Option<Self>, ConfigError> {
        let api_token = env_string("KEEPSAKE_CLOUD_API_TOKEN");
        let account_id = env_string("KEEPSAKE_CLOUD_ACCOUNT_ID");
        let vector_index = env_string("KEEPSAKE_CLOUD_VECTOR_INDEX");
        let database_id = env_string("KEEPSAKE_CLOUD_DATABASE_ID");

        let any_set = [&api_token, &account_id, &vector_index, &database_id]
            .iter()
            .any(|v| v.is_some());
        if !any_set {
            return Ok(None);
        }

        let require = |name: &str, v: Option<String>| {
            v.ok_or_else(|| ConfigError::IncompleteCloud(name.to_string()))
        };

        Ok(Some(Self {
            api_token: require("KEEPSAKE_CLOUD_API_TOKEN", api_token)?,
            account_id: require("KEEPSAKE_CLOUD_ACCOUNT_ID", account_id)?,
            vector_index: require("KEEPSAKE_CLOUD_VECTOR_INDEX", vector_index)?,
            database_id: require("KEEPSAKE_CLOUD_DATABASE_ID", database_id)?,
            object_bucket: env_string("KEEPSAKE_CLOUD_OBJECT_BUCKET"),
            embedding_model: env_string("KEEPSAKE_CLOUD_EMBEDDING_MODEL")
                .unwrap_or_else(|| "@cf/baai/bge-base-en-v1.5".to_string()),
            large_content_threshold: env_parse("KEEPSAKE_CLOUD_LARGE_CONTENT_THRESHOLD", 16_384)?,
            max_retries: env_parse("KEEPSAKE_CLOUD_MAX_RETRIES", 3)?,
            base_delay: Duration::from_millis(env_parse("KEEPSAKE_CLOUD_BASE_DELAY_MS", 500)?),
            base_url: env_string("KEEPSAKE_CLOUD_BASE_URL")
                .unwrap_or_else(|| "https://api.cloud.invalid".to_string()),
            max_vectors: env_parse("KEEPSAKE_CLOUD_MAX_VECTORS", 5_000_000)?,
            max_metadata_kb: env_parse("KEEPSAKE_CLOUD_MAX_METADATA_KB", 10)?,
            warning_threshold_percent: env_parse("KEEPSAKE_CLOUD_WARNING_THRESHOLD", 80.0)?,
            critical_threshold_percent: env_parse("KEEPSAKE_CLOUD_CRITICAL_THRESHOLD", 95.0)?,
        }))
    }
}

// ============================================================================
// HYBRID ENGINE
// ============================================================================

/// Hybrid engine and background sync tuning
#[derive(Debug, Clone)]
pub struct HybridConfig {
    /// Periodic sync interval (health check, failed-op retry, capacity check)
    pub sync_interval: Duration,
    /// Queue drain cadence
    pub drain_interval: Duration,
    /// Operations drained per cycle
    pub batch_size: usize,
    /// Bounded queue depth; overflow falls back to inline processing
    pub max_queue_size: usize,
    /// Per-operation retry budget
    pub max_retries: u32,
    /// Run the initial catch-up sync after startup
    pub sync_on_startup: bool,
    /// Delay before the initial catch-up sync starts
    pub startup_delay: Duration,
    /// Initial-sync page size for cursor enumeration
    pub initial_sync_page_size: usize,
    /// Consecutive empty batches that end the initial sync (given ≥ 1 sync)
    pub max_empty_batches: usize,
    /// Candidates checked with zero syncs that end the initial sync
    pub min_check_count: usize,
    /// Enable periodic metadata drift detection
    pub drift_detection: bool,
    /// Drift scan interval
    pub drift_interval: Duration,
    /// Memories sampled per drift scan
    pub drift_batch_size: usize,
}

impl Default for HybridConfig {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(300),
            drain_interval: Duration::from_secs(5),
            batch_size: 50,
            max_queue_size: 1000,
            max_retries: 3,
            sync_on_startup: true,
            startup_delay: Duration::from_secs(2),
            initial_sync_page_size: 100,
            max_empty_batches: 20,
            min_check_count: 1000,
            drift_detection: false,
            drift_interval: Duration::from_secs(3600),
            drift_batch_size: 100,
        }
    }
}

impl HybridConfig {
    /// Read hybrid tuning from `KEEPSAKE_HYBRID_*` variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let d = Self::default();
        Ok(Self {
            sync_interval: Duration::from_secs(env_parse(
                "KEEPSAKE_HYBRID_SYNC_INTERVAL_SECS",
                d.sync_interval.as_secs(),
            )?),
            drain_interval: Duration::from_secs(env_parse(
                "KEEPSAKE_HYBRID_DRAIN_INTERVAL_SECS",
                d.drain_interval.as_secs(),
            )?),
            batch_size: env_parse("KEEPSAKE_HYBRID_BATCH_SIZE", d.batch_size)?,
            max_queue_size: env_parse("KEEPSAKE_HYBRID_MAX_QUEUE_SIZE", d.max_queue_size)?,
            max_retries: env_parse("KEEPSAKE_HYBRID_MAX_RETRIES", d.max_retries)?,
            sync_on_startup: env_bool("KEEPSAKE_HYBRID_SYNC_ON_STARTUP", d.sync_on_startup)?,
            startup_delay: Duration::from_secs(env_parse(
                "KEEPSAKE_HYBRID_STARTUP_DELAY_SECS",
                d.startup_delay.as_secs(),
            )?),
            initial_sync_page_size: env_parse(
                "KEEPSAKE_HYBRID_INITIAL_SYNC_PAGE_SIZE",
                d.initial_sync_page_size,
            )?,
            max_empty_batches: env_parse(
                "KEEPSAKE_HYBRID_MAX_EMPTY_BATCHES",
                d.max_empty_batches,
            )?,
            min_check_count: env_parse("KEEPSAKE_HYBRID_MIN_CHECK_COUNT", d.min_check_count)?,
            drift_detection: env_bool("KEEPSAKE_HYBRID_SYNC_UPDATES", d.drift_detection)?,
            drift_interval: Duration::from_secs(env_parse(
                "KEEPSAKE_HYBRID_DRIFT_INTERVAL_SECS",
                d.drift_interval.as_secs(),
            )?),
            drift_batch_size: env_parse("KEEPSAKE_HYBRID_DRIFT_BATCH_SIZE", d.drift_batch_size)?,
        })
    }
}

// ============================================================================
// EMBEDDINGS
// ============================================================================

/// Remote OpenAI-style embedding endpoint configuration
#[derive(Debug, Clone)]
pub struct RemoteEmbeddingConfig {
    /// Endpoint URL (same shape as `/v1/embeddings`)
    pub url: String,
    /// Model name to request
    pub model: String,
    /// Bearer token, if the endpoint requires one
    pub api_key: Option<String>,
}

impl RemoteEmbeddingConfig {
    /// Read remote-embedding settings; `None` when no URL is configured
    pub fn from_env() -> Option<Self> {
        let url = env_string("KEEPSAKE_EMBEDDING_URL")?;
        Some(Self {
            url,
            model: env_string("KEEPSAKE_EMBEDDING_MODEL")
                .unwrap_or_else(|| "text-embedding-3-small".to_string()),
            api_key: env_string("KEEPSAKE_EMBEDDING_API_KEY"),
        })
    }
}

// ============================================================================
// MAINTENANCE SERVICES
// ============================================================================

/// Integrity monitor configuration
#[derive(Debug, Clone)]
pub struct IntegrityConfig {
    /// Whether the periodic monitor runs at all
    pub enabled: bool,
    /// Check interval
    pub interval: Duration,
}

impl Default for IntegrityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(30 * 60),
        }
    }
}

impl IntegrityConfig {
    /// Read integrity settings from `KEEPSAKE_INTEGRITY_*` variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let d = Self::default();
        Ok(Self {
            enabled: env_bool("KEEPSAKE_INTEGRITY_CHECK_ENABLED", d.enabled)?,
            interval: Duration::from_secs(env_parse(
                "KEEPSAKE_INTEGRITY_CHECK_INTERVAL_SECS",
                d.interval.as_secs(),
            )?),
        })
    }
}

/// Backup scheduler configuration
#[derive(Debug, Clone)]
pub struct BackupConfig {
    /// Whether periodic backups run
    pub enabled: bool,
    /// Snapshot interval
    pub interval: Duration,
    /// Newest snapshots retained by the sweep
    pub retention: usize,
    /// Directory snapshots are written to
    pub backup_dir: PathBuf,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(6 * 3600),
            retention: 7,
            backup_dir: default_base_dir().join("backups"),
        }
    }
}

impl BackupConfig {
    /// Read backup settings from `KEEPSAKE_BACKUP_*` variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let d = Self::default();
        Ok(Self {
            enabled: env_bool("KEEPSAKE_BACKUP_ENABLED", d.enabled)?,
            interval: Duration::from_secs(env_parse(
                "KEEPSAKE_BACKUP_INTERVAL_SECS",
                d.interval.as_secs(),
            )?),
            retention: env_parse("KEEPSAKE_BACKUP_RETENTION", d.retention)?,
            backup_dir: env_string("KEEPSAKE_BACKUP_DIR")
                .map(PathBuf::from)
                .unwrap_or(d.backup_dir),
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================
