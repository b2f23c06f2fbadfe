//! Dream-inspired consolidation pipeline
//!
//! A scheduled maintenance engine that recomputes relevance scores, discovers
//! typed associations, clusters and compresses related memories, and forgets
//! low-relevance ones under explicit time horizons. Within a horizon the
//! phases run in order: score, cluster, associate, compress, forget.

mod associations;
mod clustering;
mod compression;
mod consolidator;
mod decay;
mod forgetting;
mod health;

pub use associations::{AssociationEngine, DiscoveredAssociation, RelationshipInference};
pub use clustering::{ClusteringAlgorithm, ClusteringEngine, MemoryCluster};
pub use compression::{CompressionEngine, CompressionResult};
pub use consolidator::{ConsolidationReport, Consolidator};
pub use decay::{DecayCalculator, RelevanceScore};
pub use forgetting::{ForgettingAction, ForgettingDecision, ForgettingEngine};
pub use health::{ConsolidationAlert, ConsolidationHealth, HealthSummary, PhaseRecord};

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

// ============================================================================
// TIME HORIZONS
// ============================================================================

/// Consolidation cadence selecting a workload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeHorizon {
    /// Memories from the last two days
    Daily,
    /// All memories
    Weekly,
    /// All memories
    Monthly,
    /// Memories at least 90 days old
    Quarterly,
    /// Memories at least 365 days old
    Yearly,
}

/// A pipeline phase, for gating and health records
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Decay-based relevance scoring
    Scoring,
    /// Semantic clustering
    Clustering,
    /// Creative association discovery
    Associations,
    /// Cluster compression
    Compression,
    /// Controlled forgetting
    Forgetting,
}

impl Phase {
    /// Phase name for logs and health records
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Scoring => "scoring",
            Phase::Clustering => "clustering",
            Phase::Associations => "associations",
            Phase::Compression => "compression",
            Phase::Forgetting => "forgetting",
        }
    }
}

impl TimeHorizon {
    /// All horizons, scheduling order
    pub const ALL: [TimeHorizon; 5] = [
        TimeHorizon::Daily,
        TimeHorizon::Weekly,
        TimeHorizon::Monthly,
        TimeHorizon::Quarterly,
        TimeHorizon::Yearly,
    ];

    /// Horizon name
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeHorizon::Daily => "daily",
            TimeHorizon::Weekly => "weekly",
            TimeHorizon::Monthly => "monthly",
            TimeHorizon::Quarterly => "quarterly",
            TimeHorizon::Yearly => "yearly",
        }
    }

    /// Parse a horizon name
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "daily" => Some(TimeHorizon::Daily),
            "weekly" => Some(TimeHorizon::Weekly),
            "monthly" => Some(TimeHorizon::Monthly),
            "quarterly" => Some(TimeHorizon::Quarterly),
            "yearly" => Some(TimeHorizon::Yearly),
            _ => None,
        }
    }

    /// Whether a phase runs on this horizon. Scoring runs everywhere;
    /// forgetting only on the long horizons.
    pub fn phase_enabled(&self, phase: Phase) -> bool {
        use TimeHorizon::*;
        match phase {
            Phase::Scoring => true,
            Phase::Clustering => matches!(self, Weekly | Monthly | Quarterly),
            Phase::Associations => matches!(self, Weekly | Monthly),
            Phase::Compression => matches!(self, Weekly | Monthly | Quarterly),
            Phase::Forgetting => matches!(self, Monthly | Quarterly | Yearly),
        }
    }

    /// Candidate window as `(recent_window_days, min_age_days)`.
    /// Daily looks at a recent window only; quarterly/yearly look at old
    /// memories only; weekly/monthly consider everything.
    pub fn window(&self) -> (Option<f64>, Option<f64>) {
        match self {
            TimeHorizon::Daily => (Some(2.0), None),
            TimeHorizon::Weekly | TimeHorizon::Monthly => (None, None),
            TimeHorizon::Quarterly => (None, Some(90.0)),
            TimeHorizon::Yearly => (None, Some(365.0)),
        }
    }
}

impl std::fmt::Display for TimeHorizon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// CONFIGURATION
// ============================================================================

/// How discovered associations are persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssociationStorageMode {
    /// Store as memories only (legacy compatible)
    MemoriesOnly,
    /// Store in both memories and the graph table
    #[default]
    DualWrite,
    /// Store in the graph table only
    GraphOnly,
}

/// Consolidation pipeline configuration
#[derive(Debug, Clone)]
pub struct ConsolidationConfig {
    /// Where forgotten memories are archived before deletion
    pub archive_path: PathBuf,
    /// Process oldest-unconsolidated batches instead of everything
    pub incremental_mode: bool,
    /// Batch size in incremental mode
    pub batch_size: usize,
    /// Retention periods by base memory type, in days
    pub retention_periods: BTreeMap<String, f64>,
    /// Fallback retention period, days
    pub default_retention_days: f64,

    /// Discover creative associations
    pub associations_enabled: bool,
    /// Similarity floor for candidate pairs
    pub min_similarity: f64,
    /// Similarity ceiling (near-duplicates are not interesting links)
    pub max_similarity: f64,
    /// Pair evaluations per run (sampling cap)
    pub max_pairs_per_run: usize,
    /// Confidence below this falls back to `related`
    pub min_inference_confidence: f64,
    /// Where associations are written
    pub association_storage_mode: AssociationStorageMode,

    /// Cluster semantically close memories
    pub clustering_enabled: bool,
    /// Clustering algorithm
    pub clustering_algorithm: ClusteringAlgorithm,
    /// Minimum members for a cluster to survive
    pub min_cluster_size: usize,
    /// Cosine similarity threshold for cluster membership
    pub cluster_similarity_threshold: f64,

    /// Compress clusters into summary memories
    pub compression_enabled: bool,
    /// Maximum compressed summary length, characters
    pub max_summary_length: usize,

    /// Forget low-relevance memories
    pub forgetting_enabled: bool,
    /// Relevance below this is a forgetting candidate
    pub relevance_threshold: f64,
    /// Days without access before forgetting applies
    pub access_threshold_days: f64,

    /// Boost quality of highly connected memories
    pub quality_boost_enabled: bool,
    /// Connections required for the boost
    pub min_connections_for_boost: usize,
    /// Multiplier applied to quality (result clamped to 1.0)
    pub quality_boost_factor: f64,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        let mut retention_periods = BTreeMap::new();
        retention_periods.insert("critical".to_string(), 365.0);
        retention_periods.insert("reference".to_string(), 180.0);
        retention_periods.insert("decision".to_string(), 90.0);
        retention_periods.insert("learning".to_string(), 90.0);
        retention_periods.insert("observation".to_string(), 30.0);
        retention_periods.insert("temporary".to_string(), 7.0);

        Self {
            archive_path: crate::config::default_base_dir().join("archive"),
            incremental_mode: false,
            batch_size: 500,
            retention_periods,
            default_retention_days: 30.0,

            associations_enabled: true,
            min_similarity: 0.3,
            max_similarity: 0.7,
            max_pairs_per_run: 100,
            min_inference_confidence: 0.6,
            association_storage_mode: AssociationStorageMode::default(),

            clustering_enabled: true,
            clustering_algorithm: ClusteringAlgorithm::Dbscan,
            min_cluster_size: 5,
            cluster_similarity_threshold: 0.75,

            compression_enabled: true,
            max_summary_length: 500,

            forgetting_enabled: true,
            relevance_threshold: 0.1,
            access_threshold_days: 90.0,

            quality_boost_enabled: true,
            min_connections_for_boost: 3,
            quality_boost_factor: 1.2,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
