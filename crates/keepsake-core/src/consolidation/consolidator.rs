//! Consolidation orchestrator
//!
//! Runs the full pipeline for a time horizon: score, cluster, associate,
//! compress, forget. Hybrid sync is paused for the duration and always
//! resumed, even when a phase fails. Phase errors are recorded on the report
//! without aborting the horizon.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::embeddings::EmbeddingProvider;
use crate::memory::{now_timestamp, Memory, MetadataValue};
use crate::storage::sqlite::{Association, SqliteStorage};
use crate::storage::{HybridStorage, MemoryStorage, Result, StorageError};

use super::associations::canonical_pair;
use super::{
    AssociationEngine, AssociationStorageMode, ClusteringEngine, CompressionEngine,
    ConsolidationConfig, ConsolidationHealth, DecayCalculator, ForgettingAction, ForgettingEngine,
    Phase, RelevanceScore, TimeHorizon,
};

/// Report returned by a consolidation run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsolidationReport {
    /// Horizon that ran
    pub horizon: String,
    /// Start time (UTC seconds)
    pub started_at: f64,
    /// End time (UTC seconds)
    pub ended_at: f64,
    /// Wall-clock duration
    pub duration_seconds: f64,
    /// Candidate memories processed
    pub memories_processed: usize,
    /// Clusters formed
    pub clusters_created: usize,
    /// New association edges stored
    pub associations_discovered: usize,
    /// Compressed summaries stored
    pub memories_compressed: usize,
    /// Memories archived or deleted by forgetting
    pub memories_archived: usize,
    /// Phase errors (non-fatal)
    pub errors: Vec<String>,
    /// Whether the run finished without errors
    pub success: bool,
}

/// Advisory pre-run analysis
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsolidationRecommendation {
    /// `no_action`, `optional`, or `consolidation_beneficial`
    pub recommendation: String,
    /// Reasoning lines
    pub reasons: Vec<String>,
    /// Candidate memory count
    pub memory_count: usize,
    /// Combined content size
    pub total_size_bytes: usize,
    /// Share of candidates older than 30 days
    pub old_memory_percentage: f64,
}

/// Pauses hybrid sync for a scope, always resuming on drop
struct SyncPauseGuard<'a> {
    hybrid: Option<&'a HybridStorage>,
}

impl<'a> SyncPauseGuard<'a> {
    fn new(hybrid: Option<&'a HybridStorage>) -> Self {
        if let Some(hybrid) = hybrid {
            hybrid.pause_sync();
        }
        Self { hybrid }
    }
}

impl Drop for SyncPauseGuard<'_> {
    fn drop(&mut self) {
        if let Some(hybrid) = self.hybrid {
            hybrid.resume_sync();
        }
    }
}

/// Dream-inspired consolidation engine
pub struct Consolidator {
    storage: Arc<dyn MemoryStorage>,
    embedder: Arc<dyn EmbeddingProvider>,
    /// Graph-table access when the primary is the embedded backend
    graph: Option<Arc<SqliteStorage>>,
    /// Sync pause/resume hook when running over a hybrid engine
    sync_control: Option<Arc<HybridStorage>>,
    config: ConsolidationConfig,
    decay: DecayCalculator,
    associations: AssociationEngine,
    clustering: ClusteringEngine,
    compression: CompressionEngine,
    forgetting: ForgettingEngine,
    health: Mutex<ConsolidationHealth>,
}

impl Consolidator {
    /// Create a consolidator over a storage backend.
    ///
    /// `graph` enables graph-table association storage; `sync_control`
    /// enables sync pause/resume around runs.
    pub fn new(
        storage: Arc<dyn MemoryStorage>,
        embedder: Arc<dyn EmbeddingProvider>,
        config: ConsolidationConfig,
        graph: Option<Arc<SqliteStorage>>,
        sync_control: Option<Arc<HybridStorage>>,
    ) -> Result<Self> {
        if config.min_similarity >= config.max_similarity {
            return Err(StorageError::Init(format!(
                "min_similarity ({}) must be below max_similarity ({})",
                config.min_similarity, config.max_similarity
            )));
        }
        if config.association_storage_mode == AssociationStorageMode::GraphOnly && graph.is_none() {
            return Err(StorageError::Init(
                "graph_only association storage requires an embedded primary".to_string(),
            ));
        }

        Ok(Self {
            decay: DecayCalculator::new(config.clone()),
            associations: AssociationEngine::new(config.clone()),
            clustering: ClusteringEngine::new(config.clone()),
            compression: CompressionEngine::new(config.clone()),
            forgetting: ForgettingEngine::new(config.clone()),
            storage,
            embedder,
            graph,
            sync_control,
            config,
            health: Mutex::new(ConsolidationHealth::new()),
        })
    }

    /// Run the full pipeline for a horizon
    pub async fn consolidate(&self, horizon: TimeHorizon) -> Result<ConsolidationReport> {
        let started_at = now_timestamp();
        let run_start = Instant::now();
        let mut report = ConsolidationReport {
            horizon: horizon.as_str().to_string(),
            started_at,
            ..Default::default()
        };

        tracing::info!(horizon = %horizon, "starting consolidation");
        let _pause = SyncPauseGuard::new(self.sync_control.as_deref());

        let mut memories = self.memories_for_horizon(horizon).await?;
        report.memories_processed = memories.len();
        if memories.is_empty() {
            tracing::info!(horizon = %horizon, "no memories to process");
            return Ok(self.finalize(report, run_start));
        }

        // Phase 1: relevance scoring (all horizons)
        let access_patterns = self.storage.get_access_patterns().await.unwrap_or_default();
        let scores = match self.run_scoring(&mut memories, &access_patterns, horizon).await {
            Ok(scores) => scores,
            Err(e) => {
                report.errors.push(format!("scoring: {e}"));
                vec![]
            }
        };

        // Derived artifacts never feed further derivation
        let organic: Vec<Memory> = memories
            .iter()
            .filter(|m| {
                !matches!(m.memory_type.as_deref(), Some("association") | Some("summary"))
            })
            .cloned()
            .collect();

        let needs_embeddings = (self.config.clustering_enabled
            && horizon.phase_enabled(Phase::Clustering))
            || (self.config.associations_enabled && horizon.phase_enabled(Phase::Associations));
        let embeddings = if needs_embeddings {
            self.collect_embeddings(&organic).await
        } else {
            HashMap::new()
        };

        // Phase 2: clustering
        let mut clusters = vec![];
        if self.config.clustering_enabled && horizon.phase_enabled(Phase::Clustering) {
            let phase_start = Instant::now();
            clusters = self.clustering.process(&embeddings);
            report.clusters_created = clusters.len();
            self.record_phase(
                Phase::Clustering,
                horizon,
                phase_start,
                organic.len(),
                vec![],
            );
        }

        // Phase 3: association discovery
        if self.config.associations_enabled && horizon.phase_enabled(Phase::Associations) {
            let phase_start = Instant::now();
            match self.run_associations(&organic, &embeddings).await {
                Ok(stored) => {
                    report.associations_discovered = stored;
                    self.record_phase(
                        Phase::Associations,
                        horizon,
                        phase_start,
                        organic.len(),
                        vec![],
                    );
                }
                Err(e) => {
                    report.errors.push(format!("associations: {e}"));
                    self.record_phase(
                        Phase::Associations,
                        horizon,
                        phase_start,
                        organic.len(),
                        vec![e.to_string()],
                    );
                }
            }
        }

        // Phase 4: compression
        if self.config.compression_enabled
            && !clusters.is_empty()
            && horizon.phase_enabled(Phase::Compression)
        {
            let phase_start = Instant::now();
            match self.run_compression(&clusters, &organic).await {
                Ok(stored) => {
                    report.memories_compressed = stored;
                    self.record_phase(
                        Phase::Compression,
                        horizon,
                        phase_start,
                        clusters.len(),
                        vec![],
                    );
                }
                Err(e) => {
                    report.errors.push(format!("compression: {e}"));
                    self.record_phase(
                        Phase::Compression,
                        horizon,
                        phase_start,
                        clusters.len(),
                        vec![e.to_string()],
                    );
                }
            }
        }

        // Phase 5: controlled forgetting
        if self.config.forgetting_enabled && horizon.phase_enabled(Phase::Forgetting) {
            let phase_start = Instant::now();
            match self
                .run_forgetting(&organic, &scores, &access_patterns, horizon)
                .await
            {
                Ok(archived) => {
                    report.memories_archived = archived;
                    self.record_phase(
                        Phase::Forgetting,
                        horizon,
                        phase_start,
                        organic.len(),
                        vec![],
                    );
                }
                Err(e) => {
                    report.errors.push(format!("forgetting: {e}"));
                    self.record_phase(
                        Phase::Forgetting,
                        horizon,
                        phase_start,
                        organic.len(),
                        vec![e.to_string()],
                    );
                }
            }
        }

        // Stamp candidates so incremental mode can skip them next time.
        // One batch update, not one call per row.
        let stamp = now_timestamp();
        for memory in &mut memories {
            memory
                .metadata
                .insert("last_consolidated_at".into(), stamp.into());
        }
        if let Err(e) = self.storage.update_memories_batch(&memories).await {
            report.errors.push(format!("timestamp update: {e}"));
        }

        Ok(self.finalize(report, run_start))
    }

    fn finalize(&self, mut report: ConsolidationReport, run_start: Instant) -> ConsolidationReport {
        report.ended_at = now_timestamp();
        report.duration_seconds = run_start.elapsed().as_secs_f64();
        report.success = report.errors.is_empty();
        if report.success {
            tracing::info!(
                horizon = %report.horizon,
                memories = report.memories_processed,
                associations = report.associations_discovered,
                clusters = report.clusters_created,
                compressed = report.memories_compressed,
                archived = report.memories_archived,
                duration = report.duration_seconds,
                "consolidation completed"
            );
        } else {
            tracing::error!(
                horizon = %report.horizon,
                errors = ?report.errors,
                "consolidation completed with errors"
            );
        }
        report
    }

    /// Candidate memories for a horizon, honoring incremental mode
    async fn memories_for_horizon(&self, horizon: TimeHorizon) -> Result<Vec<Memory>> {
        let now = now_timestamp();
        let (recent_days, min_age_days) = horizon.window();

        let mut memories = match recent_days {
            Some(days) => {
                self.storage
                    .get_memories_by_time_range(now - days * 86_400.0, now)
                    .await?
            }
            None => self.storage.get_all_memories(None, 0, None, None).await?,
        };

        if let Some(min_age) = min_age_days {
            let cutoff = now - min_age * 86_400.0;
            memories.retain(|m| m.created_at < cutoff);
        }

        if self.config.incremental_mode && memories.len() > self.config.batch_size {
            // Oldest-consolidated first; never-consolidated sorts to the front
            memories.sort_by(|a, b| {
                let ka = a.metadata_f64("last_consolidated_at").unwrap_or(0.0);
                let kb = b.metadata_f64("last_consolidated_at").unwrap_or(0.0);
                ka.partial_cmp(&kb).unwrap_or(std::cmp::Ordering::Equal)
            });
            tracing::info!(
                batch = self.config.batch_size,
                total = memories.len(),
                "incremental mode: taking oldest-consolidated batch"
            );
            memories.truncate(self.config.batch_size);
        }

        Ok(memories)
    }

    async fn run_scoring(
        &self,
        memories: &mut [Memory],
        access_patterns: &HashMap<String, f64>,
        horizon: TimeHorizon,
    ) -> Result<Vec<RelevanceScore>> {
        let phase_start = Instant::now();
        let now = now_timestamp();
        let connections = self.storage.get_memory_connections().await.unwrap_or_default();

        let scores = self
            .decay
            .process(memories, &connections, access_patterns, now);

        for (memory, score) in memories.iter_mut().zip(&scores) {
            self.decay.apply_to_memory(memory, score, now);
        }
        self.storage.update_memories_batch(memories).await?;

        self.record_phase(Phase::Scoring, horizon, phase_start, memories.len(), vec![]);
        Ok(scores)
    }

    async fn collect_embeddings(&self, memories: &[Memory]) -> HashMap<String, Vec<f32>> {
        let mut embeddings = HashMap::with_capacity(memories.len());
        for memory in memories {
            // Prefer the stored vector; fall back to on-the-fly embedding
            if let Some(graph) = &self.graph {
                if let Ok(Some(stored)) = graph.get_embedding(&memory.content_hash) {
                    embeddings.insert(memory.content_hash.clone(), stored.vector);
                    continue;
                }
            }
            match self.embedder.embed(&memory.content).await {
                Ok(embedding) => {
                    embeddings.insert(memory.content_hash.clone(), embedding.vector);
                }
                Err(e) => {
                    tracing::warn!(hash = %memory.content_hash, error = %e, "embedding failed");
                }
            }
        }
        embeddings
    }

    /// Pairs already stored, across both storage modes
    async fn existing_pairs(&self) -> BTreeSet<(String, String)> {
        let mut pairs = BTreeSet::new();
        if let Some(graph) = &self.graph {
            if let Ok(stored) = graph.association_pairs() {
                pairs.extend(stored);
            }
        }
        if let Ok(all) = self
            .storage
            .get_all_memories(None, 0, Some("association"), None)
            .await
        {
            for memory in all {
                if let Some(sources) = memory
                    .metadata
                    .get("source_memory_hashes")
                    .and_then(MetadataValue::as_str)
                {
                    let hashes: Vec<&str> = sources.split(',').collect();
                    if hashes.len() >= 2 {
                        pairs.insert(canonical_pair(hashes[0], hashes[1]));
                    }
                }
            }
        }
        pairs
    }

    async fn run_associations(
        &self,
        memories: &[Memory],
        embeddings: &HashMap<String, Vec<f32>>,
    ) -> Result<usize> {
        let existing = self.existing_pairs().await;
        let discovered = self.associations.process(memories, embeddings, &existing);
        if discovered.is_empty() {
            return Ok(0);
        }

        let mode = self.config.association_storage_mode;
        let mut stored = 0usize;

        for association in &discovered {
            let mut ok = false;

            if matches!(
                mode,
                AssociationStorageMode::MemoriesOnly | AssociationStorageMode::DualWrite
            ) {
                let content = format!(
                    "Association between memories {} and {}: {} (similarity: {:.3})",
                    &association.source_hash[..8],
                    &association.target_hash[..8],
                    association.connection_type,
                    association.similarity
                );
                let memory = Memory::new(
                    content,
                    vec![
                        "association".to_string(),
                        "discovered".to_string(),
                        association.connection_type.as_str().to_string(),
                    ],
                    Some("association".to_string()),
                )
                .with_metadata(
                    "source_memory_hashes",
                    format!("{},{}", association.source_hash, association.target_hash),
                )
                .with_metadata("similarity_score", association.similarity)
                .with_metadata("connection_type", association.connection_type.as_str())
                .with_metadata("inference_confidence", association.confidence)
                .with_metadata("discovery_method", association.discovery_method.clone())
                .with_metadata("discovery_date", association.discovery_date.clone());

                match self.storage.store(&memory).await {
                    Ok((true, _)) => ok = true,
                    Ok((false, msg)) => {
                        tracing::debug!(msg, "association memory not stored");
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to store association memory");
                    }
                }
            }

            if matches!(
                mode,
                AssociationStorageMode::DualWrite | AssociationStorageMode::GraphOnly
            ) {
                if let Some(graph) = &self.graph {
                    let edge = Association {
                        source_hash: association.source_hash.clone(),
                        target_hash: association.target_hash.clone(),
                        similarity: association.similarity,
                        connection_types: vec![association.connection_type],
                        discovery_method: Some(association.discovery_method.clone()),
                        discovery_date: Some(association.discovery_date.clone()),
                        metadata: Default::default(),
                    };
                    match graph.store_association(&edge) {
                        Ok(true) => ok = true,
                        Ok(false) => {}
                        Err(e) => {
                            tracing::warn!(error = %e, "failed to store association edge");
                        }
                    }
                } else if mode == AssociationStorageMode::DualWrite {
                    tracing::debug!("no graph table available, memories-only write");
                }
            }

            if ok {
                stored += 1;
            }
        }

        tracing::info!(discovered = discovered.len(), stored, mode = ?mode, "associations stored");
        Ok(stored)
    }

    async fn run_compression(
        &self,
        clusters: &[super::MemoryCluster],
        memories: &[Memory],
    ) -> Result<usize> {
        let results = self.compression.process(clusters, memories);
        let mut stored = 0usize;
        for result in &results {
            match self.storage.store(&result.compressed_memory).await {
                Ok((true, _)) => stored += 1,
                Ok((false, msg)) => {
                    // Re-running a horizon regenerates identical summaries;
                    // the duplicate rejection keeps this idempotent
                    tracing::debug!(msg, "compressed memory not stored");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to store compressed memory");
                }
            }
        }
        Ok(stored)
    }

    async fn run_forgetting(
        &self,
        memories: &[Memory],
        scores: &[RelevanceScore],
        access_patterns: &HashMap<String, f64>,
        horizon: TimeHorizon,
    ) -> Result<usize> {
        let decisions = self
            .forgetting
            .process(memories, scores, access_patterns, horizon)?;

        let mut removed = 0usize;
        for decision in &decisions {
            if matches!(
                decision.action,
                ForgettingAction::Archived | ForgettingAction::Deleted
            ) {
                match self.storage.delete(&decision.memory_hash).await {
                    Ok((true, _)) => removed += 1,
                    Ok((false, msg)) => {
                        tracing::warn!(hash = %decision.memory_hash, msg, "forget delete refused");
                    }
                    Err(e) => {
                        tracing::warn!(hash = %decision.memory_hash, error = %e, "forget delete failed");
                    }
                }
            }
        }
        Ok(removed)
    }

    fn record_phase(
        &self,
        phase: Phase,
        horizon: TimeHorizon,
        started: Instant,
        processed: usize,
        errors: Vec<String>,
    ) {
        if let Ok(mut health) = self.health.lock() {
            health.record_phase(
                phase.as_str(),
                horizon.as_str(),
                started.elapsed().as_secs_f64(),
                processed,
                errors,
            );
        }
    }

    /// Health summary for reporting
    pub fn health_summary(&self) -> super::HealthSummary {
        self.health
            .lock()
            .map(|h| h.summary())
            .unwrap_or_else(|_| ConsolidationHealth::new().summary())
    }

    /// Resolve a health alert by id
    pub fn resolve_alert(&self, id: &str) -> bool {
        self.health.lock().map(|mut h| h.resolve_alert(id)).unwrap_or(false)
    }

    /// Advisory analysis of what a run on this horizon would do
    pub async fn recommendations(
        &self,
        horizon: TimeHorizon,
    ) -> Result<ConsolidationRecommendation> {
        let memories = self.memories_for_horizon(horizon).await?;
        if memories.is_empty() {
            return Ok(ConsolidationRecommendation {
                recommendation: "no_action".to_string(),
                reasons: vec!["No memories to process".to_string()],
                ..Default::default()
            });
        }

        let now = now_timestamp();
        let total_size_bytes: usize = memories.iter().map(|m| m.content.len()).sum();
        let old = memories
            .iter()
            .filter(|m| (now - m.created_at) / 86_400.0 > 30.0)
            .count();
        let old_memory_percentage = old as f64 / memories.len() as f64 * 100.0;

        let mut reasons = Vec::new();
        if memories.len() > 1000 {
            reasons.push("Consider running compression to reduce memory usage".to_string());
        }
        if old_memory_percentage > 50.0 {
            reasons.push("Many old memories present - consider forgetting/archival".to_string());
        }
        if memories.len() > 100
            && matches!(horizon, TimeHorizon::Weekly | TimeHorizon::Monthly)
        {
            reasons.push("Good candidate for association discovery".to_string());
        }
        if reasons.is_empty() {
            reasons.push("Memory state looks healthy".to_string());
        }

        Ok(ConsolidationRecommendation {
            recommendation: if reasons.len() > 1 {
                "consolidation_beneficial".to_string()
            } else {
                "optional".to_string()
            },
            reasons,
            memory_count: memories.len(),
            total_size_bytes,
            old_memory_percentage,
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::FallbackEmbedder;
    use crate::storage::inmem::InMemoryStorage;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> ConsolidationConfig {
        ConsolidationConfig {
            archive_path: dir.path().join("archive"),
            min_cluster_size: 3,
            ..Default::default()
        }
    }

    async fn consolidator(dir: &TempDir) -> (Consolidator, Arc<InMemoryStorage>) {
        let storage = Arc::new(InMemoryStorage::new());
        let embedder = Arc::new(FallbackEmbedder::new(64));
        let consolidator = Consolidator::new(
            storage.clone() as Arc<dyn MemoryStorage>,
            embedder,
            ConsolidationConfig {
                association_storage_mode: AssociationStorageMode::MemoriesOnly,
                ..test_config(dir)
            },
            None,
            None,
        )
        .unwrap();
        (consolidator, storage)
    }

    fn aged(content: &str, tags: &[&str], age_days: f64) -> Memory {
        let now = now_timestamp();
        let mut m = Memory::new(content, tags.iter().map(|t| t.to_string()).collect(), None)
            .with_created_at(now - age_days * 86_400.0);
        m.updated_at = m.created_at;
        m.updated_at_iso = m.created_at_iso.clone();
        m
    }

    #[tokio::test]
    async fn test_weekly_run_scores_everything() {
        let dir = TempDir::new().unwrap();
        let (consolidator, storage) = consolidator(&dir).await;

        for i in 0..20 {
            let m = aged(
                &format!("memory about subject number {i} in the archive"),
                &["test"],
                f64::from(i) * 3.0,
            );
            storage.store(&m).await.unwrap();
        }

        let report = consolidator.consolidate(TimeHorizon::Weekly).await.unwrap();
        assert_eq!(report.memories_processed, 20);
        assert!(report.success, "{:?}", report.errors);
        // Forgetting is disabled on weekly
        assert_eq!(report.memories_archived, 0);

        // Every input memory carries relevance + consolidation stamps
        let all = storage.get_all_memories(None, 0, None, None).await.unwrap();
        for memory in all.iter().filter(|m| m.memory_type.is_none()) {
            assert!(memory.metadata.contains_key("relevance_score"), "{}", memory.content);
            let stamp = memory.metadata_f64("last_consolidated_at").unwrap();
            assert!((now_timestamp() - stamp).abs() < 60.0);
        }
    }

    #[tokio::test]
    async fn test_consolidation_idempotent_per_horizon() {
        let dir = TempDir::new().unwrap();
        let (consolidator, storage) = consolidator(&dir).await;

        for i in 0..12 {
            let m = aged(
                &format!("shared project context entry {i} discussing storage"),
                &["project"],
                5.0,
            );
            storage.store(&m).await.unwrap();
        }

        let first = consolidator.consolidate(TimeHorizon::Weekly).await.unwrap();
        assert!(first.success);
        let second = consolidator.consolidate(TimeHorizon::Weekly).await.unwrap();
        assert!(second.success);
        // Second run re-derives nothing new
        assert_eq!(second.associations_discovered, 0);
        assert_eq!(second.memories_compressed, 0);
    }

    #[tokio::test]
    async fn test_monthly_forgetting_archives_low_relevance() {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(InMemoryStorage::new());
        let embedder = Arc::new(FallbackEmbedder::new(64));
        let config = ConsolidationConfig {
            association_storage_mode: AssociationStorageMode::MemoriesOnly,
            relevance_threshold: 0.2,
            access_threshold_days: 30.0,
            ..test_config(&dir)
        };
        let consolidator = Consolidator::new(
            storage.clone() as Arc<dyn MemoryStorage>,
            embedder,
            config.clone(),
            None,
            None,
        )
        .unwrap();

        let doomed = aged("ancient trivia nobody needs", &["temporary"], 400.0);
        let keeper = aged("critical production runbook", &["critical"], 10.0);
        storage.store(&doomed).await.unwrap();
        storage.store(&keeper).await.unwrap();

        let report = consolidator.consolidate(TimeHorizon::Monthly).await.unwrap();
        assert!(report.success, "{:?}", report.errors);
        assert_eq!(report.memories_archived, 1);

        assert!(storage.get_by_hash(&doomed.content_hash).await.unwrap().is_none());
        assert!(storage.get_by_hash(&keeper.content_hash).await.unwrap().is_some());

        // Archived before deletion
        let archived = ForgettingEngine::read_archive(&config.archive_path).unwrap();
        assert_eq!(archived.len(), 1);
        assert_eq!(archived[0].content_hash, doomed.content_hash);
    }

    #[tokio::test]
    async fn test_daily_window_limits_candidates() {
        let dir = TempDir::new().unwrap();
        let (consolidator, storage) = consolidator(&dir).await;

        storage.store(&aged("fresh note", &[], 0.5)).await.unwrap();
        storage.store(&aged("old note", &[], 30.0)).await.unwrap();

        let report = consolidator.consolidate(TimeHorizon::Daily).await.unwrap();
        assert_eq!(report.memories_processed, 1);
    }

    #[tokio::test]
    async fn test_incremental_mode_batches_oldest_first() {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(InMemoryStorage::new());
        let embedder = Arc::new(FallbackEmbedder::new(64));
        let config = ConsolidationConfig {
            incremental_mode: true,
            batch_size: 3,
            association_storage_mode: AssociationStorageMode::MemoriesOnly,
            ..test_config(&dir)
        };
        let consolidator = Consolidator::new(
            storage.clone() as Arc<dyn MemoryStorage>,
            embedder,
            config,
            None,
            None,
        )
        .unwrap();

        for i in 0..8 {
            storage
                .store(&aged(&format!("incremental entry {i}"), &[], 10.0))
                .await
                .unwrap();
        }

        let report = consolidator.consolidate(TimeHorizon::Weekly).await.unwrap();
        assert_eq!(report.memories_processed, 3);

        let stamped = storage
            .get_all_memories(None, 0, None, None)
            .await
            .unwrap()
            .into_iter()
            .filter(|m| m.metadata.contains_key("last_consolidated_at"))
            .count();
        assert_eq!(stamped, 3);

        // The next run picks unconsolidated candidates first
        let report = consolidator.consolidate(TimeHorizon::Weekly).await.unwrap();
        assert_eq!(report.memories_processed, 3);
        let stamped = storage
            .get_all_memories(None, 0, None, None)
            .await
            .unwrap()
            .into_iter()
            .filter(|m| m.metadata.contains_key("last_consolidated_at"))
            .count();
        assert_eq!(stamped, 6);
    }

    #[tokio::test]
    async fn test_invalid_similarity_window_rejected() {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(InMemoryStorage::new());
        let embedder = Arc::new(FallbackEmbedder::new(64));
        let config = ConsolidationConfig {
            min_similarity: 0.8,
            max_similarity: 0.4,
            ..test_config(&dir)
        };
        assert!(Consolidator::new(
            storage as Arc<dyn MemoryStorage>,
            embedder,
            config,
            None,
            None
        )
        .is_err());
    }

    #[tokio::test]
    async fn test_graph_only_requires_graph() {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(InMemoryStorage::new());
        let embedder = Arc::new(FallbackEmbedder::new(64));
        let config = ConsolidationConfig {
            association_storage_mode: AssociationStorageMode::GraphOnly,
            ..test_config(&dir)
        };
        assert!(Consolidator::new(
            storage as Arc<dyn MemoryStorage>,
            embedder,
            config,
            None,
            None
        )
        .is_err());
    }

    #[tokio::test]
    async fn test_recommendations() {
        let dir = TempDir::new().unwrap();
        let (consolidator, storage) = consolidator(&dir).await;

        let empty = consolidator.recommendations(TimeHorizon::Weekly).await.unwrap();
        assert_eq!(empty.recommendation, "no_action");

        for i in 0..5 {
            storage.store(&aged(&format!("rec {i}"), &[], 60.0)).await.unwrap();
        }
        let rec = consolidator.recommendations(TimeHorizon::Weekly).await.unwrap();
        assert_eq!(rec.memory_count, 5);
        assert!(rec.old_memory_percentage > 99.0);
        assert!(!rec.reasons.is_empty());
    }

    #[tokio::test]
    async fn test_health_records_phases() {
        let dir = TempDir::new().unwrap();
        let (consolidator, storage) = consolidator(&dir).await;
        storage.store(&aged("health subject", &[], 1.0)).await.unwrap();

        consolidator.consolidate(TimeHorizon::Weekly).await.unwrap();
        let summary = consolidator.health_summary();
        assert!(summary.total_runs >= 1);
        assert_eq!(summary.active_alerts, 0);
        assert!(summary.last_runs.iter().any(|r| r.phase == "scoring"));
    }
}
