//! Exponential decay scoring
//!
//! Memories lose relevance over time unless reinforced by connections to
//! other memories, recent access, base importance, type-specific retention
//! periods, and quality. Scores are transient; they persist only as fields
//! injected into memory metadata on update.

use std::collections::{BTreeMap, HashMap};

use crate::memory::{iso_from_timestamp, Memory, MetadataValue};

use super::ConsolidationConfig;

/// A memory's relevance score with its component breakdown
#[derive(Debug, Clone)]
pub struct RelevanceScore {
    /// Scored memory hash
    pub memory_hash: String,
    /// Combined score
    pub total_score: f64,
    /// Importance from metadata or tags, clamped to [0, 2]
    pub base_importance: f64,
    /// `exp(-age_days / retention)`
    pub decay_factor: f64,
    /// `1 + 0.1 * connection_count`
    pub connection_boost: f64,
    /// Recency-of-access multiplier
    pub access_boost: f64,
    /// Component details
    pub metadata: BTreeMap<String, MetadataValue>,
}

/// Tag-derived importance when no explicit score is set
fn tag_importance(tag: &str) -> f64 {
    match tag.to_lowercase().as_str() {
        "critical" => 2.0,
        "important" => 1.5,
        "urgent" => 1.4,
        "reference" => 1.3,
        "project" => 1.2,
        "personal" => 1.1,
        "note" => 0.9,
        "draft" => 0.8,
        "temporary" => 0.7,
        _ => 1.0,
    }
}

/// Decay-based relevance calculator
pub struct DecayCalculator {
    config: ConsolidationConfig,
}

impl DecayCalculator {
    /// Create a calculator with the given pipeline configuration
    pub fn new(config: ConsolidationConfig) -> Self {
        Self { config }
    }

    /// Score every memory against the reference time
    pub fn process(
        &self,
        memories: &[Memory],
        connections: &HashMap<String, usize>,
        access_patterns: &HashMap<String, f64>,
        reference_time: f64,
    ) -> Vec<RelevanceScore> {
        let scores: Vec<RelevanceScore> = memories
            .iter()
            .map(|m| self.score_memory(m, connections, access_patterns, reference_time))
            .collect();
        tracing::info!(count = scores.len(), "calculated relevance scores");
        scores
    }

    fn base_importance(&self, memory: &Memory) -> f64 {
        if let Some(score) = memory.metadata_f64("importance_score") {
            return score.clamp(0.0, 2.0);
        }
        memory
            .tags
            .iter()
            .map(|t| tag_importance(t))
            .fold(1.0, f64::max)
    }

    fn retention_period(&self, memory: &Memory) -> f64 {
        let key = memory.base_type().unwrap_or("standard");
        // Tag-level retention overrides (critical/temporary) beat the type
        for tag in &memory.tags {
            if let Some(days) = self.config.retention_periods.get(&tag.to_lowercase()) {
                return *days;
            }
        }
        self.config
            .retention_periods
            .get(key)
            .copied()
            .unwrap_or(self.config.default_retention_days)
    }

    fn access_boost(
        &self,
        memory: &Memory,
        access_patterns: &HashMap<String, f64>,
        reference_time: f64,
    ) -> f64 {
        let last_accessed = access_patterns
            .get(&memory.content_hash)
            .copied()
            .unwrap_or(memory.updated_at);
        let days_since = (reference_time - last_accessed) / 86_400.0;
        if days_since <= 1.0 {
            1.5
        } else if days_since <= 7.0 {
            1.2
        } else if days_since <= 30.0 {
            1.1
        } else {
            1.0
        }
    }

    fn is_protected(&self, memory: &Memory) -> bool {
        memory.tags.iter().any(|t| t.eq_ignore_ascii_case("protected"))
            || memory
                .metadata
                .get("protected")
                .and_then(MetadataValue::as_bool)
                .unwrap_or(false)
    }

    fn score_memory(
        &self,
        memory: &Memory,
        connections: &HashMap<String, usize>,
        access_patterns: &HashMap<String, f64>,
        reference_time: f64,
    ) -> RelevanceScore {
        let age_days = ((reference_time - memory.created_at) / 86_400.0).max(0.0);
        let base_importance = self.base_importance(memory);
        let retention = self.retention_period(memory);
        let decay_factor = (-age_days / retention).exp();

        let connection_count = connections.get(&memory.content_hash).copied().unwrap_or(0);
        let connection_boost = 1.0 + 0.1 * connection_count as f64;
        let access_boost = self.access_boost(memory, access_patterns, reference_time);

        // Association quality boost: well-connected memories earn quality
        let original_quality = memory.quality_score();
        let mut quality = original_quality;
        let mut boost_applied = false;
        if self.config.quality_boost_enabled
            && connection_count >= self.config.min_connections_for_boost
        {
            let boosted = (quality * self.config.quality_boost_factor).min(1.0);
            if boosted > quality {
                boost_applied = true;
                quality = boosted;
            }
        }

        let quality_multiplier = 1.0 + 0.5 * quality;
        let mut total_score =
            base_importance * decay_factor * connection_boost * access_boost * quality_multiplier;

        let protected = self.is_protected(memory);
        if protected {
            total_score = total_score.max(0.5);
        }

        let mut metadata = BTreeMap::new();
        metadata.insert("age_days".into(), age_days.into());
        metadata.insert("retention_period".into(), retention.into());
        metadata.insert(
            "connection_count".into(),
            (connection_count as i64).into(),
        );
        metadata.insert("is_protected".into(), protected.into());
        metadata.insert("quality_score".into(), quality.into());
        metadata.insert("quality_multiplier".into(), quality_multiplier.into());
        metadata.insert("association_boost_applied".into(), boost_applied.into());
        metadata.insert("original_quality_score".into(), original_quality.into());

        RelevanceScore {
            memory_hash: memory.content_hash.clone(),
            total_score,
            base_importance,
            decay_factor,
            connection_boost,
            access_boost,
            metadata,
        }
    }

    /// Inject a score into a memory's metadata (the persisted form),
    /// including quality-boost provenance when one was applied.
    pub fn apply_to_memory(&self, memory: &mut Memory, score: &RelevanceScore, now: f64) {
        memory
            .metadata
            .insert("relevance_score".into(), score.total_score.into());
        memory
            .metadata
            .insert("relevance_calculated_at".into(), iso_from_timestamp(now).into());
        memory
            .metadata
            .insert("decay_factor".into(), score.decay_factor.into());
        memory
            .metadata
            .insert("connection_boost".into(), score.connection_boost.into());
        memory
            .metadata
            .insert("access_boost".into(), score.access_boost.into());

        let boosted = score
            .metadata
            .get("association_boost_applied")
            .and_then(MetadataValue::as_bool)
            .unwrap_or(false);
        if boosted {
            let new_quality = score
                .metadata
                .get("quality_score")
                .and_then(MetadataValue::as_f64)
                .unwrap_or(0.0);
            let original = score
                .metadata
                .get("original_quality_score")
                .and_then(MetadataValue::as_f64)
                .unwrap_or(0.0);
            let connection_count = score
                .metadata
                .get("connection_count")
                .and_then(MetadataValue::as_f64)
                .unwrap_or(0.0);

            memory.metadata.insert("quality_score".into(), new_quality.into());
            memory.metadata.insert("quality_boost_applied".into(), true.into());
            memory
                .metadata
                .insert("quality_boost_date".into(), iso_from_timestamp(now).into());
            memory.metadata.insert(
                "quality_boost_reason".into(),
                "association_connections".into(),
            );
            memory.metadata.insert(
                "quality_boost_connection_count".into(),
                connection_count.into(),
            );
            memory
                .metadata
                .insert("original_quality_before_boost".into(), original.into());
            tracing::info!(
                hash = %memory.content_hash,
                original,
                boosted = new_quality,
                "persisting association quality boost"
            );
        }

        memory.touch();
    }

    /// Scores below the forgetting threshold
    pub fn low_relevance<'a>(
        &self,
        scores: &'a [RelevanceScore],
        threshold: f64,
    ) -> Vec<&'a RelevanceScore> {
        scores.iter().filter(|s| s.total_score < threshold).collect()
    }
}

// ============================================================================
// TESTS
// ============================================================================
