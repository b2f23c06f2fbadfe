//! Creative association discovery
//!
//! Enumerates candidate memory pairs (under a sampling cap), keeps those in
//! the configured cosine "sweet spot" (similar enough to relate, not
//! near-duplicates), and infers a typed relationship from three signals:
//! the type-pair table, content patterns, and temporal ordering. Candidates
//! below the confidence threshold fall back to `related`.

use std::collections::{BTreeSet, HashMap};
use std::sync::OnceLock;

use regex::Regex;

use crate::embeddings::cosine_similarity;
use crate::memory::{iso_from_timestamp, now_timestamp, Memory};
use crate::ontology::{parent_type, RelationshipType};

use super::ConsolidationConfig;

/// A newly discovered association edge
#[derive(Debug, Clone)]
pub struct DiscoveredAssociation {
    /// Edge source hash
    pub source_hash: String,
    /// Edge target hash
    pub target_hash: String,
    /// Cosine similarity between the pair
    pub similarity: f64,
    /// Inferred relationship
    pub connection_type: RelationshipType,
    /// Inference confidence in [0, 1]
    pub confidence: f64,
    /// How the edge was found
    pub discovery_method: String,
    /// When the edge was found (ISO-8601)
    pub discovery_date: String,
}

// ============================================================================
// RELATIONSHIP INFERENCE
// ============================================================================

fn pattern_set(patterns: &'static [&'static str]) -> Vec<Regex> {
    patterns
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
}

fn causation_patterns() -> &'static [Regex] {
    static SET: OnceLock<Vec<Regex>> = OnceLock::new();
    SET.get_or_init(|| {
        pattern_set(&[
            r"\bcaused?\b",
            r"\blead\s+to\b",
            r"\bresulted\s+in\b",
            r"\btriggered\b",
            r"\bgenerated\b",
        ])
    })
}

fn resolution_patterns() -> &'static [Regex] {
    static SET: OnceLock<Vec<Regex>> = OnceLock::new();
    SET.get_or_init(|| {
        pattern_set(&[
            r"\bfixed?\b",
            r"\bresolve[ds]?\b",
            r"\bcorrected?\b",
            r"\bpatched?\b",
            r"\brepaired\b",
        ])
    })
}

fn support_patterns() -> &'static [Regex] {
    static SET: OnceLock<Vec<Regex>> = OnceLock::new();
    SET.get_or_init(|| {
        pattern_set(&[
            r"\bsupports?\b",
            r"\benables?\b",
            r"\bfacilitate[ds]?\b",
            r"\bhelps?\b",
        ])
    })
}

fn contradiction_patterns() -> &'static [Regex] {
    static SET: OnceLock<Vec<Regex>> = OnceLock::new();
    SET.get_or_init(|| {
        pattern_set(&[
            r"\bcontradict[ds]?\b",
            r"\bconflict[ds]?\b",
            r"\bdisagree[ds]?\b",
            r"\bhowever\b",
            r"\b(but|yet|although|nevertheless)\b",
            r"\boppose[sd]?\b",
        ])
    })
}

fn match_count(patterns: &[Regex], text: &str) -> usize {
    patterns.iter().filter(|p| p.is_match(text)).count()
}

/// Three-signal relationship type inference
pub struct RelationshipInference {
    min_confidence: f64,
}

impl RelationshipInference {
    /// Create an inference engine with a confidence threshold
    pub fn new(min_confidence: f64) -> Self {
        Self { min_confidence }
    }

    /// Infer the relationship between two memories.
    ///
    /// Returns the highest-confidence candidate above the threshold, or
    /// (`Related`, confidence) when nothing confident emerges.
    pub fn infer(&self, source: &Memory, target: &Memory) -> (RelationshipType, f64) {
        let source_lower = source.content.to_lowercase();
        let target_lower = target.content.to_lowercase();
        let source_parent = source.memory_type.as_deref().and_then(parent_type);
        let target_parent = target.memory_type.as_deref().and_then(parent_type);

        let mut candidates: Vec<(RelationshipType, f64)> = Vec::new();

        // Signal 1: memory type combinations
        candidates.extend(Self::type_candidates(source_parent, target_parent));

        // Signal 2: content patterns
        let resolution = match_count(resolution_patterns(), &source_lower);
        if resolution > 0 && target_parent == Some("error") {
            candidates.push((
                RelationshipType::Fixes,
                (0.5 + resolution as f64 * 0.1).min(0.9),
            ));
        }
        let causation = match_count(causation_patterns(), &source_lower);
        if causation > 0 && target_parent == Some("error") {
            candidates.push((
                RelationshipType::Causes,
                (0.5 + causation as f64 * 0.1).min(0.8),
            ));
        }
        let support = match_count(support_patterns(), &source_lower);
        if support > 0 && target_parent == Some("decision") {
            candidates.push((
                RelationshipType::Supports,
                (0.4 + support as f64 * 0.1).min(0.75),
            ));
        }
        let source_contra = match_count(contradiction_patterns(), &source_lower);
        let target_contra = match_count(contradiction_patterns(), &target_lower);
        if source_contra > 0 || target_contra > 0 {
            let confidence = if source_contra > 0 && target_contra > 0 {
                0.7
            } else {
                0.4
            };
            candidates.push((RelationshipType::Contradicts, confidence));
        }

        // Signal 3: temporal ordering
        let time_diff = (source.created_at - target.created_at).abs();
        if time_diff < 3600.0 && source_parent.is_some() && source_parent == target_parent {
            candidates.push((RelationshipType::Follows, 0.4));
        }
        if source.created_at > target.created_at
            && source_parent == Some("learning")
            && target_parent == Some("error")
        {
            candidates.push((RelationshipType::Fixes, 0.6));
        }

        let Some((best_type, best_confidence)) = candidates
            .into_iter()
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
        else {
            return (RelationshipType::Related, 0.0);
        };

        if best_confidence < self.min_confidence {
            return (RelationshipType::Related, best_confidence);
        }
        (best_type, best_confidence)
    }

    fn type_candidates(
        source_parent: Option<&str>,
        target_parent: Option<&str>,
    ) -> Vec<(RelationshipType, f64)> {
        let (Some(source), Some(target)) = (source_parent, target_parent) else {
            return vec![];
        };
        const TABLE: &[(&str, &str, RelationshipType, f64)] = &[
            ("learning", "error", RelationshipType::Fixes, 0.8),
            ("pattern", "error", RelationshipType::Fixes, 0.75),
            ("decision", "error", RelationshipType::Causes, 0.7),
            ("error", "error", RelationshipType::Causes, 0.6),
            ("learning", "decision", RelationshipType::Supports, 0.6),
            ("pattern", "learning", RelationshipType::Supports, 0.6),
            ("observation", "learning", RelationshipType::Supports, 0.5),
            ("decision", "decision", RelationshipType::Supports, 0.4),
            ("observation", "observation", RelationshipType::Follows, 0.3),
        ];
        let mut out = Vec::new();
        for (a, b, rel, confidence) in TABLE {
            if source == *a && target == *b {
                out.push((*rel, *confidence));
            } else if source == *b && target == *a {
                // Reverse direction carries less signal
                out.push((*rel, confidence * 0.7));
            }
        }
        out
    }
}

// ============================================================================
// DISCOVERY ENGINE
// ============================================================================

/// Pairwise association discovery under a sampling cap
pub struct AssociationEngine {
    config: ConsolidationConfig,
    inference: RelationshipInference,
}

impl AssociationEngine {
    /// Create an engine from pipeline configuration
    pub fn new(config: ConsolidationConfig) -> Self {
        let inference = RelationshipInference::new(config.min_inference_confidence);
        Self { config, inference }
    }

    /// Discover novel associations among the candidate memories.
    ///
    /// `embeddings` maps content hashes to vectors; pairs without both
    /// vectors are skipped. `existing` holds canonical (sorted) endpoint
    /// pairs already stored, which are never re-discovered. Pair sampling
    /// is a deterministic stride so repeated runs make identical choices.
    pub fn process(
        &self,
        memories: &[Memory],
        embeddings: &HashMap<String, Vec<f32>>,
        existing: &BTreeSet<(String, String)>,
    ) -> Vec<DiscoveredAssociation> {
        if memories.len() < 2 {
            return vec![];
        }

        let total_pairs = memories.len() * (memories.len() - 1) / 2;
        let stride = total_pairs.div_ceil(self.config.max_pairs_per_run).max(1);

        let mut discovered = Vec::new();
        let mut pair_index = 0usize;
        let now = now_timestamp();

        'outer: for i in 0..memories.len() {
            for j in (i + 1)..memories.len() {
                let sampled = pair_index % stride == 0;
                pair_index += 1;
                if !sampled {
                    continue;
                }
                if discovered.len() >= self.config.max_pairs_per_run {
                    break 'outer;
                }

                let a = &memories[i];
                let b = &memories[j];
                let key = canonical_pair(&a.content_hash, &b.content_hash);
                if existing.contains(&key) {
                    continue;
                }

                let (Some(va), Some(vb)) = (
                    embeddings.get(&a.content_hash),
                    embeddings.get(&b.content_hash),
                ) else {
                    continue;
                };
                let similarity = f64::from(cosine_similarity(va, vb));
                if similarity < self.config.min_similarity
                    || similarity > self.config.max_similarity
                {
                    continue;
                }

                let (connection_type, confidence) = self.inference.infer(a, b);
                discovered.push(DiscoveredAssociation {
                    source_hash: a.content_hash.clone(),
                    target_hash: b.content_hash.clone(),
                    similarity,
                    connection_type,
                    confidence,
                    discovery_method: "pairwise_similarity".to_string(),
                    discovery_date: iso_from_timestamp(now),
                });
            }
        }

        tracing::info!(
            candidates = memories.len(),
            discovered = discovered.len(),
            "association discovery complete"
        );
        discovered
    }
}

/// Canonical (sorted) endpoint pair for dedupe sets
pub fn canonical_pair(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn typed(content: &str, memory_type: &str, created_at: f64) -> Memory {
        Memory::new(content, vec![], Some(memory_type.to_string())).with_created_at(created_at)
    }

    #[test]
    fn test_learning_fixes_error() {
        let inference = RelationshipInference::new(0.5);
        let error = typed(
            "Authentication error: request timeout after 30 seconds",
            "error/bug",
            1_000_000.0,
        );
        let learning = typed(
            "Fixed authentication timeout by adjusting the retry configuration",
            "learning/insight",
            1_010_000.0,
        );
        let (rel, confidence) = inference.infer(&learning, &error);
        assert_eq!(rel, RelationshipType::Fixes);
        assert!(confidence >= 0.8);
    }

    #[test]
    fn test_decision_causes_error() {
        let inference = RelationshipInference::new(0.5);
        let decision = typed(
            "Chose plain HTTP instead of HTTPS for the staging setup",
            "decision/architecture",
            1_000_000.0,
        );
        let error = typed(
            "Connection refused: port 8000 not responding",
            "error/bug",
            1_000_500.0,
        );
        let (rel, confidence) = inference.infer(&decision, &error);
        assert_eq!(rel, RelationshipType::Causes);
        assert!(confidence >= 0.5);
    }

    #[test]
    fn test_sequential_observations_follow() {
        let inference = RelationshipInference::new(0.3);
        let a = typed("Deployed version 9.0.0", "observation", 1_000_000.0);
        let b = typed("Checked deployment status", "observation", 1_000_060.0);
        let (rel, _) = inference.infer(&a, &b);
        assert_eq!(rel, RelationshipType::Follows);
    }

    #[test]
    fn test_low_confidence_defaults_to_related() {
        let inference = RelationshipInference::new(0.6);
        let a = typed("Meeting notes about Q1 planning", "observation", 1_000_000.0);
        let b = typed("Team lunch at the Italian place", "observation", 900_000.0);
        let (rel, confidence) = inference.infer(&a, &b);
        assert_eq!(rel, RelationshipType::Related);
        assert!(confidence < 0.6);
    }

    #[test]
    fn test_contradiction_detection() {
        let inference = RelationshipInference::new(0.5);
        let a = typed(
            "This contradicts our earlier benchmark results",
            "learning",
            1_000_000.0,
        );
        let b = typed(
            "However the new data disagrees with that conclusion",
            "learning",
            2_000_000.0,
        );
        let (rel, confidence) = inference.infer(&a, &b);
        assert_eq!(rel, RelationshipType::Contradicts);
        assert!(confidence >= 0.7);
    }

    #[test]
    fn test_engine_respects_similarity_window() {
        let mut config = ConsolidationConfig::default();
        config.min_similarity = 0.3;
        config.max_similarity = 0.7;
        let engine = AssociationEngine::new(config);

        let a = typed("first subject", "observation", 1_000_000.0);
        let b = typed("second subject", "observation", 1_000_100.0);
        let c = typed("third subject", "observation", 1_000_200.0);

        let mut embeddings = HashMap::new();
        // a-b too similar (0.99), a-c in window (0.5), b-c below window
        embeddings.insert(a.content_hash.clone(), vec![1.0, 0.0]);
        embeddings.insert(b.content_hash.clone(), vec![0.999, 0.045]);
        embeddings.insert(c.content_hash.clone(), vec![0.5, 0.866]);

        let memories = vec![a.clone(), b, c.clone()];
        let found = engine.process(&memories, &embeddings, &BTreeSet::new());
        assert_eq!(found.len(), 1);
        assert_eq!(
            canonical_pair(&found[0].source_hash, &found[0].target_hash),
            canonical_pair(&a.content_hash, &c.content_hash)
        );
    }

    #[test]
    fn test_engine_skips_existing_pairs() {
        let engine = AssociationEngine::new(ConsolidationConfig::default());
        let a = typed("alpha text", "observation", 1_000_000.0);
        let b = typed("beta text", "observation", 1_000_100.0);

        let mut embeddings = HashMap::new();
        embeddings.insert(a.content_hash.clone(), vec![1.0, 0.0]);
        embeddings.insert(b.content_hash.clone(), vec![0.6, 0.8]);

        let mut existing = BTreeSet::new();
        existing.insert(canonical_pair(&a.content_hash, &b.content_hash));

        let found = engine.process(&[a, b], &embeddings, &existing);
        assert!(found.is_empty());
    }

    #[test]
    fn test_engine_deterministic() {
        let engine = AssociationEngine::new(ConsolidationConfig::default());
        let memories: Vec<Memory> = (0..8)
            .map(|i| typed(&format!("memory number {i}"), "observation", 1_000_000.0 + i as f64))
            .collect();
        let mut embeddings = HashMap::new();
        for (i, m) in memories.iter().enumerate() {
            let angle = i as f32 * 0.35;
            embeddings.insert(m.content_hash.clone(), vec![angle.cos(), angle.sin()]);
        }

        let first = engine.process(&memories, &embeddings, &BTreeSet::new());
        let second = engine.process(&memories, &embeddings, &BTreeSet::new());
        assert_eq!(first.len(), second.len());
        for (x, y) in first.iter().zip(&second) {
            assert_eq!(x.source_hash, y.source_hash);
            assert_eq!(x.connection_type, y.connection_type);
        }
    }
}
