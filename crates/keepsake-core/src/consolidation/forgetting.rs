//! Controlled forgetting
//!
//! Policy-driven archival and deletion of low-relevance memories. A memory
//! is forgotten only when its relevance score is under the threshold AND it
//! has not been accessed within the configured window. Archived memories are
//! written to the archive path as JSON before any deletion, so forgetting is
//! reversible by an operator.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::memory::{now_timestamp, Memory, MetadataValue};

use super::{ConsolidationConfig, RelevanceScore, TimeHorizon};

/// What happened to a forgetting candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForgettingAction {
    /// Left in place
    Kept,
    /// Written to the archive, then deleted from storage
    Archived,
    /// Replaced by its compressed form
    Compressed,
    /// Deleted without archival (never produced by the default policy)
    Deleted,
}

/// Per-memory forgetting decision
#[derive(Debug, Clone)]
pub struct ForgettingDecision {
    /// The candidate memory hash
    pub memory_hash: String,
    /// Action taken
    pub action: ForgettingAction,
    /// Why
    pub reason: String,
}

/// Archived memory record, as serialized into archive files
#[derive(Debug, Serialize, Deserialize)]
struct ArchivedMemory {
    memory: Memory,
    relevance_score: f64,
    archived_at: f64,
    horizon: String,
}

/// Controlled forgetting engine
pub struct ForgettingEngine {
    config: ConsolidationConfig,
}

impl ForgettingEngine {
    /// Create an engine from pipeline configuration
    pub fn new(config: ConsolidationConfig) -> Self {
        Self { config }
    }

    /// Decide the fate of each memory.
    ///
    /// Protected memories and memories with recent access are always kept.
    /// Candidates marked `Archived` are written to one JSON archive file per
    /// run before the caller deletes them from storage.
    pub fn process(
        &self,
        memories: &[Memory],
        scores: &[RelevanceScore],
        access_patterns: &HashMap<String, f64>,
        horizon: TimeHorizon,
    ) -> std::io::Result<Vec<ForgettingDecision>> {
        let now = now_timestamp();
        let score_by_hash: HashMap<&str, &RelevanceScore> = scores
            .iter()
            .map(|s| (s.memory_hash.as_str(), s))
            .collect();

        let mut decisions = Vec::with_capacity(memories.len());
        let mut to_archive: Vec<ArchivedMemory> = Vec::new();

        for memory in memories {
            let Some(score) = score_by_hash.get(memory.content_hash.as_str()) else {
                decisions.push(ForgettingDecision {
                    memory_hash: memory.content_hash.clone(),
                    action: ForgettingAction::Kept,
                    reason: "no relevance score".to_string(),
                });
                continue;
            };

            if is_protected(memory) {
                decisions.push(ForgettingDecision {
                    memory_hash: memory.content_hash.clone(),
                    action: ForgettingAction::Kept,
                    reason: "protected".to_string(),
                });
                continue;
            }

            if score.total_score >= self.config.relevance_threshold {
                decisions.push(ForgettingDecision {
                    memory_hash: memory.content_hash.clone(),
                    action: ForgettingAction::Kept,
                    reason: format!("relevance {:.3} above threshold", score.total_score),
                });
                continue;
            }

            let last_accessed = access_patterns
                .get(&memory.content_hash)
                .copied()
                .unwrap_or(memory.updated_at);
            let days_idle = (now - last_accessed) / 86_400.0;
            if days_idle < self.config.access_threshold_days {
                decisions.push(ForgettingDecision {
                    memory_hash: memory.content_hash.clone(),
                    action: ForgettingAction::Kept,
                    reason: format!("accessed {days_idle:.0} days ago"),
                });
                continue;
            }

            to_archive.push(ArchivedMemory {
                memory: memory.clone(),
                relevance_score: score.total_score,
                archived_at: now,
                horizon: horizon.as_str().to_string(),
            });
            decisions.push(ForgettingDecision {
                memory_hash: memory.content_hash.clone(),
                action: ForgettingAction::Archived,
                reason: format!(
                    "relevance {:.3} under {:.3}, idle {days_idle:.0} days",
                    score.total_score, self.config.relevance_threshold
                ),
            });
        }

        if !to_archive.is_empty() {
            let path = self.write_archive(&to_archive, now)?;
            tracing::info!(
                archived = to_archive.len(),
                path = %path.display(),
                "wrote forgetting archive"
            );
        }

        Ok(decisions)
    }

    /// Archive file for this run: `<archive_path>/forgotten_<unix>.json`
    fn write_archive(&self, records: &[ArchivedMemory], now: f64) -> std::io::Result<PathBuf> {
        std::fs::create_dir_all(&self.config.archive_path)?;
        let path = self
            .config
            .archive_path
            .join(format!("forgotten_{}.json", now as i64));
        let json = serde_json::to_string_pretty(records)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(&path, json)?;
        Ok(path)
    }

    /// Load every archived record under the archive path (operator recovery)
    pub fn read_archive(archive_path: &Path) -> std::io::Result<Vec<Memory>> {
        let mut memories = Vec::new();
        if !archive_path.exists() {
            return Ok(memories);
        }
        for entry in std::fs::read_dir(archive_path)? {
            let entry = entry?;
            if entry.path().extension().is_some_and(|e| e == "json") {
                let raw = std::fs::read_to_string(entry.path())?;
                if let Ok(records) = serde_json::from_str::<Vec<ArchivedMemory>>(&raw) {
                    memories.extend(records.into_iter().map(|r| r.memory));
                }
            }
        }
        Ok(memories)
    }
}

fn is_protected(memory: &Memory) -> bool {
    memory.tags.iter().any(|t| t.eq_ignore_ascii_case("protected"))
        || memory
            .metadata
            .get("protected")
            .and_then(MetadataValue::as_bool)
            .unwrap_or(false)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn engine(dir: &TempDir) -> ForgettingEngine {
        ForgettingEngine::new(ConsolidationConfig {
            archive_path: dir.path().to_path_buf(),
            relevance_threshold: 0.1,
            access_threshold_days: 90.0,
            ..Default::default()
        })
    }

    fn scored(memory: &Memory, total: f64) -> RelevanceScore {
        RelevanceScore {
            memory_hash: memory.content_hash.clone(),
            total_score: total,
            base_importance: 1.0,
            decay_factor: total,
            connection_boost: 1.0,
            access_boost: 1.0,
            metadata: BTreeMap::new(),
        }
    }

    fn stale(content: &str) -> Memory {
        let old = now_timestamp() - 200.0 * 86_400.0;
        let mut m = Memory::new(content, vec![], None).with_created_at(old);
        m.updated_at = old;
        m
    }

    #[test]
    fn test_low_relevance_idle_memory_archived() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let memory = stale("long forgotten fact");
        let decisions = engine
            .process(
                std::slice::from_ref(&memory),
                &[scored(&memory, 0.05)],
                &HashMap::new(),
                TimeHorizon::Monthly,
            )
            .unwrap();
        assert_eq!(decisions[0].action, ForgettingAction::Archived);

        // The archive file holds the full memory
        let recovered = ForgettingEngine::read_archive(dir.path()).unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].content_hash, memory.content_hash);
    }

    #[test]
    fn test_relevant_memory_kept() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let memory = stale("still relevant");
        let decisions = engine
            .process(
                std::slice::from_ref(&memory),
                &[scored(&memory, 0.8)],
                &HashMap::new(),
                TimeHorizon::Monthly,
            )
            .unwrap();
        assert_eq!(decisions[0].action, ForgettingAction::Kept);
        assert!(ForgettingEngine::read_archive(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn test_recent_access_blocks_forgetting() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let memory = stale("recently touched");
        let mut access = HashMap::new();
        access.insert(memory.content_hash.clone(), now_timestamp() - 5.0 * 86_400.0);
        let decisions = engine
            .process(
                std::slice::from_ref(&memory),
                &[scored(&memory, 0.05)],
                &access,
                TimeHorizon::Monthly,
            )
            .unwrap();
        assert_eq!(decisions[0].action, ForgettingAction::Kept);
    }

    #[test]
    fn test_protected_never_forgotten() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let mut memory = stale("protected record");
        memory.tags.push("protected".to_string());
        let decisions = engine
            .process(
                std::slice::from_ref(&memory),
                &[scored(&memory, 0.0)],
                &HashMap::new(),
                TimeHorizon::Yearly,
            )
            .unwrap();
        assert_eq!(decisions[0].action, ForgettingAction::Kept);
        assert_eq!(decisions[0].reason, "protected");
    }

    #[test]
    fn test_unscored_memory_kept() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let memory = stale("no score available");
        let decisions = engine
            .process(
                std::slice::from_ref(&memory),
                &[],
                &HashMap::new(),
                TimeHorizon::Monthly,
            )
            .unwrap();
        assert_eq!(decisions[0].action, ForgettingAction::Kept);
    }
}
