//! Cluster compression
//!
//! Synthesizes one compressed summary memory per qualifying cluster. The
//! summary leads with each member's opening sentence (until the length
//! budget runs out), carries the union of member tags, and links back to
//! every source via `source_memory_hashes` metadata. Originals are retained;
//! the forgetting phase decides their fate separately.

use crate::memory::{iso_from_timestamp, now_timestamp, Memory};

use super::{ConsolidationConfig, MemoryCluster};

/// Outcome of compressing one cluster
#[derive(Debug, Clone)]
pub struct CompressionResult {
    /// The synthesized summary memory
    pub compressed_memory: Memory,
    /// Hashes of the source memories
    pub source_hashes: Vec<String>,
    /// Summary length over combined source length
    pub compression_ratio: f64,
}

/// First sentence (or line) of a text, whichever ends sooner
fn opening_sentence(text: &str) -> &str {
    let line = text.lines().next().unwrap_or(text);
    match line.find(['.', '!', '?']) {
        Some(pos) => &line[..=pos],
        None => line,
    }
}

/// Compression engine
pub struct CompressionEngine {
    config: ConsolidationConfig,
}

impl CompressionEngine {
    /// Create an engine from pipeline configuration
    pub fn new(config: ConsolidationConfig) -> Self {
        Self { config }
    }

    /// Compress every cluster that meets the size threshold.
    /// `memories` must contain the cluster members (missing members are
    /// skipped, and a cluster reduced below the threshold is dropped).
    pub fn process(
        &self,
        clusters: &[MemoryCluster],
        memories: &[Memory],
    ) -> Vec<CompressionResult> {
        let by_hash: std::collections::HashMap<&str, &Memory> = memories
            .iter()
            .map(|m| (m.content_hash.as_str(), m))
            .collect();

        let mut results = Vec::new();
        for cluster in clusters {
            let members: Vec<&Memory> = cluster
                .memory_hashes
                .iter()
                .filter_map(|h| by_hash.get(h.as_str()).copied())
                .collect();
            if members.len() < self.config.min_cluster_size {
                continue;
            }
            results.push(self.compress_cluster(cluster, &members));
        }

        tracing::info!(
            clusters = clusters.len(),
            compressed = results.len(),
            "compression complete"
        );
        results
    }

    fn compress_cluster(&self, cluster: &MemoryCluster, members: &[&Memory]) -> CompressionResult {
        let budget = self.config.max_summary_length;
        let header = format!("Summary of {} related memories: ", members.len());
        let mut summary = header.clone();

        for member in members {
            let sentence = opening_sentence(&member.content).trim();
            if sentence.is_empty() {
                continue;
            }
            let addition = if summary.len() == header.len() {
                sentence.to_string()
            } else {
                format!(" {sentence}")
            };
            if summary.chars().count() + addition.chars().count() > budget {
                break;
            }
            summary.push_str(&addition);
        }
        // Hard ceiling even when a single opening sentence overruns
        if summary.chars().count() > budget {
            summary = summary.chars().take(budget).collect();
        }

        let mut tags: Vec<String> = Vec::new();
        for member in members {
            for tag in &member.tags {
                if !tags.contains(tag) {
                    tags.push(tag.clone());
                }
            }
        }
        tags.push("compressed".to_string());

        let source_hashes: Vec<String> = cluster.memory_hashes.clone();
        let combined_length: usize = members.iter().map(|m| m.content.chars().count()).sum();
        let now = now_timestamp();

        let compressed_memory = Memory::new(summary.clone(), tags, Some("summary".to_string()))
            .with_metadata("source_memory_hashes", source_hashes.join(","))
            .with_metadata("cluster_size", members.len() as i64)
            .with_metadata("cluster_cohesion", cluster.cohesion)
            .with_metadata("compressed_at", iso_from_timestamp(now));

        let compression_ratio = if combined_length > 0 {
            summary.chars().count() as f64 / combined_length as f64
        } else {
            1.0
        };

        CompressionResult {
            compressed_memory,
            source_hashes,
            compression_ratio,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
