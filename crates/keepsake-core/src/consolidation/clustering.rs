//! Semantic clustering
//!
//! Groups semantically close memories for the compression phase. Two
//! algorithms, chosen by configuration: a density-based DBSCAN over cosine
//! distance, and a simpler greedy threshold grouping. Clusters below the
//! minimum size are discarded.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::embeddings::cosine_similarity;

use super::ConsolidationConfig;

/// Clustering algorithm selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusteringAlgorithm {
    /// Density-based clustering (DBSCAN)
    #[default]
    Dbscan,
    /// Greedy similarity-threshold grouping
    SimpleThreshold,
}

/// A group of semantically close memories
#[derive(Debug, Clone)]
pub struct MemoryCluster {
    /// Member hashes, sorted for deterministic downstream output
    pub memory_hashes: Vec<String>,
    /// Mean of member vectors
    pub centroid: Vec<f32>,
    /// Mean pairwise similarity of members
    pub cohesion: f64,
}

/// Clustering engine
pub struct ClusteringEngine {
    config: ConsolidationConfig,
}

impl ClusteringEngine {
    /// Create an engine from pipeline configuration
    pub fn new(config: ConsolidationConfig) -> Self {
        Self { config }
    }

    /// Cluster the given embeddings. Hashes without vectors are ignored.
    pub fn process(&self, embeddings: &HashMap<String, Vec<f32>>) -> Vec<MemoryCluster> {
        // Sort for run-to-run determinism
        let mut items: Vec<(&String, &Vec<f32>)> = embeddings.iter().collect();
        items.sort_by(|a, b| a.0.cmp(b.0));

        let groups = match self.config.clustering_algorithm {
            ClusteringAlgorithm::Dbscan => self.dbscan(&items),
            ClusteringAlgorithm::SimpleThreshold => self.simple_threshold(&items),
        };

        let clusters: Vec<MemoryCluster> = groups
            .into_iter()
            .filter(|g| g.len() >= self.config.min_cluster_size)
            .map(|group| build_cluster(&group, embeddings))
            .collect();

        tracing::info!(
            memories = items.len(),
            clusters = clusters.len(),
            algorithm = ?self.config.clustering_algorithm,
            "clustering complete"
        );
        clusters
    }

    /// DBSCAN with cosine similarity as the closeness measure.
    /// `eps` is the configured similarity threshold; `min_pts` the cluster
    /// size gate.
    fn dbscan(&self, items: &[(&String, &Vec<f32>)]) -> Vec<Vec<String>> {
        let n = items.len();
        let threshold = self.config.cluster_similarity_threshold as f32;
        let min_pts = self.config.min_cluster_size;

        // Neighborhoods by similarity threshold
        let neighbors: Vec<Vec<usize>> = (0..n)
            .map(|i| {
                (0..n)
                    .filter(|&j| {
                        j != i && cosine_similarity(items[i].1, items[j].1) >= threshold
                    })
                    .collect()
            })
            .collect();

        const UNVISITED: i32 = -2;
        const NOISE: i32 = -1;
        let mut labels = vec![UNVISITED; n];
        let mut cluster_id = 0i32;

        for i in 0..n {
            if labels[i] != UNVISITED {
                continue;
            }
            if neighbors[i].len() + 1 < min_pts {
                labels[i] = NOISE;
                continue;
            }
            labels[i] = cluster_id;
            let mut frontier: Vec<usize> = neighbors[i].clone();
            while let Some(j) = frontier.pop() {
                if labels[j] == NOISE {
                    labels[j] = cluster_id;
                }
                if labels[j] != UNVISITED {
                    continue;
                }
                labels[j] = cluster_id;
                if neighbors[j].len() + 1 >= min_pts {
                    frontier.extend(neighbors[j].iter().copied());
                }
            }
            cluster_id += 1;
        }

        let mut groups: Vec<Vec<String>> = vec![vec![]; cluster_id as usize];
        for (i, label) in labels.iter().enumerate() {
            if *label >= 0 {
                groups[*label as usize].push(items[i].0.clone());
            }
        }
        groups
    }

    /// Greedy grouping: each unassigned memory seeds a cluster holding every
    /// remaining memory within the similarity threshold of the seed.
    fn simple_threshold(&self, items: &[(&String, &Vec<f32>)]) -> Vec<Vec<String>> {
        let threshold = self.config.cluster_similarity_threshold as f32;
        let mut assigned = vec![false; items.len()];
        let mut groups = Vec::new();

        for i in 0..items.len() {
            if assigned[i] {
                continue;
            }
            let mut group = vec![items[i].0.clone()];
            assigned[i] = true;
            for j in (i + 1)..items.len() {
                if assigned[j] {
                    continue;
                }
                if cosine_similarity(items[i].1, items[j].1) >= threshold {
                    group.push(items[j].0.clone());
                    assigned[j] = true;
                }
            }
            groups.push(group);
        }
        groups
    }
}

fn build_cluster(hashes: &[String], embeddings: &HashMap<String, Vec<f32>>) -> MemoryCluster {
    let mut hashes: Vec<String> = hashes.to_vec();
    hashes.sort();

    let vectors: Vec<&Vec<f32>> = hashes.iter().filter_map(|h| embeddings.get(h)).collect();
    let dims = vectors.first().map(|v| v.len()).unwrap_or(0);
    let mut centroid = vec![0f32; dims];
    for vector in &vectors {
        for (slot, value) in centroid.iter_mut().zip(vector.iter()) {
            *slot += value;
        }
    }
    let count = vectors.len().max(1) as f32;
    for slot in &mut centroid {
        *slot /= count;
    }

    let mut similarity_sum = 0.0;
    let mut pairs = 0usize;
    for i in 0..vectors.len() {
        for j in (i + 1)..vectors.len() {
            similarity_sum += f64::from(cosine_similarity(vectors[i], vectors[j]));
            pairs += 1;
        }
    }
    let cohesion = if pairs > 0 {
        similarity_sum / pairs as f64
    } else {
        1.0
    };

    MemoryCluster {
        memory_hashes: hashes,
        centroid,
        cohesion,
    }
}

// ============================================================================
// TESTS
// ============================================================================
